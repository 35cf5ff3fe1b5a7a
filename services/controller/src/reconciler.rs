//! Reconciler entry point.
//!
//! One cycle for one declaration:
//! 1. Read the declaration; give up if it is gone or terminating
//! 2. Resolve the desired workload and subordinate (malformed declarations stop here)
//! 3. Collect observed units and subordinate
//! 4. Plan and apply workload actions
//! 5. Drive the subordinate
//! 6. Write status when it changed

use std::sync::Arc;
use std::time::Duration;

use appctl_api::{App, AppStatus, ObjectKey};
use appctl_reconcile::{
    plan_workload, DesiredWorkload, SubordinatePolicy, SubordinateState, DEFAULT_DELETE_POLL_INTERVAL,
    DEFAULT_MAX_CONFLICT_RETRIES, DEFAULT_REDIS_IMAGE,
};
use tracing::{debug, info, instrument, warn};

use crate::client::ControlPlane;
use crate::collector::ObservedStateCollector;
use crate::confirm::DeletionConfirmer;
use crate::context::ReconcileContext;
use crate::error::{guarded, ReconcileError, ReconcileResult};
use crate::executor::{ActionExecutor, ReconcileReport};
use crate::subordinate::DependentResourceManager;
use crate::ticker::Ticker;

/// What the caller should do after a successful cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Converged; wait for the next change or resync.
    Done,
    /// Run again after the delay.
    RequeueAfter(Duration),
}

/// Outcome of a successful cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    pub action: ReconcileAction,
    pub report: ReconcileReport,
}

/// Settings for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub redis_image: String,
    pub subordinate_policy: SubordinatePolicy,
    pub max_conflict_retries: u32,
    /// Delay before revisiting a declaration whose deletions were not confirmed.
    pub unconfirmed_requeue: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            redis_image: DEFAULT_REDIS_IMAGE.to_string(),
            subordinate_policy: SubordinatePolicy::default(),
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            unconfirmed_requeue: DEFAULT_DELETE_POLL_INTERVAL,
        }
    }
}

/// Converges the children of a declaration toward what it declares.
pub struct Reconciler {
    client: Arc<dyn ControlPlane>,
    collector: ObservedStateCollector,
    executor: ActionExecutor,
    subordinates: DependentResourceManager,
    unconfirmed_requeue: Duration,
}

impl Reconciler {
    /// Create a reconciler around a control-plane client.
    ///
    /// `ticker` paces deletion confirmation.
    pub fn new(client: Arc<dyn ControlPlane>, ticker: Arc<dyn Ticker>, settings: ReconcilerSettings) -> Self {
        let confirmer = DeletionConfirmer::new(client.clone(), ticker);
        Self {
            collector: ObservedStateCollector::new(client.clone()),
            executor: ActionExecutor::new(client.clone(), confirmer, settings.max_conflict_retries),
            subordinates: DependentResourceManager::new(
                client.clone(),
                settings.subordinate_policy,
                settings.redis_image,
                settings.max_conflict_retries,
            ),
            client,
            unconfirmed_requeue: settings.unconfirmed_requeue,
        }
    }

    /// Reconcile the declaration `key` once.
    pub async fn reconcile(&self, key: &ObjectKey, ctx: &ReconcileContext) -> ReconcileResult<ReconcileAction> {
        self.run_cycle(key, ctx).await.map(|done| done.action)
    }

    /// Reconcile the declaration `key` once, reporting what changed.
    #[instrument(skip(self, ctx), fields(namespace = %key.namespace, name = %key.name))]
    pub async fn run_cycle(&self, key: &ObjectKey, ctx: &ReconcileContext) -> ReconcileResult<Reconciled> {
        let app = match guarded(ctx, self.client.get_app(key)).await {
            Ok(app) => app,
            Err(e) if e.is_not_found() => return Err(ReconcileError::DeclarationNotFound(key.clone())),
            Err(e) => return Err(e),
        };

        if app.metadata.is_terminating() {
            debug!("Declaration is terminating, leaving children to garbage collection");
            return Ok(Reconciled {
                action: ReconcileAction::Done,
                report: ReconcileReport::default(),
            });
        }

        let resolved = DesiredWorkload::from_app(&app)
            .and_then(|workload| Ok((workload, self.subordinates.desired(&app)?)));
        let (desired, desired_subordinate) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                let err = ReconcileError::plan(app.key(), e);
                if matches!(err, ReconcileError::Malformed { .. }) {
                    self.surface_error(ctx, &app, &err).await?;
                }
                return Err(err);
            }
        };

        let observed = self.collector.observe(ctx, &app).await?;
        let plan = plan_workload(&desired, &observed.units);
        debug!(
            observed = observed.units.len(),
            desired = desired.replicas,
            updates = plan.updates.len(),
            creates = plan.creates.len(),
            deletes = plan.deletes.len(),
            "Planned workload actions"
        );

        let mut report = ReconcileReport::default();
        self.executor.apply(ctx, &desired, plan, &mut report).await?;

        let subordinate = self
            .subordinates
            .ensure(
                ctx,
                desired_subordinate.as_ref(),
                observed.subordinate.as_ref(),
                &mut report,
            )
            .await?;

        let units = (observed.units.len() as u32 + report.created).saturating_sub(report.deleted);
        let status = AppStatus {
            observed_generation: app.metadata.generation,
            replicas: units,
            redis_deployed: subordinate == SubordinateState::Present,
            message: None,
        };
        self.write_status(ctx, &app, status).await?;

        if !report.is_noop() {
            info!(
                updated = report.updated,
                created = report.created,
                deleted = report.deleted,
                subordinate_created = report.subordinate_created,
                subordinate_updated = report.subordinate_updated,
                unconfirmed_deletions = report.unconfirmed_deletions,
                "Reconciliation complete"
            );
        }

        let action = if report.unconfirmed_deletions > 0 {
            ReconcileAction::RequeueAfter(self.unconfirmed_requeue)
        } else {
            ReconcileAction::Done
        };
        Ok(Reconciled { action, report })
    }

    /// Record a malformed-declaration error in the declaration's status.
    async fn surface_error(&self, ctx: &ReconcileContext, app: &App, err: &ReconcileError) -> ReconcileResult<()> {
        warn!(error = %err, "Declaration cannot be applied");
        let status = AppStatus {
            observed_generation: app.metadata.generation,
            message: Some(err.to_string()),
            ..app.status.clone()
        };
        self.write_status(ctx, app, status).await
    }

    /// Write `status` if it differs from the stored one.
    ///
    /// Status is informational: control-plane failures are logged, only an
    /// interrupted context is returned.
    async fn write_status(&self, ctx: &ReconcileContext, app: &App, status: AppStatus) -> ReconcileResult<()> {
        if app.status == status {
            return Ok(());
        }
        match guarded(ctx, self.client.update_app_status(&app.key(), &status)).await {
            Ok(()) => Ok(()),
            Err(e @ (ReconcileError::Cancelled | ReconcileError::DeadlineExceeded)) => Err(e),
            Err(e) => {
                warn!(error = %e, "Failed to write declaration status");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryControlPlane, Op};
    use crate::ticker::ImmediateTicker;
    use appctl_testing::{new_app, NAMESPACE};

    fn reconciler(plane: &Arc<InMemoryControlPlane>) -> Reconciler {
        Reconciler::new(
            plane.clone(),
            Arc::new(ImmediateTicker::new()),
            ReconcilerSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_missing_declaration() {
        let plane = Arc::new(InMemoryControlPlane::new());
        let err = reconciler(&plane)
            .reconcile(&ObjectKey::new(NAMESPACE, "ghost"), &ReconcileContext::background())
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::DeclarationNotFound(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_status_reflects_cycle() {
        let plane = Arc::new(InMemoryControlPlane::new());
        let app = plane.apply_app(&new_app("web", 2)).unwrap();

        let action = reconciler(&plane)
            .reconcile(&app.key(), &ReconcileContext::background())
            .await
            .unwrap();
        assert_eq!(action, ReconcileAction::Done);

        let stored = plane.get_app(&app.key()).await.unwrap();
        assert_eq!(
            stored.status,
            AppStatus {
                observed_generation: 1,
                replicas: 2,
                redis_deployed: false,
                message: None,
            }
        );
    }

    #[tokio::test]
    async fn test_converged_cycle_writes_no_status() {
        let plane = Arc::new(InMemoryControlPlane::new());
        let app = plane.apply_app(&new_app("web", 1)).unwrap();
        let reconciler = reconciler(&plane);
        let ctx = ReconcileContext::background();

        reconciler.reconcile(&app.key(), &ctx).await.unwrap();
        plane.clear_log();
        reconciler.reconcile(&app.key(), &ctx).await.unwrap();

        assert_eq!(plane.count(Op::UpdateAppStatus), 0);
    }
}

//! Dependent resource manager for the redis subordinate.

use std::sync::Arc;

use appctl_api::{App, Deployment};
use appctl_reconcile::{
    correct_replicas, plan_subordinate, subordinate_state, DesiredSubordinate, PlanError,
    SubordinateAction, SubordinatePolicy, SubordinateState,
};
use tracing::{debug, info};

use crate::client::{ClientError, ControlPlane};
use crate::context::ReconcileContext;
use crate::error::{guarded, ReconcileError, ReconcileResult};
use crate::executor::ReconcileReport;

/// Creates, and under [`SubordinatePolicy::SyncReplicas`] maintains, the subordinate.
pub struct DependentResourceManager {
    client: Arc<dyn ControlPlane>,
    policy: SubordinatePolicy,
    image: String,
    max_conflict_retries: u32,
}

impl DependentResourceManager {
    pub fn new(
        client: Arc<dyn ControlPlane>,
        policy: SubordinatePolicy,
        image: impl Into<String>,
        max_conflict_retries: u32,
    ) -> Self {
        Self {
            client,
            policy,
            image: image.into(),
            max_conflict_retries,
        }
    }

    /// Resolve the subordinate `app` asks for, with the configured image.
    pub fn desired(&self, app: &App) -> Result<Option<DesiredSubordinate>, PlanError> {
        DesiredSubordinate::from_app(app, &self.image)
    }

    /// Drive the subordinate one step toward `desired`, given what was observed.
    ///
    /// Returns the state the subordinate is in afterwards.
    pub async fn ensure(
        &self,
        ctx: &ReconcileContext,
        desired: Option<&DesiredSubordinate>,
        observed: Option<&Deployment>,
        report: &mut ReconcileReport,
    ) -> ReconcileResult<SubordinateState> {
        match plan_subordinate(desired, observed, self.policy) {
            SubordinateAction::None => {
                debug!(state = ?subordinate_state(observed), "Subordinate needs no action");
                Ok(subordinate_state(observed))
            }
            SubordinateAction::Create(deployment) => {
                match guarded(ctx, self.client.create_deployment(&deployment)).await {
                    Ok(created) => {
                        info!(
                            namespace = %created.metadata.namespace,
                            name = %created.metadata.name,
                            replicas = created.spec.replicas,
                            "Created subordinate"
                        );
                        report.subordinate_created = true;
                    }
                    // Created since we looked; the next cycle sees it.
                    Err(ReconcileError::Client(ClientError::AlreadyExists { .. })) => {
                        debug!(name = %deployment.metadata.name, "Subordinate appeared concurrently");
                    }
                    Err(e) => return Err(e),
                }
                Ok(SubordinateState::Present)
            }
            SubordinateAction::Update(deployment) => {
                // Update is only planned when a subordinate is desired.
                let Some(desired) = desired else {
                    return Ok(subordinate_state(observed));
                };
                if self.update_replicas(ctx, desired, deployment).await? {
                    report.subordinate_updated = true;
                }
                Ok(SubordinateState::Present)
            }
        }
    }

    /// Write corrected replicas, re-reading and retrying on conflict.
    ///
    /// Returns false if the subordinate vanished or was corrected by
    /// someone else.
    async fn update_replicas(
        &self,
        ctx: &ReconcileContext,
        desired: &DesiredSubordinate,
        deployment: Deployment,
    ) -> ReconcileResult<bool> {
        let key = deployment.key();
        let mut candidate = deployment;
        let mut conflicts = 0;

        loop {
            match guarded(ctx, self.client.update_deployment(&candidate)).await {
                Ok(updated) => {
                    info!(
                        namespace = %key.namespace,
                        name = %key.name,
                        replicas = updated.spec.replicas,
                        "Corrected subordinate replicas"
                    );
                    return Ok(true);
                }
                Err(e) if e.is_not_found() => return Ok(false),
                Err(e) if e.is_conflict() => {
                    conflicts += 1;
                    if conflicts > self.max_conflict_retries {
                        return Err(ReconcileError::ConflictRetriesExhausted {
                            kind: "Deployment",
                            key,
                            attempts: conflicts,
                        });
                    }
                    let fresh = match guarded(ctx, self.client.get_deployment(&key)).await {
                        Ok(fresh) => fresh,
                        Err(e) if e.is_not_found() => return Ok(false),
                        Err(e) => return Err(e),
                    };
                    match correct_replicas(desired, &fresh) {
                        Some(corrected) => candidate = corrected,
                        None => return Ok(false),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

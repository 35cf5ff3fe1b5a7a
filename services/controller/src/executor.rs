//! Applies a workload plan against the control plane.
//!
//! Actions run strictly in plan order: updates, then creates, then deletes.
//! The first fatal error stops the remaining actions; nothing already
//! applied is rolled back.

use std::sync::Arc;

use appctl_api::{ObjectKey, Pod};
use appctl_reconcile::{unit_index, unit_name, DesiredWorkload, WorkloadAction, WorkloadPlan};
use tracing::{debug, info, warn};

use crate::client::{ClientError, ControlPlane};
use crate::confirm::DeletionConfirmer;
use crate::context::ReconcileContext;
use crate::error::{guarded, ReconcileError, ReconcileResult};

/// What one cycle changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub updated: u32,
    pub created: u32,
    pub deleted: u32,
    pub subordinate_created: bool,
    pub subordinate_updated: bool,
    /// Deletes issued whose completion could not be confirmed.
    pub unconfirmed_deletions: u32,
}

impl ReconcileReport {
    /// Returns true if the cycle wrote nothing.
    pub fn is_noop(&self) -> bool {
        self.updated == 0
            && self.created == 0
            && self.deleted == 0
            && !self.subordinate_created
            && !self.subordinate_updated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateOutcome {
    Updated,
    /// Someone else already wrote the desired values.
    AlreadyCurrent,
    Gone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeleteOutcome {
    Confirmed,
    Unconfirmed,
    AlreadyGone,
}

/// Executes workload actions.
pub struct ActionExecutor {
    client: Arc<dyn ControlPlane>,
    confirmer: DeletionConfirmer,
    max_conflict_retries: u32,
}

impl ActionExecutor {
    pub fn new(
        client: Arc<dyn ControlPlane>,
        confirmer: DeletionConfirmer,
        max_conflict_retries: u32,
    ) -> Self {
        Self {
            client,
            confirmer,
            max_conflict_retries,
        }
    }

    /// Apply every action of `plan`, recording what happened in `report`.
    pub async fn apply(
        &self,
        ctx: &ReconcileContext,
        desired: &DesiredWorkload,
        plan: WorkloadPlan,
        report: &mut ReconcileReport,
    ) -> ReconcileResult<()> {
        for action in plan.into_actions() {
            let kind = action.kind();
            match action {
                WorkloadAction::Update(unit) => {
                    let key = unit.key();
                    match self.update_unit(ctx, desired, unit).await? {
                        UpdateOutcome::Updated => {
                            info!(namespace = %key.namespace, name = %key.name, action = kind, "Corrected workload unit drift");
                            report.updated += 1;
                        }
                        UpdateOutcome::AlreadyCurrent => {
                            debug!(namespace = %key.namespace, name = %key.name, "Workload unit already current")
                        }
                        UpdateOutcome::Gone => {
                            debug!(namespace = %key.namespace, name = %key.name, "Workload unit vanished before update")
                        }
                    }
                }
                WorkloadAction::Create(unit) => {
                    let created = self.create_unit(ctx, desired, unit).await?;
                    info!(
                        namespace = %created.metadata.namespace,
                        name = %created.metadata.name,
                        action = kind,
                        "Created workload unit"
                    );
                    report.created += 1;
                }
                WorkloadAction::Delete(key) => match self.delete_unit(ctx, &key).await? {
                    DeleteOutcome::Confirmed => {
                        info!(namespace = %key.namespace, name = %key.name, action = kind, "Deleted workload unit");
                        report.deleted += 1;
                    }
                    DeleteOutcome::Unconfirmed => {
                        report.deleted += 1;
                        report.unconfirmed_deletions += 1;
                    }
                    DeleteOutcome::AlreadyGone => {
                        debug!(namespace = %key.namespace, name = %key.name, "Workload unit already deleted")
                    }
                },
            }
        }
        Ok(())
    }

    /// Write a drift-corrected unit, re-reading and retrying on conflict.
    async fn update_unit(
        &self,
        ctx: &ReconcileContext,
        desired: &DesiredWorkload,
        unit: Pod,
    ) -> ReconcileResult<UpdateOutcome> {
        let key = unit.key();
        let mut candidate = unit;
        let mut conflicts = 0;

        loop {
            match guarded(ctx, self.client.update_pod(&candidate)).await {
                Ok(_) => return Ok(UpdateOutcome::Updated),
                Err(e) if e.is_not_found() => return Ok(UpdateOutcome::Gone),
                Err(e) if e.is_conflict() => {
                    conflicts += 1;
                    if conflicts > self.max_conflict_retries {
                        return Err(ReconcileError::ConflictRetriesExhausted {
                            kind: "Pod",
                            key,
                            attempts: conflicts,
                        });
                    }
                    debug!(name = %key.name, conflicts, error = %e, "Update conflicted, re-reading unit");

                    let mut fresh = match guarded(ctx, self.client.get_pod(&key)).await {
                        Ok(pod) => pod,
                        Err(e) if e.is_not_found() => return Ok(UpdateOutcome::Gone),
                        Err(e) => return Err(e),
                    };
                    if !desired.correct_drift(&mut fresh) {
                        return Ok(UpdateOutcome::AlreadyCurrent);
                    }
                    candidate = fresh;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Create a unit, moving to the next index while its name is taken.
    ///
    /// The planner only avoids names of observed units; an object outside
    /// the selector can still hold one.
    async fn create_unit(
        &self,
        ctx: &ReconcileContext,
        desired: &DesiredWorkload,
        unit: Pod,
    ) -> ReconcileResult<Pod> {
        let mut candidate = unit;
        let mut collisions = 0;

        loop {
            match guarded(ctx, self.client.create_pod(&candidate)).await {
                Ok(created) => return Ok(created),
                Err(e @ ReconcileError::Client(ClientError::AlreadyExists { .. })) => {
                    collisions += 1;
                    let next = unit_index(&desired.app_name, candidate.name()).map(|index| index + 1);
                    let Some(index) = next.filter(|_| collisions <= self.max_conflict_retries) else {
                        return Err(e);
                    };
                    debug!(name = %candidate.name(), collisions, "Unit name taken, trying the next index");
                    candidate = desired.new_unit(unit_name(&desired.app_name, index));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Delete a unit and wait for it to disappear.
    ///
    /// A confirmation failure is logged and reported, never fatal.
    async fn delete_unit(&self, ctx: &ReconcileContext, key: &ObjectKey) -> ReconcileResult<DeleteOutcome> {
        match guarded(ctx, self.client.delete_pod(key)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(DeleteOutcome::AlreadyGone),
            Err(e) => return Err(e),
        }

        match self.confirmer.wait_for_deletion(ctx, key).await {
            Ok(checks) => {
                debug!(name = %key.name, checks, "Deletion confirmed");
                Ok(DeleteOutcome::Confirmed)
            }
            Err(e) => {
                warn!(namespace = %key.namespace, name = %key.name, error = %e, "Could not confirm workload unit deletion");
                Ok(DeleteOutcome::Unconfirmed)
            }
        }
    }
}

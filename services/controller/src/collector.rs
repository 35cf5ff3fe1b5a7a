//! Observed-state collection.

use std::sync::Arc;

use appctl_api::{App, Deployment, Pod};
use tracing::debug;

use crate::client::{optional, ControlPlane};
use crate::context::ReconcileContext;
use crate::error::{guarded, ReconcileResult};

/// What currently exists for one declaration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservedState {
    /// Units carrying the declaration's owner label, in list order.
    pub units: Vec<Pod>,
    /// The dependent subordinate, if it exists.
    pub subordinate: Option<Deployment>,
}

/// Read-only view of the children of a declaration.
pub struct ObservedStateCollector {
    client: Arc<dyn ControlPlane>,
}

impl ObservedStateCollector {
    pub fn new(client: Arc<dyn ControlPlane>) -> Self {
        Self { client }
    }

    /// Collect the units and subordinate of `app`.
    ///
    /// A missing subordinate is not an error. Any other failure aborts the
    /// cycle.
    pub async fn observe(&self, ctx: &ReconcileContext, app: &App) -> ReconcileResult<ObservedState> {
        let selector = app.unit_selector();
        let units = guarded(ctx, self.client.list_pods(app.namespace(), &selector)).await?;

        let redis_key = app.redis_key();
        let subordinate = guarded(ctx, async {
            optional(self.client.get_deployment(&redis_key).await)
        })
        .await?;

        debug!(
            units = units.len(),
            subordinate = subordinate.is_some(),
            "Collected observed state"
        );
        Ok(ObservedState { units, subordinate })
    }
}

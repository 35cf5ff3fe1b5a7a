//! Deletion confirmation.
//!
//! Deletion in the control plane is asynchronous: an accepted delete does
//! not mean the pod is gone. The confirmer polls until a read reports
//! NotFound, pacing itself with a [`Ticker`], or gives up when the cycle's
//! context ends.

use std::sync::Arc;

use appctl_api::ObjectKey;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::client::{ClientError, ControlPlane};
use crate::context::{Interrupted, ReconcileContext};
use crate::ticker::Ticker;

/// Why a deletion could not be confirmed.
#[derive(Debug, Error)]
pub enum ConfirmError {
    #[error("gave up waiting for pod {key} to go away: {reason}")]
    Interrupted { key: ObjectKey, reason: Interrupted },

    #[error("existence check failed: {0}")]
    Client(#[from] ClientError),
}

/// Waits for deleted workload units to disappear.
pub struct DeletionConfirmer {
    client: Arc<dyn ControlPlane>,
    ticker: Arc<dyn Ticker>,
}

impl DeletionConfirmer {
    pub fn new(client: Arc<dyn ControlPlane>, ticker: Arc<dyn Ticker>) -> Self {
        Self { client, ticker }
    }

    /// Block until `key` is gone or `ctx` ends.
    ///
    /// Returns the number of existence checks made.
    #[instrument(skip(self, ctx), fields(key = %key))]
    pub async fn wait_for_deletion(
        &self,
        ctx: &ReconcileContext,
        key: &ObjectKey,
    ) -> Result<u32, ConfirmError> {
        let interrupted = |reason: Interrupted| ConfirmError::Interrupted {
            key: key.clone(),
            reason,
        };

        let mut checks = 0;
        loop {
            tokio::select! {
                biased;
                reason = ctx.done() => return Err(interrupted(reason)),
                _ = self.ticker.tick() => {}
            }

            checks += 1;
            match ctx.run(self.client.get_pod(key)).await.map_err(interrupted)? {
                Ok(_) => debug!(checks, "Pod still present"),
                Err(e) if e.is_not_found() => return Ok(checks),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryControlPlane, Op};
    use crate::ticker::{ImmediateTicker, StalledTicker};
    use appctl_testing::{pod, NAMESPACE};
    use std::time::Duration;

    async fn plane_with_deleted_pod(lag: u32) -> Arc<InMemoryControlPlane> {
        let plane = Arc::new(InMemoryControlPlane::new().with_deletion_lag(lag));
        plane.insert_pod(&pod("web", 0, "nginx:1")).unwrap();
        plane.delete_pod(&ObjectKey::new(NAMESPACE, "web-0")).await.unwrap();
        plane
    }

    #[tokio::test]
    async fn test_confirms_after_lag() {
        let plane = plane_with_deleted_pod(2).await;
        let ticker = Arc::new(ImmediateTicker::new());
        let confirmer = DeletionConfirmer::new(plane.clone(), ticker.clone());

        let checks = confirmer
            .wait_for_deletion(&ReconcileContext::background(), &ObjectKey::new(NAMESPACE, "web-0"))
            .await
            .unwrap();

        assert_eq!(checks, 3);
        assert_eq!(ticker.ticks(), 3);
        assert_eq!(plane.count(Op::GetPod), 3);
    }

    #[tokio::test]
    async fn test_deadline_ends_wait() {
        let plane = plane_with_deleted_pod(1).await;
        let confirmer = DeletionConfirmer::new(plane.clone(), Arc::new(StalledTicker));
        let ctx = ReconcileContext::background().with_timeout(Duration::from_millis(20));

        let err = confirmer
            .wait_for_deletion(&ctx, &ObjectKey::new(NAMESPACE, "web-0"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ConfirmError::Interrupted {
                reason: Interrupted::DeadlineExceeded,
                ..
            }
        ));
        assert_eq!(plane.count(Op::GetPod), 0);
    }

    #[tokio::test]
    async fn test_check_error_ends_wait() {
        let plane = plane_with_deleted_pod(5).await;
        plane.fail_next(Op::GetPod, ClientError::Unavailable("down".to_string()), 1);
        let confirmer = DeletionConfirmer::new(plane.clone(), Arc::new(ImmediateTicker::new()));

        let err = confirmer
            .wait_for_deletion(&ReconcileContext::background(), &ObjectKey::new(NAMESPACE, "web-0"))
            .await
            .unwrap_err();

        assert!(matches!(err, ConfirmError::Client(ClientError::Unavailable(_))));
    }
}

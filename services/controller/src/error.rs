//! Reconciliation errors and their retry classification.

use std::future::Future;

use appctl_api::ObjectKey;
use appctl_reconcile::PlanError;
use thiserror::Error;

use crate::client::{ClientError, ClientResult};
use crate::context::{Interrupted, ReconcileContext};

/// Result type for reconciliation steps.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Errors that end a reconciliation cycle.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The declaration no longer exists.
    #[error("declaration {0} not found")]
    DeclarationNotFound(ObjectKey),

    /// The declaration cannot be applied until its author changes it.
    #[error("{key}: {source}")]
    Malformed {
        key: ObjectKey,
        #[source]
        source: PlanError,
    },

    /// Children cannot be linked to the declaration.
    #[error("{key}: {source}")]
    Ownership {
        key: ObjectKey,
        #[source]
        source: PlanError,
    },

    /// A control-plane call failed.
    #[error("control plane error: {0}")]
    Client(#[from] ClientError),

    /// An object kept changing under us.
    #[error("gave up writing {kind} {key} after {attempts} conflicts")]
    ConflictRetriesExhausted {
        kind: &'static str,
        key: ObjectKey,
        attempts: u32,
    },

    /// The cycle was cancelled.
    #[error("reconciliation cancelled")]
    Cancelled,

    /// The cycle ran past its deadline.
    #[error("reconciliation deadline exceeded")]
    DeadlineExceeded,
}

impl ReconcileError {
    /// Wrap a planning error for the declaration `key`.
    pub fn plan(key: ObjectKey, source: PlanError) -> Self {
        if source.is_malformed() {
            ReconcileError::Malformed { key, source }
        } else {
            ReconcileError::Ownership { key, source }
        }
    }

    /// Returns true if the work queue should retry the cycle with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            // A child vanishing mid-cycle is settled by the next observation.
            ReconcileError::Client(e) => e.is_transient() || e.is_not_found(),
            ReconcileError::Ownership { .. }
            | ReconcileError::ConflictRetriesExhausted { .. }
            | ReconcileError::DeadlineExceeded => true,
            ReconcileError::DeclarationNotFound(_)
            | ReconcileError::Malformed { .. }
            | ReconcileError::Cancelled => false,
        }
    }

    /// Returns true if the error came from a control-plane NotFound.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ReconcileError::Client(e) if e.is_not_found())
    }

    /// Returns true if the error came from a write conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ReconcileError::Client(e) if e.is_conflict())
    }
}

impl From<Interrupted> for ReconcileError {
    fn from(reason: Interrupted) -> Self {
        match reason {
            Interrupted::Cancelled => ReconcileError::Cancelled,
            Interrupted::DeadlineExceeded => ReconcileError::DeadlineExceeded,
        }
    }
}

/// Run a control-plane call under the cycle's context.
pub(crate) async fn guarded<T, F>(ctx: &ReconcileContext, call: F) -> ReconcileResult<T>
where
    F: Future<Output = ClientResult<T>>,
{
    Ok(ctx.run(call).await??)
}

#[cfg(test)]
mod tests {
    use super::*;
    use appctl_api::ApiError;

    fn key() -> ObjectKey {
        ObjectKey::new("default", "web")
    }

    #[test]
    fn test_retry_classification() {
        let malformed = ReconcileError::plan(key(), PlanError::Malformed(ApiError::EmptyQuantity));
        assert!(matches!(malformed, ReconcileError::Malformed { .. }));
        assert!(!malformed.is_retryable());

        let unavailable = ReconcileError::from(ClientError::Unavailable("down".to_string()));
        assert!(unavailable.is_retryable());

        let invalid = ReconcileError::from(ClientError::Invalid("bad".to_string()));
        assert!(!invalid.is_retryable());

        let taken = ReconcileError::from(ClientError::AlreadyExists { kind: "Pod", key: key() });
        assert!(taken.is_retryable());

        let vanished = ReconcileError::from(ClientError::NotFound { kind: "Pod", key: key() });
        assert!(vanished.is_retryable());

        assert!(!ReconcileError::DeclarationNotFound(key()).is_retryable());
        assert!(!ReconcileError::Cancelled.is_retryable());
        assert!(ReconcileError::DeadlineExceeded.is_retryable());
    }

    #[test]
    fn test_interrupted_conversion() {
        assert!(matches!(
            ReconcileError::from(Interrupted::Cancelled),
            ReconcileError::Cancelled
        ));
        assert!(matches!(
            ReconcileError::from(Interrupted::DeadlineExceeded),
            ReconcileError::DeadlineExceeded
        ));
    }
}

//! Planning errors.

use appctl_api::ApiError;
use thiserror::Error;

/// Errors that stop a plan from being computed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// The declaration holds a value that cannot be applied (bad quantity).
    #[error("malformed declaration: {0}")]
    Malformed(#[source] ApiError),

    /// The declaration cannot be linked as an owner.
    #[error("cannot set ownership: {0}")]
    Ownership(#[source] ApiError),
}

impl PlanError {
    /// Returns true if only a new declaration version can fix this error.
    pub fn is_malformed(&self) -> bool {
        matches!(self, PlanError::Malformed(_))
    }
}

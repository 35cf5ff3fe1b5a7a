//! Control-plane client interface.
//!
//! The reconciler never talks to a cluster directly; it is handed an
//! implementation of [`ControlPlane`]. The in-memory implementation in
//! [`crate::memory`] backs tests and the dev binary.

use appctl_api::{App, AppStatus, Deployment, LabelSelector, ObjectKey, Pod};
use async_trait::async_trait;
use thiserror::Error;

/// Result type for control-plane calls.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors returned by the control plane.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The object does not exist.
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: ObjectKey },

    /// An object with the same name already exists.
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: ObjectKey },

    /// The write was based on a stale version of the object.
    #[error("conflict writing {kind} {key}: {message}")]
    Conflict {
        kind: &'static str,
        key: ObjectKey,
        message: String,
    },

    /// The control plane could not be reached or failed internally.
    #[error("control plane unavailable: {0}")]
    Unavailable(String),

    /// The control plane rejected the request as invalid.
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict { .. })
    }

    /// Returns true if the failure reflects passing control-plane state, so
    /// repeating the call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Unavailable(_) | ClientError::Conflict { .. } | ClientError::AlreadyExists { .. }
        )
    }
}

/// Operations the reconciler needs from the control plane.
///
/// Writes that carry a `resource_version` are rejected with
/// [`ClientError::Conflict`] when the stored object has moved on.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Fetch a declaration.
    async fn get_app(&self, key: &ObjectKey) -> ClientResult<App>;

    /// List all declarations, across namespaces.
    async fn list_apps(&self) -> ClientResult<Vec<App>>;

    /// Write the status of a declaration.
    async fn update_app_status(&self, key: &ObjectKey, status: &AppStatus) -> ClientResult<()>;

    /// Fetch a workload unit.
    async fn get_pod(&self, key: &ObjectKey) -> ClientResult<Pod>;

    /// List workload units in a namespace matching a selector.
    async fn list_pods(&self, namespace: &str, selector: &LabelSelector) -> ClientResult<Vec<Pod>>;

    async fn create_pod(&self, pod: &Pod) -> ClientResult<Pod>;

    async fn update_pod(&self, pod: &Pod) -> ClientResult<Pod>;

    async fn delete_pod(&self, key: &ObjectKey) -> ClientResult<()>;

    /// Fetch a deployment.
    async fn get_deployment(&self, key: &ObjectKey) -> ClientResult<Deployment>;

    async fn create_deployment(&self, deployment: &Deployment) -> ClientResult<Deployment>;

    async fn update_deployment(&self, deployment: &Deployment) -> ClientResult<Deployment>;
}

/// Convert a NotFound result into `None`.
pub fn optional<T>(result: ClientResult<T>) -> ClientResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_maps_not_found() {
        let missing: ClientResult<u32> = Err(ClientError::NotFound {
            kind: "Pod",
            key: ObjectKey::new("default", "web-0"),
        });
        assert_eq!(optional(missing), Ok(None));
        assert_eq!(optional(Ok(1)), Ok(Some(1)));

        let down: ClientResult<u32> = Err(ClientError::Unavailable("timeout".to_string()));
        assert!(optional(down).is_err());
    }

    #[test]
    fn test_transient_classification() {
        assert!(ClientError::Unavailable("x".to_string()).is_transient());
        assert!(!ClientError::Invalid("x".to_string()).is_transient());
        assert!(!ClientError::NotFound {
            kind: "Pod",
            key: ObjectKey::new("default", "web-0"),
        }
        .is_transient());
    }
}

//! The `App` declaration: desired state authored by users.

use serde::{Deserialize, Serialize};

use crate::{ApiError, LabelSelector, ObjectKey, ObjectMeta, OwnerReference, Quantity};

/// API group/version of the declaration kind.
pub const API_VERSION: &str = "appctl.dev/v1alpha1";

/// Kind name of the declaration.
pub const KIND: &str = "App";

/// Label tying workload units to the declaration that owns them.
pub const OWNER_LABEL: &str = "app";

/// Label carrying `ui.color` on new workload units.
pub const COLOR_LABEL: &str = "color";

/// Annotation carrying `ui.message` on new workload units.
pub const MESSAGE_ANNOTATION: &str = "message";

/// Replica count used for the redis subordinate when none is given.
pub const DEFAULT_REDIS_REPLICAS: i32 = 1;

/// A declaration of how an application should run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: AppSpec,
    #[serde(default)]
    pub status: AppStatus,
}

/// Desired state of an [`App`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    /// Number of workload units to run.
    #[serde(default)]
    pub replica_count: u32,
    #[serde(default)]
    pub image: ImageSpec,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub ui: UiSpec,
    #[serde(default)]
    pub redis: RedisSpec,
}

/// Image repository and tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub repository: String,
    pub tag: String,
}

impl ImageSpec {
    /// The image reference, `repository:tag`.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

/// Resource quantities, kept as strings until a cycle needs them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    pub cpu_request: String,
    pub memory_limit: String,
}

impl ResourceSpec {
    pub fn cpu_request(&self) -> Result<Quantity, ApiError> {
        Quantity::parse(&self.cpu_request).map_err(|e| e.in_field("spec.resources.cpuRequest"))
    }

    pub fn memory_limit(&self) -> Result<Quantity, ApiError> {
        Quantity::parse(&self.memory_limit).map_err(|e| e.in_field("spec.resources.memoryLimit"))
    }
}

/// Presentation metadata stamped onto new workload units.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiSpec {
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub message: String,
}

/// Optional redis subordinate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_count: Option<i32>,
}

impl RedisSpec {
    /// Configured replica count, defaulting to one.
    pub fn replicas(&self) -> Result<i32, ApiError> {
        match self.replica_count {
            Some(value) if value < 0 => Err(ApiError::Negative {
                value: i64::from(value),
            }
            .in_field("spec.redis.replicaCount")),
            Some(value) => Ok(value),
            None => Ok(DEFAULT_REDIS_REPLICAS),
        }
    }
}

/// Observed state reported back onto the declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub redis_deployed: bool,
    /// Last reason the declaration could not be applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl App {
    /// Create a declaration with the given identity and spec.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: AppSpec) -> Self {
        Self {
            metadata: ObjectMeta::named(namespace, name),
            spec,
            status: AppStatus::default(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// Selector matching the workload units this declaration owns.
    pub fn unit_selector(&self) -> LabelSelector {
        LabelSelector::single(OWNER_LABEL, self.name())
    }

    /// Name of the redis subordinate.
    pub fn redis_name(&self) -> String {
        format!("{}-redis", self.name())
    }

    pub fn redis_key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace(), self.redis_name())
    }

    /// Controller owner reference pointing at this declaration.
    ///
    /// Fails if the control plane has not assigned a uid yet.
    pub fn owner_reference(&self) -> Result<OwnerReference, ApiError> {
        let uid = self.metadata.require_uid()?;
        Ok(OwnerReference {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            name: self.name().to_string(),
            uid: uid.to_string(),
            controller: true,
            block_owner_deletion: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_camel_case() {
        let app: App = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "web", "namespace": "default"},
            "spec": {
                "replicaCount": 3,
                "image": {"repository": "nginx", "tag": "1.27"},
                "resources": {"cpuRequest": "100m", "memoryLimit": "128Mi"},
                "ui": {"color": "blue", "message": "hello"},
                "redis": {"enabled": true}
            }
        }))
        .unwrap();

        assert_eq!(app.spec.replica_count, 3);
        assert_eq!(app.spec.image.reference(), "nginx:1.27");
        assert!(app.spec.redis.enabled);
        assert_eq!(app.spec.redis.replicas(), Ok(DEFAULT_REDIS_REPLICAS));
        assert_eq!(app.status, AppStatus::default());
    }

    #[test]
    fn test_negative_replica_count_rejected() {
        let parsed: Result<App, _> = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "web", "namespace": "default"},
            "spec": {"replicaCount": -1}
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_resource_errors_name_the_field() {
        let resources = ResourceSpec {
            cpu_request: "fast".to_string(),
            memory_limit: "128Mi".to_string(),
        };
        let err = resources.cpu_request().unwrap_err();
        assert!(matches!(
            &err,
            ApiError::InvalidField { source, .. } if matches!(**source, ApiError::InvalidQuantity { .. })
        ));
        assert!(err.to_string().contains("spec.resources.cpuRequest"));
        assert!(resources.memory_limit().is_ok());
    }

    #[test]
    fn test_negative_redis_replicas_name_the_field() {
        let redis = RedisSpec {
            enabled: true,
            replica_count: Some(-2),
        };
        let err = redis.replicas().unwrap_err();
        assert!(err.to_string().contains("spec.redis.replicaCount"));
        assert_eq!(
            RedisSpec {
                enabled: true,
                replica_count: Some(0),
            }
            .replicas(),
            Ok(0)
        );
    }

    #[test]
    fn test_owner_reference_requires_uid() {
        let mut app = App::new("default", "web", AppSpec::default());
        assert!(app.owner_reference().is_err());

        app.metadata.uid = Some("uid-1".to_string());
        let owner = app.owner_reference().unwrap();
        assert_eq!(owner.kind, KIND);
        assert_eq!(owner.uid, "uid-1");
        assert!(owner.controller);
    }

    #[test]
    fn test_redis_name() {
        let app = App::new("default", "web", AppSpec::default());
        assert_eq!(app.redis_name(), "web-redis");
        assert_eq!(app.redis_key(), ObjectKey::new("default", "web-redis"));
    }
}

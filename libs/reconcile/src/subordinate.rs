//! Planning for the redis subordinate.
//!
//! The subordinate is either absent or present. It moves from absent to
//! present when redis is enabled and nothing is found under its name. It
//! never moves back directly: removal only happens through garbage
//! collection when the owning declaration is deleted.

use std::collections::BTreeMap;

use appctl_api::{
    App, Container, Deployment, DeploymentSpec, LabelSelector, ObjectKey, ObjectMeta,
    OwnerReference, PodSpec, PodTemplateSpec, COMPONENT_LABEL, OWNER_LABEL, REDIS_CONTAINER,
};

use crate::PlanError;

/// Image used for the subordinate when none is configured.
pub const DEFAULT_REDIS_IMAGE: &str = "redis:latest";

/// How an existing subordinate is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubordinatePolicy {
    /// Create once, never touch afterwards.
    #[default]
    CreateOnly,

    /// Also correct replica drift on an existing subordinate.
    SyncReplicas,
}

impl std::str::FromStr for SubordinatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create-only" => Ok(Self::CreateOnly),
            "sync-replicas" => Ok(Self::SyncReplicas),
            other => Err(format!(
                "unknown subordinate policy '{other}' (expected create-only or sync-replicas)"
            )),
        }
    }
}

/// Lifecycle state of the subordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubordinateState {
    Absent,
    Present,
}

/// The subordinate a declaration asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredSubordinate {
    pub key: ObjectKey,
    pub replicas: i32,
    pub image: String,
    pub owner: OwnerReference,
}

impl DesiredSubordinate {
    /// Resolve the subordinate for a declaration, or `None` if redis is disabled.
    pub fn from_app(app: &App, image: &str) -> Result<Option<Self>, PlanError> {
        if !app.spec.redis.enabled {
            return Ok(None);
        }
        let replicas = app.spec.redis.replicas().map_err(PlanError::Malformed)?;
        let owner = app.owner_reference().map_err(PlanError::Ownership)?;
        Ok(Some(Self {
            key: app.redis_key(),
            replicas,
            image: image.to_string(),
            owner,
        }))
    }

    /// Build the deployment object to create.
    pub fn build(&self) -> Deployment {
        let mut pod_labels = BTreeMap::new();
        pod_labels.insert(OWNER_LABEL.to_string(), self.key.name.clone());
        pod_labels.insert(COMPONENT_LABEL.to_string(), "redis".to_string());

        let mut metadata = ObjectMeta::named(&self.key.namespace, &self.key.name);
        metadata.set_controller_ref(self.owner.clone());

        Deployment {
            metadata,
            spec: DeploymentSpec {
                replicas: self.replicas,
                selector: LabelSelector {
                    match_labels: pod_labels.clone(),
                },
                template: PodTemplateSpec {
                    metadata: ObjectMeta {
                        labels: pod_labels,
                        ..Default::default()
                    },
                    spec: PodSpec {
                        containers: vec![Container {
                            name: REDIS_CONTAINER.to_string(),
                            image: self.image.clone(),
                            ..Default::default()
                        }],
                    },
                },
            },
        }
    }
}

/// What to do about the subordinate this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubordinateAction {
    /// Leave things as they are.
    None,
    /// Create the subordinate.
    Create(Deployment),
    /// Write back an existing subordinate with corrected replicas.
    Update(Deployment),
}

/// Decide the subordinate action for one cycle.
pub fn plan_subordinate(
    desired: Option<&DesiredSubordinate>,
    observed: Option<&Deployment>,
    policy: SubordinatePolicy,
) -> SubordinateAction {
    let Some(desired) = desired else {
        return SubordinateAction::None;
    };
    match observed {
        None => SubordinateAction::Create(desired.build()),
        Some(existing) => match policy {
            SubordinatePolicy::CreateOnly => SubordinateAction::None,
            SubordinatePolicy::SyncReplicas => correct_replicas(desired, existing)
                .map_or(SubordinateAction::None, SubordinateAction::Update),
        },
    }
}

/// Copy of `existing` with replicas set to the desired count, if they differ.
pub fn correct_replicas(desired: &DesiredSubordinate, existing: &Deployment) -> Option<Deployment> {
    if existing.spec.replicas == desired.replicas {
        return None;
    }
    let mut corrected = existing.clone();
    corrected.spec.replicas = desired.replicas;
    Some(corrected)
}

/// State implied by an observation.
pub fn subordinate_state(observed: Option<&Deployment>) -> SubordinateState {
    if observed.is_some() {
        SubordinateState::Present
    } else {
        SubordinateState::Absent
    }
}

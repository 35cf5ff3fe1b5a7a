//! Desired workload resolved from a declaration.

use std::collections::BTreeMap;

use appctl_api::{
    App, Container, LabelSelector, ObjectMeta, OwnerReference, Pod, PodSpec, Quantity,
    ResourceRequirements, APP_CONTAINER, COLOR_LABEL, MESSAGE_ANNOTATION, OWNER_LABEL,
    RESOURCE_CPU, RESOURCE_MEMORY,
};

use crate::PlanError;

/// Everything a cycle needs to know about the declared workload.
///
/// Building one parses the declaration's quantity strings, so a value of
/// this type is proof that the declaration is applicable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredWorkload {
    pub namespace: String,
    pub app_name: String,
    pub replicas: u32,
    pub image: String,
    pub cpu_request: Quantity,
    pub memory_limit: Quantity,
    pub color: String,
    pub message: String,
    pub owner: OwnerReference,
}

impl DesiredWorkload {
    /// Resolve the desired workload of a declaration.
    pub fn from_app(app: &App) -> Result<Self, PlanError> {
        let resources = &app.spec.resources;
        let cpu_request = resources.cpu_request().map_err(PlanError::Malformed)?;
        let memory_limit = resources.memory_limit().map_err(PlanError::Malformed)?;
        let owner = app.owner_reference().map_err(PlanError::Ownership)?;

        Ok(Self {
            namespace: app.namespace().to_string(),
            app_name: app.name().to_string(),
            replicas: app.spec.replica_count,
            image: app.spec.image.reference(),
            cpu_request,
            memory_limit,
            color: app.spec.ui.color.clone(),
            message: app.spec.ui.message.clone(),
            owner,
        })
    }

    /// Selector matching this workload's units.
    pub fn selector(&self) -> LabelSelector {
        LabelSelector::single(OWNER_LABEL, &self.app_name)
    }

    /// Returns true if the unit's managed container differs from the declaration.
    ///
    /// Units without a managed container never drift.
    pub fn has_drift(&self, pod: &Pod) -> bool {
        let Some(container) = pod.app_container() else {
            return false;
        };
        container.image != self.image
            || container.resources.requests.get(RESOURCE_CPU) != Some(&self.cpu_request)
            || container.resources.limits.get(RESOURCE_MEMORY) != Some(&self.memory_limit)
    }

    /// Overwrite drifted fields of the managed container.
    ///
    /// Returns true if anything changed. Metadata is left alone.
    pub fn correct_drift(&self, pod: &mut Pod) -> bool {
        let Some(container) = pod.spec.container_mut(APP_CONTAINER) else {
            return false;
        };

        let mut changed = false;
        if container.image != self.image {
            container.image = self.image.clone();
            changed = true;
        }
        if container.resources.requests.get(RESOURCE_CPU) != Some(&self.cpu_request) {
            container
                .resources
                .requests
                .insert(RESOURCE_CPU.to_string(), self.cpu_request.clone());
            changed = true;
        }
        if container.resources.limits.get(RESOURCE_MEMORY) != Some(&self.memory_limit) {
            container
                .resources
                .limits
                .insert(RESOURCE_MEMORY.to_string(), self.memory_limit.clone());
            changed = true;
        }
        changed
    }

    /// Build a new unit with the given name, owned by the declaration.
    pub fn new_unit(&self, name: String) -> Pod {
        let mut labels = BTreeMap::new();
        labels.insert(OWNER_LABEL.to_string(), self.app_name.clone());
        labels.insert(COLOR_LABEL.to_string(), self.color.clone());

        let mut annotations = BTreeMap::new();
        annotations.insert(MESSAGE_ANNOTATION.to_string(), self.message.clone());

        let mut metadata = ObjectMeta {
            labels,
            annotations,
            ..ObjectMeta::named(&self.namespace, name)
        };
        metadata.set_controller_ref(self.owner.clone());

        let mut resources = ResourceRequirements::default();
        resources
            .requests
            .insert(RESOURCE_CPU.to_string(), self.cpu_request.clone());
        resources
            .limits
            .insert(RESOURCE_MEMORY.to_string(), self.memory_limit.clone());

        Pod {
            metadata,
            spec: PodSpec {
                containers: vec![Container {
                    name: APP_CONTAINER.to_string(),
                    image: self.image.clone(),
                    resources,
                }],
            },
        }
    }
}

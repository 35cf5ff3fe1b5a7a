//! Test fixtures shared across appctl crates.
//!
//! Every fixture lives in the `default` namespace. Declarations get the uid
//! `uid-<name>`, and units built here are owned by the matching declaration,
//! so fixtures line up with what the controller itself would create.

use appctl_api::{
    App, AppSpec, Container, Deployment, DeploymentSpec, ImageSpec, LabelSelector, ObjectMeta,
    OwnerReference, Pod, PodSpec, PodTemplateSpec, Quantity, ResourceRequirements, ResourceSpec,
    UiSpec, API_VERSION, APP_CONTAINER, COMPONENT_LABEL, KIND, OWNER_LABEL, REDIS_CONTAINER,
    RESOURCE_CPU, RESOURCE_MEMORY,
};

pub const NAMESPACE: &str = "default";
pub const IMAGE_REPOSITORY: &str = "nginx";
pub const IMAGE_TAG: &str = "1.27";
pub const CPU_REQUEST: &str = "100m";
pub const MEMORY_LIMIT: &str = "128Mi";

/// Uid assigned to the fixture declaration `name`.
pub fn uid_for(name: &str) -> String {
    format!("uid-{name}")
}

/// A declaration with a uid, as the control plane would return it.
pub fn app(name: &str, replicas: u32) -> App {
    let mut app = App::new(
        NAMESPACE,
        name,
        AppSpec {
            replica_count: replicas,
            image: ImageSpec {
                repository: IMAGE_REPOSITORY.to_string(),
                tag: IMAGE_TAG.to_string(),
            },
            resources: ResourceSpec {
                cpu_request: CPU_REQUEST.to_string(),
                memory_limit: MEMORY_LIMIT.to_string(),
            },
            ui: UiSpec {
                color: "blue".to_string(),
                message: "hello".to_string(),
            },
            redis: Default::default(),
        },
    );
    app.metadata.uid = Some(uid_for(name));
    app.metadata.generation = 1;
    app
}

/// Same as [`app`] but without a uid, ready to hand to a control plane's create.
pub fn new_app(name: &str, replicas: u32) -> App {
    let mut app = app(name, replicas);
    app.metadata.uid = None;
    app.metadata.generation = 0;
    app
}

/// Controller owner reference to the fixture declaration `name`.
pub fn owner_ref(name: &str) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: name.to_string(),
        uid: uid_for(name),
        controller: true,
        block_owner_deletion: true,
    }
}

fn quantity(s: &str) -> Quantity {
    match Quantity::parse(s) {
        Ok(q) => q,
        Err(e) => panic!("fixture quantity {s}: {e}"),
    }
}

/// Workload unit `<app_name>-<index>` running `image` with fixture resources.
pub fn pod(app_name: &str, index: usize, image: &str) -> Pod {
    let mut metadata = ObjectMeta::named(NAMESPACE, format!("{app_name}-{index}"));
    metadata
        .labels
        .insert(OWNER_LABEL.to_string(), app_name.to_string());
    metadata.set_controller_ref(owner_ref(app_name));

    let mut resources = ResourceRequirements::default();
    resources
        .requests
        .insert(RESOURCE_CPU.to_string(), quantity(CPU_REQUEST));
    resources
        .limits
        .insert(RESOURCE_MEMORY.to_string(), quantity(MEMORY_LIMIT));

    Pod {
        metadata,
        spec: PodSpec {
            containers: vec![Container {
                name: APP_CONTAINER.to_string(),
                image: image.to_string(),
                resources,
            }],
        },
    }
}

/// Units `<app_name>-0` through `<app_name>-<count - 1>`.
pub fn pods(app_name: &str, count: usize, image: &str) -> Vec<Pod> {
    (0..count).map(|i| pod(app_name, i, image)).collect()
}

/// Redis subordinate for the fixture declaration `app_name`.
pub fn redis_deployment(app_name: &str, replicas: i32) -> Deployment {
    let name = format!("{app_name}-redis");
    let mut metadata = ObjectMeta::named(NAMESPACE, &name);
    metadata.set_controller_ref(owner_ref(app_name));

    let mut selector = LabelSelector::single(OWNER_LABEL, &name);
    selector
        .match_labels
        .insert(COMPONENT_LABEL.to_string(), "redis".to_string());

    Deployment {
        metadata,
        spec: DeploymentSpec {
            replicas,
            template: PodTemplateSpec {
                metadata: ObjectMeta {
                    labels: selector.match_labels.clone(),
                    ..Default::default()
                },
                spec: PodSpec {
                    containers: vec![Container {
                        name: REDIS_CONTAINER.to_string(),
                        image: "redis:latest".to_string(),
                        ..Default::default()
                    }],
                },
            },
            selector,
        },
    }
}

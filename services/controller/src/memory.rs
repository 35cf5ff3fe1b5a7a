//! In-memory control plane for tests and development.
//!
//! Behaves like a real control plane where the reconciler can tell:
//! - uids and resource versions are assigned on write
//! - stale writes fail with a conflict, duplicate creates with already-exists
//! - lists return objects in creation order
//! - deletion can lag, leaving a terminating object visible for a while
//! - deleting a declaration garbage-collects everything it owns
//!
//! Faults can be injected per operation, and every call is recorded so
//! tests can assert on exactly what the reconciler did.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use appctl_api::{App, AppStatus, Deployment, LabelSelector, ObjectKey, ObjectMeta, Pod};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::client::{ClientError, ClientResult, ControlPlane};

/// Control-plane operations, as recorded in the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    GetApp,
    ListApps,
    UpdateAppStatus,
    GetPod,
    ListPods,
    CreatePod,
    UpdatePod,
    DeletePod,
    GetDeployment,
    CreateDeployment,
    UpdateDeployment,
}

impl Op {
    /// Returns true for operations that change workload units or deployments.
    pub fn is_workload_write(&self) -> bool {
        matches!(
            self,
            Op::CreatePod
                | Op::UpdatePod
                | Op::DeletePod
                | Op::CreateDeployment
                | Op::UpdateDeployment
        )
    }
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub op: Op,
    pub key: Option<ObjectKey>,
}

trait Object: Clone {
    const KIND: &'static str;
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

impl Object for App {
    const KIND: &'static str = "App";
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Object for Pod {
    const KIND: &'static str = "Pod";
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Object for Deployment {
    const KIND: &'static str = "Deployment";
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Default)]
struct Counters {
    next_seq: u64,
    next_version: u64,
}

impl Counters {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }
}

#[derive(Debug)]
struct Stored<T> {
    seq: u64,
    object: T,
    /// Reads left before a terminating object disappears.
    reads_until_gone: Option<u32>,
}

#[derive(Debug)]
struct Table<T> {
    entries: BTreeMap<ObjectKey, Stored<T>>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T: Object> Table<T> {
    fn not_found(key: &ObjectKey) -> ClientError {
        ClientError::NotFound {
            kind: T::KIND,
            key: key.clone(),
        }
    }

    fn get(&mut self, key: &ObjectKey) -> ClientResult<T> {
        let stored = self.entries.get_mut(key).ok_or_else(|| Self::not_found(key))?;
        let remaining = stored.reads_until_gone;
        match remaining {
            Some(0) => {
                self.entries.remove(key);
                Err(Self::not_found(key))
            }
            Some(n) => {
                stored.reads_until_gone = Some(n - 1);
                Ok(stored.object.clone())
            }
            None => Ok(stored.object.clone()),
        }
    }

    fn list(&self, namespace: Option<&str>, selector: Option<&LabelSelector>) -> Vec<T> {
        let mut matching: Vec<&Stored<T>> = self
            .entries
            .values()
            .filter(|s| namespace.is_none_or(|ns| s.object.meta().namespace == ns))
            .filter(|s| selector.is_none_or(|sel| sel.matches(&s.object.meta().labels)))
            .collect();
        matching.sort_by_key(|s| s.seq);
        matching.into_iter().map(|s| s.object.clone()).collect()
    }

    fn create(&mut self, counters: &mut Counters, object: &T) -> ClientResult<T> {
        let meta = object.meta();
        if meta.name.is_empty() || meta.namespace.is_empty() {
            return Err(ClientError::Invalid(format!(
                "{} requires a name and a namespace",
                T::KIND
            )));
        }
        let key = meta.key();
        if self.entries.contains_key(&key) {
            return Err(ClientError::AlreadyExists { kind: T::KIND, key });
        }

        let mut created = object.clone();
        let meta = created.meta_mut();
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.resource_version = Some(counters.version());
        meta.generation = 1;
        meta.deletion_timestamp = None;

        self.entries.insert(
            key,
            Stored {
                seq: counters.seq(),
                object: created.clone(),
                reads_until_gone: None,
            },
        );
        Ok(created)
    }

    /// Replace an object, keeping server-owned metadata.
    fn update(&mut self, counters: &mut Counters, object: &T) -> ClientResult<T> {
        let key = object.meta().key();
        let stored = self.entries.get_mut(&key).ok_or_else(|| Self::not_found(&key))?;

        let current = stored.object.meta();
        if let Some(expected) = object.meta().resource_version {
            if current.resource_version != Some(expected) {
                return Err(ClientError::Conflict {
                    kind: T::KIND,
                    key,
                    message: format!(
                        "resource version {expected} is stale (current {:?})",
                        current.resource_version
                    ),
                });
            }
        }

        let uid = current.uid.clone();
        let generation = current.generation;
        let deletion_timestamp = current.deletion_timestamp;

        let mut updated = object.clone();
        let meta = updated.meta_mut();
        meta.uid = uid;
        meta.generation = generation;
        meta.deletion_timestamp = deletion_timestamp;
        meta.resource_version = Some(counters.version());

        stored.object = updated.clone();
        Ok(updated)
    }

    fn delete(&mut self, key: &ObjectKey, lag: u32) -> ClientResult<()> {
        let stored = self.entries.get_mut(key).ok_or_else(|| Self::not_found(key))?;
        if lag == 0 {
            self.entries.remove(key);
        } else if stored.reads_until_gone.is_none() {
            stored.object.meta_mut().deletion_timestamp = Some(Utc::now());
            stored.reads_until_gone = Some(lag);
        }
        Ok(())
    }

    /// Remove everything owned by `uid`, returning how many objects went.
    fn collect_owned(&mut self, uid: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, s| !s.object.meta().is_owned_by(uid));
        before - self.entries.len()
    }

    /// Drop all terminating objects.
    fn settle(&mut self) {
        self.entries.retain(|_, s| s.reads_until_gone.is_none());
    }
}

#[derive(Debug)]
struct Fault {
    op: Op,
    error: ClientError,
    remaining: u32,
}

#[derive(Debug, Default)]
struct Store {
    counters: Counters,
    apps: Table<App>,
    pods: Table<Pod>,
    deployments: Table<Deployment>,
    deletion_lag: u32,
    faults: Vec<Fault>,
    log: Vec<Operation>,
}

impl Store {
    /// Record a call and return an injected fault for it, if one is armed.
    fn enter(&mut self, op: Op, key: Option<&ObjectKey>) -> ClientResult<()> {
        self.log.push(Operation {
            op,
            key: key.cloned(),
        });
        let Some(index) = self.faults.iter().position(|f| f.op == op) else {
            return Ok(());
        };
        let fault = &mut self.faults[index];
        let error = fault.error.clone();
        fault.remaining -= 1;
        if fault.remaining == 0 {
            self.faults.remove(index);
        }
        Err(error)
    }
}

/// A control plane that lives entirely in memory.
#[derive(Debug)]
pub struct InMemoryControlPlane {
    store: Mutex<Store>,
    changes: broadcast::Sender<ObjectKey>,
}

impl Default for InMemoryControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryControlPlane {
    /// Create an empty control plane with immediate deletion.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            store: Mutex::new(Store::default()),
            changes,
        }
    }

    /// Keep deleted objects visible, terminating, for `reads` further gets.
    pub fn with_deletion_lag(self, reads: u32) -> Self {
        self.lock().deletion_lag = reads;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to keys of declarations created, changed or deleted.
    pub fn subscribe(&self) -> broadcast::Receiver<ObjectKey> {
        self.changes.subscribe()
    }

    fn notify(&self, key: ObjectKey) {
        // No subscribers is fine.
        let _ = self.changes.send(key);
    }

    /// Create or replace a declaration the way a user would.
    ///
    /// Replacing keeps the uid and status and bumps the generation when the
    /// spec changed.
    pub fn apply_app(&self, app: &App) -> ClientResult<App> {
        let key = app.key();
        let applied = {
            let mut store = self.lock();
            let Store { counters, apps, .. } = &mut *store;
            match apps.entries.get_mut(&key) {
                None => apps.create(counters, app)?,
                Some(stored) => {
                    let previous = &stored.object;
                    let mut next = app.clone();
                    next.metadata.uid = previous.metadata.uid.clone();
                    next.metadata.generation = if previous.spec == app.spec {
                        previous.metadata.generation
                    } else {
                        previous.metadata.generation + 1
                    };
                    next.metadata.resource_version = Some(counters.version());
                    next.status = previous.status.clone();
                    stored.object = next.clone();
                    next
                }
            }
        };
        debug!(app = %key, generation = applied.metadata.generation, "Applied declaration");
        self.notify(key);
        Ok(applied)
    }

    /// Delete a declaration and garbage-collect everything it owns.
    pub fn delete_app(&self, key: &ObjectKey) -> ClientResult<()> {
        {
            let mut store = self.lock();
            let app = store.apps.get(key)?;
            store.apps.entries.remove(key);
            if let Some(uid) = app.metadata.uid.as_deref() {
                let pods = store.pods.collect_owned(uid);
                let deployments = store.deployments.collect_owned(uid);
                debug!(app = %key, pods, deployments, "Garbage-collected owned objects");
            }
        }
        self.notify(key.clone());
        Ok(())
    }

    /// Fail the next `times` calls of `op` with `error`.
    pub fn fail_next(&self, op: Op, error: ClientError, times: u32) {
        if times == 0 {
            return;
        }
        self.lock().faults.push(Fault {
            op,
            error,
            remaining: times,
        });
    }

    /// Finish all pending deletions.
    pub fn settle(&self) {
        let mut store = self.lock();
        store.pods.settle();
        store.deployments.settle();
    }

    /// Every call made so far.
    pub fn operations(&self) -> Vec<Operation> {
        self.lock().log.clone()
    }

    /// Number of calls of `op` made so far.
    pub fn count(&self, op: Op) -> usize {
        self.lock().log.iter().filter(|o| o.op == op).count()
    }

    /// Names targeted by calls of `op`, in call order.
    pub fn targets(&self, op: Op) -> Vec<String> {
        self.lock()
            .log
            .iter()
            .filter(|o| o.op == op)
            .filter_map(|o| o.key.as_ref().map(|k| k.name.clone()))
            .collect()
    }

    /// Forget recorded calls.
    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// All stored pods in a namespace, including terminating ones.
    pub fn pods(&self, namespace: &str) -> Vec<Pod> {
        self.lock().pods.list(Some(namespace), None)
    }

    /// All stored deployments in a namespace.
    pub fn deployments(&self, namespace: &str) -> Vec<Deployment> {
        self.lock().deployments.list(Some(namespace), None)
    }

    /// Insert a pod directly, bypassing the log and faults.
    pub fn insert_pod(&self, pod: &Pod) -> ClientResult<Pod> {
        let mut store = self.lock();
        let Store { counters, pods, .. } = &mut *store;
        pods.create(counters, pod)
    }

    /// Insert a deployment directly, bypassing the log and faults.
    pub fn insert_deployment(&self, deployment: &Deployment) -> ClientResult<Deployment> {
        let mut store = self.lock();
        let Store {
            counters,
            deployments,
            ..
        } = &mut *store;
        deployments.create(counters, deployment)
    }
}

#[async_trait]
impl ControlPlane for InMemoryControlPlane {
    async fn get_app(&self, key: &ObjectKey) -> ClientResult<App> {
        let mut store = self.lock();
        store.enter(Op::GetApp, Some(key))?;
        store.apps.get(key)
    }

    async fn list_apps(&self) -> ClientResult<Vec<App>> {
        let mut store = self.lock();
        store.enter(Op::ListApps, None)?;
        Ok(store.apps.list(None, None))
    }

    async fn update_app_status(&self, key: &ObjectKey, status: &AppStatus) -> ClientResult<()> {
        let mut store = self.lock();
        store.enter(Op::UpdateAppStatus, Some(key))?;
        let Store { counters, apps, .. } = &mut *store;
        let stored = apps
            .entries
            .get_mut(key)
            .ok_or_else(|| Table::<App>::not_found(key))?;
        stored.object.status = status.clone();
        stored.object.metadata.resource_version = Some(counters.version());
        Ok(())
    }

    async fn get_pod(&self, key: &ObjectKey) -> ClientResult<Pod> {
        let mut store = self.lock();
        store.enter(Op::GetPod, Some(key))?;
        store.pods.get(key)
    }

    async fn list_pods(&self, namespace: &str, selector: &LabelSelector) -> ClientResult<Vec<Pod>> {
        let mut store = self.lock();
        store.enter(Op::ListPods, None)?;
        Ok(store.pods.list(Some(namespace), Some(selector)))
    }

    async fn create_pod(&self, pod: &Pod) -> ClientResult<Pod> {
        let mut store = self.lock();
        store.enter(Op::CreatePod, Some(&pod.key()))?;
        let Store { counters, pods, .. } = &mut *store;
        pods.create(counters, pod)
    }

    async fn update_pod(&self, pod: &Pod) -> ClientResult<Pod> {
        let mut store = self.lock();
        store.enter(Op::UpdatePod, Some(&pod.key()))?;
        let Store { counters, pods, .. } = &mut *store;
        pods.update(counters, pod)
    }

    async fn delete_pod(&self, key: &ObjectKey) -> ClientResult<()> {
        let mut store = self.lock();
        store.enter(Op::DeletePod, Some(key))?;
        let lag = store.deletion_lag;
        store.pods.delete(key, lag)
    }

    async fn get_deployment(&self, key: &ObjectKey) -> ClientResult<Deployment> {
        let mut store = self.lock();
        store.enter(Op::GetDeployment, Some(key))?;
        store.deployments.get(key)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> ClientResult<Deployment> {
        let mut store = self.lock();
        store.enter(Op::CreateDeployment, Some(&deployment.key()))?;
        let Store {
            counters,
            deployments,
            ..
        } = &mut *store;
        deployments.create(counters, deployment)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> ClientResult<Deployment> {
        let mut store = self.lock();
        store.enter(Op::UpdateDeployment, Some(&deployment.key()))?;
        let Store {
            counters,
            deployments,
            ..
        } = &mut *store;
        deployments.update(counters, deployment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appctl_testing::{new_app, pod, NAMESPACE};

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new(NAMESPACE, name)
    }

    #[tokio::test]
    async fn test_create_assigns_uid_and_version() {
        let plane = InMemoryControlPlane::new();
        let created = plane.create_pod(&pod("web", 0, "nginx:1")).await.unwrap();

        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.resource_version.is_some());
        assert_eq!(plane.get_pod(&key("web-0")).await.unwrap(), created);

        let again = plane.create_pod(&pod("web", 0, "nginx:1")).await;
        assert!(matches!(again, Err(ClientError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let plane = InMemoryControlPlane::new();
        let created = plane.create_pod(&pod("web", 0, "nginx:1")).await.unwrap();

        let mut first = created.clone();
        first.spec.containers[0].image = "nginx:2".to_string();
        plane.update_pod(&first).await.unwrap();

        let mut stale = created;
        stale.spec.containers[0].image = "nginx:3".to_string();
        let err = plane.update_pod(&stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_list_in_creation_order() {
        let plane = InMemoryControlPlane::new();
        for i in [10, 2, 7] {
            plane.create_pod(&pod("web", i, "nginx:1")).await.unwrap();
        }
        plane.create_pod(&pod("other", 0, "nginx:1")).await.unwrap();

        let listed = plane
            .list_pods(NAMESPACE, &LabelSelector::single("app", "web"))
            .await
            .unwrap();
        let names: Vec<_> = listed.iter().map(Pod::name).collect();
        assert_eq!(names, ["web-10", "web-2", "web-7"]);
    }

    #[tokio::test]
    async fn test_deletion_lag() {
        let plane = InMemoryControlPlane::new().with_deletion_lag(2);
        plane.create_pod(&pod("web", 0, "nginx:1")).await.unwrap();
        plane.delete_pod(&key("web-0")).await.unwrap();

        let terminating = plane.get_pod(&key("web-0")).await.unwrap();
        assert!(terminating.metadata.is_terminating());
        assert!(plane.get_pod(&key("web-0")).await.is_ok());
        assert!(plane.get_pod(&key("web-0")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_app_collects_owned() {
        let plane = InMemoryControlPlane::new();
        let app = plane.apply_app(&new_app("web", 1)).unwrap();
        let uid = app.metadata.uid.clone().unwrap();

        let mut owned = pod("web", 0, "nginx:1");
        owned.metadata.owner_references[0].uid = uid;
        plane.create_pod(&owned).await.unwrap();
        plane.create_pod(&pod("other", 0, "nginx:1")).await.unwrap();

        plane.delete_app(&key("web")).unwrap();

        let names: Vec<_> = plane.pods(NAMESPACE).iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, ["other-0"]);
    }

    #[tokio::test]
    async fn test_apply_app_bumps_generation_on_spec_change() {
        let plane = InMemoryControlPlane::new();
        let first = plane.apply_app(&new_app("web", 1)).unwrap();
        let same = plane.apply_app(&new_app("web", 1)).unwrap();
        let changed = plane.apply_app(&new_app("web", 3)).unwrap();

        assert_eq!(first.metadata.generation, 1);
        assert_eq!(same.metadata.generation, 1);
        assert_eq!(changed.metadata.generation, 2);
        assert_eq!(changed.metadata.uid, first.metadata.uid);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let plane = InMemoryControlPlane::new();
        plane.fail_next(Op::ListPods, ClientError::Unavailable("down".to_string()), 1);

        let selector = LabelSelector::single("app", "web");
        assert!(plane.list_pods(NAMESPACE, &selector).await.is_err());
        assert!(plane.list_pods(NAMESPACE, &selector).await.is_ok());
        assert_eq!(plane.count(Op::ListPods), 2);
    }

    #[tokio::test]
    async fn test_subscribe_sees_declaration_changes() {
        let plane = InMemoryControlPlane::new();
        let mut changes = plane.subscribe();

        plane.apply_app(&new_app("web", 1)).unwrap();
        assert_eq!(changes.recv().await.unwrap(), key("web"));
    }
}

//! Work-queue worker driving reconciliation against the in-memory control plane.

use std::sync::Arc;
use std::time::Duration;

use appctl_api::{App, AppStatus, Deployment, LabelSelector, ObjectKey, Pod};
use appctl_controller::memory::Op;
use appctl_controller::ticker::{ImmediateTicker, StalledTicker, Ticker};
use appctl_controller::worker::WorkerStats;
use appctl_controller::{
    ClientError, ClientResult, ControlPlane, ControllerWorker, InMemoryControlPlane, Reconciler,
    ReconcilerSettings, WorkQueue, WorkerConfig,
};
use appctl_reconcile::BackoffPolicy;
use appctl_testing::{new_app, NAMESPACE};
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
    queue: WorkQueue,
    stats: Arc<WorkerStats>,
}

impl Running {
    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}

fn config() -> WorkerConfig {
    WorkerConfig {
        resync_interval: Duration::from_secs(3600),
        reconcile_timeout: Duration::from_secs(5),
        max_concurrent: 2,
        backoff: BackoffPolicy {
            base: Duration::from_millis(5),
            max: Duration::from_millis(50),
            jitter: 0.0,
        },
        retry_window: Duration::from_secs(60),
    }
}

fn start(plane: Arc<InMemoryControlPlane>, config: WorkerConfig) -> Running {
    start_with(plane, config, Arc::new(ImmediateTicker::new()))
}

fn start_with(plane: Arc<InMemoryControlPlane>, config: WorkerConfig, ticker: Arc<dyn Ticker>) -> Running {
    start_on(plane.clone(), plane, config, ticker)
}

/// Start a worker whose resync lists declarations through `resync`.
fn start_on(
    plane: Arc<InMemoryControlPlane>,
    resync: Arc<dyn ControlPlane>,
    config: WorkerConfig,
    ticker: Arc<dyn Ticker>,
) -> Running {
    let reconciler = Arc::new(Reconciler::new(plane, ticker, ReconcilerSettings::default()));
    let worker = ControllerWorker::new(reconciler, resync, config);
    let queue = worker.queue();
    let stats = worker.stats();
    let (shutdown, rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(rx));
    Running {
        shutdown,
        handle,
        queue,
        stats,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A control plane that never answers.
struct Unresponsive;

#[async_trait]
impl ControlPlane for Unresponsive {
    async fn get_app(&self, _: &ObjectKey) -> ClientResult<App> {
        std::future::pending().await
    }

    async fn list_apps(&self) -> ClientResult<Vec<App>> {
        std::future::pending().await
    }

    async fn update_app_status(&self, _: &ObjectKey, _: &AppStatus) -> ClientResult<()> {
        std::future::pending().await
    }

    async fn get_pod(&self, _: &ObjectKey) -> ClientResult<Pod> {
        std::future::pending().await
    }

    async fn list_pods(&self, _: &str, _: &LabelSelector) -> ClientResult<Vec<Pod>> {
        std::future::pending().await
    }

    async fn create_pod(&self, _: &Pod) -> ClientResult<Pod> {
        std::future::pending().await
    }

    async fn update_pod(&self, _: &Pod) -> ClientResult<Pod> {
        std::future::pending().await
    }

    async fn delete_pod(&self, _: &ObjectKey) -> ClientResult<()> {
        std::future::pending().await
    }

    async fn get_deployment(&self, _: &ObjectKey) -> ClientResult<Deployment> {
        std::future::pending().await
    }

    async fn create_deployment(&self, _: &Deployment) -> ClientResult<Deployment> {
        std::future::pending().await
    }

    async fn update_deployment(&self, _: &Deployment) -> ClientResult<Deployment> {
        std::future::pending().await
    }
}

fn unit_count(plane: &InMemoryControlPlane, app: &App) -> usize {
    plane
        .pods(NAMESPACE)
        .iter()
        .filter(|p| app.unit_selector().matches(&p.metadata.labels))
        .count()
}

#[tokio::test]
async fn initial_resync_converges_existing_declarations() {
    let plane = Arc::new(InMemoryControlPlane::new());
    let web = plane.apply_app(&new_app("web", 2)).unwrap();
    let api = plane.apply_app(&new_app("api", 3)).unwrap();

    let running = start(plane.clone(), config());
    eventually(|| unit_count(&plane, &web) == 2 && unit_count(&plane, &api) == 3).await;
    running.stop().await;
}

#[tokio::test]
async fn enqueued_key_is_reconciled() {
    let plane = Arc::new(InMemoryControlPlane::new());
    let running = start(plane.clone(), config());
    eventually(|| plane.count(Op::ListApps) >= 1).await;

    let app = plane.apply_app(&new_app("web", 3)).unwrap();
    running.queue.enqueue(app.key());

    eventually(|| unit_count(&plane, &app) == 3).await;
    running.stop().await;
}

#[tokio::test]
async fn change_feed_triggers_reconciliation() {
    let plane = Arc::new(InMemoryControlPlane::new());
    let running = start(plane.clone(), config());
    let follower = running.queue.follow(plane.subscribe());

    let app = plane.apply_app(&new_app("web", 2)).unwrap();
    eventually(|| unit_count(&plane, &app) == 2).await;

    let app = plane.apply_app(&new_app("web", 1)).unwrap();
    eventually(|| unit_count(&plane, &app) == 1).await;

    follower.abort();
    running.stop().await;
}

#[tokio::test]
async fn transient_failures_are_retried_with_backoff() {
    let plane = Arc::new(InMemoryControlPlane::new());
    let app = plane.apply_app(&new_app("web", 2)).unwrap();
    plane.fail_next(Op::ListPods, ClientError::Unavailable("etcd timeout".to_string()), 3);

    let running = start(plane.clone(), config());
    eventually(|| unit_count(&plane, &app) == 2).await;

    assert_eq!(running.stats.failed(), 3);
    assert!(running.stats.requeued() >= 3);
    running.stop().await;
}

#[tokio::test]
async fn malformed_declaration_is_not_retried() {
    let plane = Arc::new(InMemoryControlPlane::new());
    let mut malformed = new_app("web", 2);
    malformed.spec.resources.cpu_request = "a lot".to_string();
    plane.apply_app(&malformed).unwrap();

    let running = start(plane.clone(), config());
    eventually(|| running.stats.failed() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(running.stats.failed(), 1);
    assert_eq!(plane.count(Op::GetApp), 1);
    running.stop().await;
}

#[tokio::test]
async fn shutdown_interrupts_a_stuck_cycle() {
    let plane = Arc::new(InMemoryControlPlane::new().with_deletion_lag(u32::MAX));
    let app = plane.apply_app(&new_app("web", 1)).unwrap();

    let running = start_with(plane.clone(), config(), Arc::new(StalledTicker));
    eventually(|| unit_count(&plane, &app) == 1).await;

    // The deletion never completes, so the cycle sits in the confirmer.
    let app = plane.apply_app(&new_app("web", 0)).unwrap();
    running.queue.enqueue(app.key());
    eventually(|| plane.count(Op::DeletePod) == 1).await;

    running.stop().await;
}

#[tokio::test]
async fn hung_resync_does_not_block_the_queue_or_shutdown() {
    let plane = Arc::new(InMemoryControlPlane::new());
    let config = WorkerConfig {
        reconcile_timeout: Duration::from_secs(60),
        ..config()
    };
    let running = start_on(
        plane.clone(),
        Arc::new(Unresponsive),
        config,
        Arc::new(ImmediateTicker::new()),
    );

    let app = plane.apply_app(&new_app("web", 2)).unwrap();
    running.queue.enqueue(app.key());
    eventually(|| unit_count(&plane, &app) == 2).await;

    running.stop().await;
}

#[tokio::test]
async fn cycle_waiting_on_its_key_leaves_slots_free() {
    let plane = Arc::new(InMemoryControlPlane::new().with_deletion_lag(u32::MAX));
    let web = plane.apply_app(&new_app("web", 1)).unwrap();
    let config = WorkerConfig {
        reconcile_timeout: Duration::from_secs(60),
        max_concurrent: 2,
        ..config()
    };
    let running = start_with(plane.clone(), config, Arc::new(StalledTicker));
    eventually(|| unit_count(&plane, &web) == 1).await;

    // The first web cycle stalls confirming its deletion; the second waits on the key.
    let web = plane.apply_app(&new_app("web", 0)).unwrap();
    running.queue.enqueue(web.key());
    eventually(|| plane.count(Op::DeletePod) == 1).await;
    eventually(|| running.queue.enqueue(web.key())).await;

    let api = plane.apply_app(&new_app("api", 2)).unwrap();
    running.queue.enqueue(api.key());
    eventually(|| unit_count(&plane, &api) == 2).await;

    running.stop().await;
}

//! Controller background worker.
//!
//! Feeds declaration keys from explicit enqueues, change notifications and
//! a periodic resync into a work queue, and runs reconciliation cycles:
//! - at most `max_concurrent` cycles at once
//! - at most one cycle per declaration key at a time
//! - retryable failures requeue with exponential backoff and jitter

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use appctl_api::ObjectKey;
use appctl_reconcile::{BackoffPolicy, RetryTracker, DEFAULT_RESYNC_INTERVAL, DEFAULT_RETRY_WINDOW};
use tokio::sync::{broadcast, mpsc, watch, OwnedMutexGuard, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::client::ControlPlane;
use crate::context::ReconcileContext;
use crate::error::ReconcileError;
use crate::reconciler::{ReconcileAction, Reconciler};

/// Worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often every declaration is enqueued regardless of changes.
    pub resync_interval: Duration,
    /// Deadline of a single cycle.
    pub reconcile_timeout: Duration,
    /// Cycles allowed to run at once.
    pub max_concurrent: usize,
    pub backoff: BackoffPolicy,
    /// Failures older than this no longer grow the backoff.
    pub retry_window: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            reconcile_timeout: Duration::from_secs(120),
            max_concurrent: 4,
            backoff: BackoffPolicy::default(),
            retry_window: DEFAULT_RETRY_WINDOW,
        }
    }
}

/// Counters for worker activity.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub cycles_succeeded: AtomicU64,
    pub cycles_failed: AtomicU64,
    pub requeues: AtomicU64,
}

impl WorkerStats {
    pub fn succeeded(&self) -> u64 {
        self.cycles_succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.cycles_failed.load(Ordering::Relaxed)
    }

    pub fn requeued(&self) -> u64 {
        self.requeues.load(Ordering::Relaxed)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle for adding declaration keys to the worker's queue.
///
/// A key that is already waiting is not queued twice.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<ObjectKey>,
    pending: Arc<Mutex<BTreeSet<ObjectKey>>>,
}

impl WorkQueue {
    fn new() -> (Self, mpsc::UnboundedReceiver<ObjectKey>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            tx,
            pending: Arc::new(Mutex::new(BTreeSet::new())),
        };
        (queue, rx)
    }

    /// Queue `key`. Returns false if it was already waiting or the worker is gone.
    pub fn enqueue(&self, key: ObjectKey) -> bool {
        if !lock(&self.pending).insert(key.clone()) {
            return false;
        }
        if self.tx.send(key.clone()).is_err() {
            lock(&self.pending).remove(&key);
            return false;
        }
        true
    }

    /// Queue `key` once `delay` has passed.
    pub fn enqueue_after(&self, key: ObjectKey, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(key);
        });
    }

    /// Number of keys waiting to start.
    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Forward declaration change notifications into the queue.
    pub fn follow(&self, mut changes: broadcast::Receiver<ObjectKey>) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(key) => {
                        queue.enqueue(key);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Change feed lagged, relying on resync");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn started(&self, key: &ObjectKey) {
        lock(&self.pending).remove(key);
    }
}

/// One async mutex per declaration key.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<BTreeMap<ObjectKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &ObjectKey) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = lock(&self.locks);
            // Entries nobody holds or waits on can go.
            locks.retain(|k, m| k == key || Arc::strong_count(m) > 1);
            locks.entry(key.clone()).or_default().clone()
        };
        mutex.lock_owned().await
    }

    /// Number of keys with a live lock.
    pub fn len(&self) -> usize {
        lock(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Shared {
    reconciler: Arc<Reconciler>,
    queue: WorkQueue,
    locks: KeyedLocks,
    retries: Mutex<RetryTracker>,
    stats: Arc<WorkerStats>,
    config: WorkerConfig,
}

/// Worker that runs reconciliation cycles off the queue.
pub struct ControllerWorker {
    shared: Arc<Shared>,
    client: Arc<dyn ControlPlane>,
    rx: mpsc::UnboundedReceiver<ObjectKey>,
}

impl ControllerWorker {
    /// Create a worker. `client` is used to list declarations on resync.
    pub fn new(reconciler: Arc<Reconciler>, client: Arc<dyn ControlPlane>, config: WorkerConfig) -> Self {
        let (queue, rx) = WorkQueue::new();
        Self {
            shared: Arc::new(Shared {
                reconciler,
                queue,
                locks: KeyedLocks::default(),
                retries: Mutex::new(RetryTracker::new(config.retry_window)),
                stats: Arc::new(WorkerStats::default()),
                config,
            }),
            client,
            rx,
        }
    }

    /// Handle for enqueueing keys.
    pub fn queue(&self) -> WorkQueue {
        self.shared.queue.clone()
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.shared.stats.clone()
    }

    /// Run the worker until shutdown is signaled.
    ///
    /// The first resync happens immediately. On shutdown, in-flight cycles
    /// observe cancellation through their context and are awaited.
    #[instrument(skip_all)]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Self {
            shared,
            client,
            mut rx,
        } = self;
        let config = &shared.config;
        info!(
            resync_secs = config.resync_interval.as_secs(),
            max_concurrent = config.max_concurrent,
            "Starting controller worker"
        );

        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        let mut resync = tokio::time::interval(config.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut resyncing: Option<JoinHandle<()>> = None;
        let mut cycles = JoinSet::new();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Controller worker shutting down");
                        break;
                    }
                }
                _ = resync.tick() => {
                    if resyncing.as_ref().is_none_or(JoinHandle::is_finished) {
                        resyncing = Some(tokio::spawn(resync_all(shared.clone(), client.clone())));
                    } else {
                        debug!("Previous resync still listing, skipping tick");
                    }
                }
                Some(key) = rx.recv() => {
                    cycles.spawn(process(shared.clone(), key, semaphore.clone(), shutdown.clone()));
                }
                Some(joined) = cycles.join_next() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Reconciliation task failed");
                    }
                }
            }
        }

        if let Some(resyncing) = resyncing {
            resyncing.abort();
        }
        while let Some(joined) = cycles.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Reconciliation task failed");
            }
        }
        info!(
            succeeded = shared.stats.succeeded(),
            failed = shared.stats.failed(),
            "Controller worker stopped"
        );
    }
}

/// Enqueue every declaration.
async fn resync_all(shared: Arc<Shared>, client: Arc<dyn ControlPlane>) {
    match tokio::time::timeout(shared.config.reconcile_timeout, client.list_apps()).await {
        Ok(Ok(apps)) => {
            let queued = apps
                .iter()
                .filter(|app| shared.queue.enqueue(app.key()))
                .count();
            debug!(declarations = apps.len(), queued, "Resync");
        }
        Ok(Err(e)) => warn!(error = %e, "Resync failed to list declarations"),
        Err(_) => warn!("Resync timed out listing declarations"),
    }

    let mut retries = lock(&shared.retries);
    retries.prune();
    if !retries.is_empty() {
        debug!(keys = retries.len(), "Declarations backing off after failures");
    }
}

/// Run one cycle for `key` and decide whether it comes back.
async fn process(
    shared: Arc<Shared>,
    key: ObjectKey,
    semaphore: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
) {
    // Key first: a cycle queued behind its own key holds no slot.
    let _guard = shared.locks.lock(&key).await;
    let Ok(_permit) = semaphore.acquire_owned().await else {
        return;
    };
    shared.queue.started(&key);

    let ctx = ReconcileContext::new(shutdown).with_timeout(shared.config.reconcile_timeout);
    let retry_key = key.to_string();

    match shared.reconciler.reconcile(&key, &ctx).await {
        Ok(action) => {
            shared.stats.cycles_succeeded.fetch_add(1, Ordering::Relaxed);
            lock(&shared.retries).clear(&retry_key);
            if let ReconcileAction::RequeueAfter(delay) = action {
                debug!(namespace = %key.namespace, name = %key.name, delay_ms = delay.as_millis() as u64, "Requeueing");
                shared.stats.requeues.fetch_add(1, Ordering::Relaxed);
                shared.queue.enqueue_after(key, delay);
            }
        }
        Err(ReconcileError::Cancelled) => {
            debug!(namespace = %key.namespace, name = %key.name, "Reconciliation cancelled");
        }
        Err(e) if e.is_retryable() => {
            shared.stats.cycles_failed.fetch_add(1, Ordering::Relaxed);
            let attempt = lock(&shared.retries).record_failure(&retry_key);
            let delay = shared.config.backoff.delay(attempt.saturating_sub(1));
            warn!(
                namespace = %key.namespace,
                name = %key.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "Reconciliation failed, will retry"
            );
            shared.stats.requeues.fetch_add(1, Ordering::Relaxed);
            shared.queue.enqueue_after(key, delay);
        }
        Err(ReconcileError::DeclarationNotFound(_)) => {
            lock(&shared.retries).clear(&retry_key);
            debug!(namespace = %key.namespace, name = %key.name, "Declaration gone, dropping key");
        }
        Err(e) => {
            shared.stats.cycles_failed.fetch_add(1, Ordering::Relaxed);
            lock(&shared.retries).clear(&retry_key);
            error!(
                namespace = %key.namespace,
                name = %key.name,
                error = %e,
                "Reconciliation failed, waiting for the declaration to change"
            );
        }
    }
}

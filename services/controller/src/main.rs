//! appctl controller
//!
//! Runs the reconciliation worker against an in-memory control plane,
//! optionally seeded with declarations from a JSON file.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use appctl_api::App;
use appctl_controller::{
    config, ticker::IntervalTicker, ControllerWorker, InMemoryControlPlane, Reconciler,
};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to APPCTL_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting appctl controller");
    info!(
        resync_secs = config.resync_interval.as_secs(),
        redis_policy = ?config.redis_policy,
        "Configuration loaded"
    );

    let plane = Arc::new(InMemoryControlPlane::new());
    if let Some(path) = &config.seed_file {
        let seeded = seed(&plane, path)?;
        info!(path = %path.display(), declarations = seeded, "Seeded control plane");
    }

    let ticker = Arc::new(IntervalTicker::new(config.delete_poll_interval));
    let reconciler = Arc::new(Reconciler::new(
        plane.clone(),
        ticker,
        config.reconciler_settings(),
    ));
    let worker = ControllerWorker::new(reconciler, plane.clone(), config.worker_config());

    // Declaration changes go straight to the queue
    let follower = worker.queue().follow(plane.subscribe());

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    // Signal shutdown to the worker
    let _ = shutdown_tx.send(true);
    follower.abort();

    let shutdown_timeout = Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, worker_handle).await {
        warn!(error = %e, "Controller worker did not shut down in time");
    }

    info!("Controller shutdown complete");
    Ok(())
}

/// Load a JSON array of declarations into the control plane.
fn seed(plane: &InMemoryControlPlane, path: &Path) -> Result<usize> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read seed file {}", path.display()))?;
    let apps: Vec<App> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse seed file {}", path.display()))?;
    for app in &apps {
        plane
            .apply_app(app)
            .with_context(|| format!("failed to seed declaration {}", app.key()))?;
    }
    Ok(apps.len())
}

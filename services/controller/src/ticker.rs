//! Poll pacing for waits inside a cycle.
//!
//! Waits never sleep directly; they ask a [`Ticker`] for the next tick so
//! tests can run a poll loop without spending real time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

/// Source of poll ticks.
#[async_trait]
pub trait Ticker: Send + Sync {
    /// Wait for the next tick.
    async fn tick(&self);
}

/// Ticks every `period` of real time.
#[derive(Debug, Clone)]
pub struct IntervalTicker {
    period: Duration,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&self) {
        tokio::time::sleep(self.period).await;
    }
}

/// Ticks immediately, counting how often it was asked.
#[derive(Debug, Default)]
pub struct ImmediateTicker {
    ticks: AtomicU64,
}

impl ImmediateTicker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ticks handed out so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Ticker for ImmediateTicker {
    async fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
    }
}

/// Never ticks. Waits using it end only through their context.
#[derive(Debug, Default, Clone, Copy)]
pub struct StalledTicker;

#[async_trait]
impl Ticker for StalledTicker {
    async fn tick(&self) {
        std::future::pending::<()>().await;
    }
}

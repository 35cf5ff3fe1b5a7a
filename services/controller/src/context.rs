//! Cancellation and deadline carried through one reconciliation cycle.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Why a cycle stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    Cancelled,
    DeadlineExceeded,
}

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupted::Cancelled => f.write_str("cancelled"),
            Interrupted::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

impl std::error::Error for Interrupted {}

/// Ambient context of a reconciliation cycle.
///
/// Every control-plane call and every wait in the cycle races against this
/// context, so a cancelled or expired cycle returns promptly.
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    cancel: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

impl ReconcileContext {
    /// Context driven by a shutdown-style signal: `true` means cancel.
    pub fn new(cancel: watch::Receiver<bool>) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        // With the sender dropped the value stays `false` for good.
        let (_, rx) = watch::channel(false);
        Self::new(rx)
    }

    /// Add a deadline `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Add an absolute deadline; an earlier existing deadline wins.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns why the context is done, if it is.
    pub fn check(&self) -> Result<(), Interrupted> {
        if *self.cancel.borrow() {
            return Err(Interrupted::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Interrupted::DeadlineExceeded);
        }
        Ok(())
    }

    /// Resolves once the context is cancelled or past its deadline.
    pub async fn done(&self) -> Interrupted {
        let mut cancel = self.cancel.clone();
        let cancelled = async move {
            loop {
                if *cancel.borrow_and_update() {
                    return;
                }
                if cancel.changed().await.is_err() {
                    // Sender gone without cancelling: never cancelled.
                    std::future::pending::<()>().await;
                }
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Interrupted::Cancelled,
            _ = expired => Interrupted::DeadlineExceeded,
        }
    }

    /// Run `fut` unless the context finishes first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, Interrupted>
    where
        F: Future<Output = T>,
    {
        self.check()?;
        tokio::select! {
            biased;
            reason = self.done() => Err(reason),
            value = fut => Ok(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_runs_to_completion() {
        let ctx = ReconcileContext::background();
        assert_eq!(ctx.run(async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_work() {
        let (tx, rx) = watch::channel(false);
        let ctx = ReconcileContext::new(rx);

        let task = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.run(std::future::pending::<()>()).await }
        });
        tx.send(true).unwrap();

        assert_eq!(task.await.unwrap(), Err(Interrupted::Cancelled));
        assert_eq!(ctx.check(), Err(Interrupted::Cancelled));
    }

    #[tokio::test]
    async fn test_deadline_interrupts_pending_work() {
        let ctx = ReconcileContext::background().with_timeout(Duration::from_millis(20));
        let result = ctx.run(std::future::pending::<()>()).await;
        assert_eq!(result, Err(Interrupted::DeadlineExceeded));
    }

    #[test]
    fn test_earlier_deadline_wins() {
        let now = Instant::now();
        let ctx = ReconcileContext::background()
            .with_deadline(now + Duration::from_secs(1))
            .with_deadline(now + Duration::from_secs(10));
        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(1)));
    }
}

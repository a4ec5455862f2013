//! Stale-task recovery
//!
//! The queue has no persisted "running" state: an attempt is marked only by the
//! runner stamping `last_attempt_at`. If the process dies mid-fetch, the entry
//! stays pending with a recent stamp and, once it has failed before, sits inside
//! a backoff window. The reconciler periodically clears stamps older than a
//! threshold so such entries become eligible again.
//!
//! # Example
//!
//! ```no_run
//! use chapter_dl::db::Database;
//! use chapter_dl::queue::QueueRepository;
//! use chapter_dl::reconciler::StaleTaskReconciler;
//! use chapter_dl::retry::RetryPolicy;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Arc::new(Database::new(std::path::Path::new("chapter-dl.db")).await?);
//! let repo = Arc::new(QueueRepository::new(db, RetryPolicy::default()).await?);
//!
//! let reconciler = StaleTaskReconciler::new(
//!     repo,
//!     Duration::from_secs(2 * 3600),
//!     Duration::from_secs(15 * 60),
//! );
//!
//! let cancel = CancellationToken::new();
//! tokio::spawn(reconciler.run(cancel.clone()));
//! # Ok(())
//! # }
//! ```

use crate::Result;
use crate::queue::QueueRepository;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Periodically requeues entries abandoned mid-attempt
pub struct StaleTaskReconciler {
    repo: Arc<QueueRepository>,

    /// Attempts older than this are considered abandoned
    threshold: Duration,

    /// Time between passes
    interval: Duration,
}

impl StaleTaskReconciler {
    /// Creates a new reconciler
    pub fn new(repo: Arc<QueueRepository>, threshold: Duration, interval: Duration) -> Self {
        Self {
            repo,
            threshold,
            interval,
        }
    }

    /// Run a single pass, returning the number of entries requeued
    pub async fn run_once(&self) -> Result<u64> {
        self.repo.reset_stuck_downloads(self.threshold).await
    }

    /// Run passes until `cancel` fires
    ///
    /// The first pass runs immediately. A failed pass is logged and retried on
    /// the next tick.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            threshold_secs = self.threshold.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Stale-task reconciler started"
        );

        loop {
            match self.run_once().await {
                Ok(0) => debug!("No stale entries found"),
                Ok(count) => info!(count, "Requeued stale entries"),
                Err(e) => error!(error = %e, "Stale-task reconciliation failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("Stale-task reconciler shutting down");
    }
}

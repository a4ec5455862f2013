//! Download runner: the active consumer of the queue.
//!
//! One activation is one pass over the queue:
//!
//! 1. **Idle**: check the network against the "only on unmetered" preference.
//!    If it does not hold, stop right away and ask the scheduler to retry.
//! 2. **Active**: publish the active state, requeue stale entries, then keep
//!    pulling eligible entries in priority order until the queue has nothing
//!    eligible left, the activation is cancelled, or a network/preference change
//!    violates the network condition.
//! 3. **Stopped**: terminal for this activation.
//!
//! Entries are processed one at a time. For each entry the runner stamps the
//! attempt time, resolves the chapter through [`LibraryLookup`], calls the
//! [`Fetcher`], and records the outcome on the queue.
//!
//! Cancellation is checked between entries; an in-flight fetch is never
//! aborted, it only sees the cancellation token.

use crate::config::DownloadPreferences;
use crate::fetcher::{FetchErrorKind, Fetcher};
use crate::library::{self, LibraryLookup};
use crate::queue::QueueRepository;
use crate::retry::{FailureDecision, IsRetryable};
use crate::scheduler::{DeviceConditions, JobHandler, JobOutcome};
use crate::types::{Event, QueueEntry, QueueStatus, RunnerState};
use crate::Result;
use async_trait::async_trait;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod monitor;

pub(crate) use monitor::required_network;

/// Why an activation ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunnerExit {
    /// No eligible entries left
    QueueDrained,
    /// Network condition did not hold (at start or after a change event)
    ConstraintViolated(String),
    /// Stopped by [`DownloadRunner::stop`] or job cancellation
    Cancelled,
    /// Another activation is already processing the queue
    AlreadyRunning,
    /// The queue store failed
    StoreError {
        /// Store error message
        message: String,
        /// Whether the failure is transient (busy or locked database)
        retryable: bool,
    },
}

impl RunnerExit {
    /// Human-readable stop reason
    pub fn reason(&self) -> String {
        match self {
            RunnerExit::QueueDrained => "queue drained".to_string(),
            RunnerExit::ConstraintViolated(reason) => reason.clone(),
            RunnerExit::Cancelled => "cancelled".to_string(),
            RunnerExit::AlreadyRunning => "already running".to_string(),
            RunnerExit::StoreError { message, .. } => format!("queue store error: {}", message),
        }
    }

    /// Outcome reported to the job scheduler
    pub fn job_outcome(&self) -> JobOutcome {
        match self {
            RunnerExit::QueueDrained | RunnerExit::Cancelled | RunnerExit::AlreadyRunning => {
                JobOutcome::Success
            }
            RunnerExit::ConstraintViolated(_) => JobOutcome::Retry,
            RunnerExit::StoreError { retryable: true, .. } => JobOutcome::Retry,
            RunnerExit::StoreError { retryable: false, .. } => JobOutcome::Failure,
        }
    }
}

/// Collaborators and settings for a [`DownloadRunner`]
pub struct RunnerDeps {
    /// Queue to consume
    pub repo: Arc<QueueRepository>,
    /// Resolves queue entries into work items
    pub library: Arc<dyn LibraryLookup>,
    /// Downloads chapters
    pub fetcher: Arc<dyn Fetcher>,
    /// Device conditions feed
    pub conditions: watch::Receiver<DeviceConditions>,
    /// Preferences feed
    pub preferences: watch::Receiver<DownloadPreferences>,
    /// Attempts older than this are requeued at activation start
    pub stuck_threshold: Duration,
}

/// Processes the queue when triggered by the job scheduler
pub struct DownloadRunner {
    repo: Arc<QueueRepository>,
    library: Arc<dyn LibraryLookup>,
    fetcher: Arc<dyn Fetcher>,
    conditions: watch::Receiver<DeviceConditions>,
    preferences: watch::Receiver<DownloadPreferences>,
    stuck_threshold: Duration,
    state_tx: watch::Sender<RunnerState>,
    event_tx: broadcast::Sender<Event>,
    /// Held for the whole activation
    activation: Mutex<()>,
    /// Token of the current activation, for `stop`
    current: Mutex<Option<CancellationToken>>,
}

impl DownloadRunner {
    /// Create an idle runner
    pub fn new(deps: RunnerDeps) -> Self {
        let (state_tx, _) = watch::channel(RunnerState::Idle);
        let event_tx = deps.repo.event_sender();
        Self {
            repo: deps.repo,
            library: deps.library,
            fetcher: deps.fetcher,
            conditions: deps.conditions,
            preferences: deps.preferences,
            stuck_threshold: deps.stuck_threshold,
            state_tx,
            event_tx,
            activation: Mutex::new(()),
            current: Mutex::new(None),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> RunnerState {
        self.state_tx.borrow().clone()
    }

    /// Subscribe to lifecycle state changes
    pub fn watch_state(&self) -> watch::Receiver<RunnerState> {
        self.state_tx.subscribe()
    }

    /// Whether an activation is processing the queue
    pub fn is_active(&self) -> bool {
        matches!(*self.state_tx.borrow(), RunnerState::Active)
    }

    /// Stop the current activation after the in-flight entry
    pub async fn stop(&self) {
        if let Some(token) = self.current.lock().await.as_ref() {
            info!("Stopping download runner");
            token.cancel();
        }
    }

    fn emit_event(&self, event: Event) {
        // send() returns Err if there are no receivers, which is fine - we just drop the event
        self.event_tx.send(event).ok();
    }

    fn finish(&self, exit: RunnerExit) -> RunnerExit {
        let reason = exit.reason();
        info!(reason = %reason, "Download runner stopped");
        self.state_tx.send_replace(RunnerState::Stopped {
            reason: reason.clone(),
        });
        self.emit_event(Event::RunnerStopped { reason });
        exit
    }

    /// Run one activation until the queue drains, the network condition breaks,
    /// or `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> RunnerExit {
        let Ok(_activation) = self.activation.try_lock() else {
            debug!("Download runner already active, ignoring trigger");
            return RunnerExit::AlreadyRunning;
        };

        // Idle: check the network before doing anything
        let violation = {
            let conditions = self.conditions.borrow();
            let preferences = self.preferences.borrow();
            monitor::network_violation(&conditions, &preferences)
        };
        if let Some(reason) = violation {
            warn!(reason = %reason, "Network condition not met, not starting downloads");
            return self.finish(RunnerExit::ConstraintViolated(reason));
        }

        // Active
        let token = cancel.child_token();
        *self.current.lock().await = Some(token.clone());
        self.state_tx.send_replace(RunnerState::Active);
        self.emit_event(Event::RunnerStarted);
        info!("Download runner started");

        let reason = Arc::new(OnceLock::new());
        let monitor = tokio::spawn(monitor::watch_network(
            self.conditions.clone(),
            self.preferences.clone(),
            token.clone(),
            reason.clone(),
        ));

        if let Err(e) = self.repo.reset_stuck_downloads(self.stuck_threshold).await {
            warn!(error = %e, "Failed to requeue stale entries");
        }

        let exit = match self.drain(&token).await {
            Ok(()) if token.is_cancelled() => match reason.get() {
                Some(reason) => RunnerExit::ConstraintViolated(reason.clone()),
                None => RunnerExit::Cancelled,
            },
            Ok(()) => RunnerExit::QueueDrained,
            Err(e) => {
                error!(error = %e, "Download runner aborted by queue store failure");
                RunnerExit::StoreError {
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                }
            }
        };

        // Stops the monitor as well
        token.cancel();
        if let Err(e) = monitor.await {
            warn!(error = %e, "Network monitor task failed");
        }
        *self.current.lock().await = None;

        self.finish(exit)
    }

    /// Process eligible entries until none are left or `token` fires
    async fn drain(&self, token: &CancellationToken) -> Result<()> {
        loop {
            if token.is_cancelled() {
                return Ok(());
            }

            let batch = self.repo.get_pending_with_backoff().await?;
            if batch.is_empty() {
                return Ok(());
            }
            debug!(count = batch.len(), "Processing batch of eligible entries");

            for entry in batch {
                if token.is_cancelled() {
                    return Ok(());
                }
                self.process(entry, token).await?;
            }
        }
    }

    async fn process(&self, entry: QueueEntry, token: &CancellationToken) -> Result<()> {
        let chapter_id = entry.chapter_id;

        // Stamp the attempt; the queue has no running state of its own
        let stamped = self
            .repo
            .update_status(
                entry.id,
                QueueStatus::Pending,
                Some(self.repo.now()),
                entry.last_error_message.as_deref(),
            )
            .await?;
        if !stamped {
            debug!(chapter_id, "Entry removed before its attempt, skipping");
            return Ok(());
        }

        let item = match library::resolve(self.library.as_ref(), &entry).await {
            Ok(Some(item)) => item,
            Ok(None) => {
                warn!(
                    chapter_id,
                    manga_id = entry.manga_id,
                    "Manga or chapter no longer in library, dropping queue entry"
                );
                self.repo.remove_by_id(entry.id).await?;
                return Ok(());
            }
            Err(e) => {
                // Counts against this entry only
                warn!(chapter_id, error = %e, "Library lookup failed");
                let message = format!("library lookup failed: {e}");
                let decision = self
                    .repo
                    .record_failure(chapter_id, &message, FetchErrorKind::Unknown)
                    .await?;
                self.emit_event(Event::ChapterFailed {
                    chapter_id,
                    error: message,
                    will_retry: matches!(decision, Some(FailureDecision::Retry { .. })),
                });
                return Ok(());
            }
        };

        debug!(chapter_id, manga = %item.manga.title, chapter = %item.chapter.name, "Downloading chapter");

        match self.fetcher.fetch(&item, token).await {
            Ok(()) => {
                self.repo.mark_completed(chapter_id).await?;
                info!(chapter_id, "Chapter downloaded");
                self.emit_event(Event::ChapterCompleted { chapter_id });
            }
            Err(e) => {
                let decision = self
                    .repo
                    .record_failure(chapter_id, &e.message, e.kind)
                    .await?;
                self.emit_event(Event::ChapterFailed {
                    chapter_id,
                    error: e.message,
                    will_retry: matches!(decision, Some(FailureDecision::Retry { .. })),
                });
            }
        }

        Ok(())
    }
}

#[async_trait]
impl JobHandler for DownloadRunner {
    async fn run(&self, cancel: CancellationToken) -> JobOutcome {
        DownloadRunner::run(self, cancel).await.job_outcome()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

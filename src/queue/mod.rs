//! Transactional queue repository.
//!
//! [`QueueRepository`] is the only component that mutates the download queue.
//! Producers (user actions, the history poll, restore flows) call [`add`] and
//! [`add_all`]; the runner reports outcomes through [`record_failure`] and
//! [`mark_completed`]. Every read-then-write operation runs inside one
//! `BEGIN IMMEDIATE` transaction, so concurrent callers never observe or create
//! a second entry for the same chapter.
//!
//! After every mutation the full queue is re-read and published to
//! [`subscribe`] streams.
//!
//! [`add`]: QueueRepository::add
//! [`add_all`]: QueueRepository::add_all
//! [`record_failure`]: QueueRepository::record_failure
//! [`mark_completed`]: QueueRepository::mark_completed
//! [`subscribe`]: QueueRepository::subscribe

use crate::clock::{Clock, SystemClock, duration_to_millis};
use crate::db::{Database, millis_to_datetime, queue};
use crate::fetcher::FetchErrorKind;
use crate::retry::{FailureDecision, RetryPolicy};
use crate::types::{ChapterId, Event, MangaId, Priority, QueueEntry, QueueEntryId, QueueStatus};
use crate::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tokio_stream::wrappers::WatchStream;

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Durable, priority-ordered chapter download queue
pub struct QueueRepository {
    db: Arc<Database>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    snapshot_tx: watch::Sender<Vec<QueueEntry>>,
    /// Serializes snapshot publication so an older read never overwrites a newer one
    publish_lock: Mutex<()>,
    event_tx: broadcast::Sender<Event>,
}

impl QueueRepository {
    /// Create a repository on the system clock
    pub async fn new(db: Arc<Database>, policy: RetryPolicy) -> Result<Self> {
        Self::with_clock(db, policy, Arc::new(SystemClock)).await
    }

    /// Create a repository with an explicit time source
    pub async fn with_clock(
        db: Arc<Database>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let initial = load_all(&db).await?;
        let (snapshot_tx, _) = watch::channel(initial);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            db,
            policy,
            clock,
            snapshot_tx,
            publish_lock: Mutex::new(()),
            event_tx,
        })
    }

    /// Retry policy applied by [`record_failure`](Self::record_failure)
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Current time according to the repository clock
    pub fn now(&self) -> DateTime<Utc> {
        millis_to_datetime(self.clock.now_millis())
    }

    /// Subscribe to download events
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Sender shared with other components that emit events
    pub(crate) fn event_sender(&self) -> broadcast::Sender<Event> {
        self.event_tx.clone()
    }

    fn emit_event(&self, event: Event) {
        // send() returns Err if there are no receivers, which is fine - we just drop the event
        self.event_tx.send(event).ok();
    }

    /// Enqueue one chapter
    ///
    /// Returns `None` when the chapter already has an entry; nothing is written
    /// in that case. The priority is stored as its code in `-1..=2`; rows read
    /// back with any other code clamp through [`Priority::from_i32`].
    pub async fn add(
        &self,
        manga_id: MangaId,
        chapter_id: ChapterId,
        priority: Priority,
    ) -> Result<Option<QueueEntryId>> {
        let now = self.clock.now_millis();
        let mut tx = self.db.begin_write().await?;
        let outcome = async {
            if queue::find_by_chapter_id(tx.conn(), chapter_id).await?.is_some() {
                return Ok(None);
            }
            queue::insert_pending(tx.conn(), manga_id, chapter_id, priority.to_i32(), now).await
        }
        .await;
        let inserted = tx.finish(outcome).await?;

        match inserted {
            Some(id) => {
                tracing::debug!(
                    entry_id = id.get(),
                    manga_id,
                    chapter_id,
                    priority = ?priority,
                    "Chapter queued"
                );
                self.emit_event(Event::Queued { chapter_id });
                self.publish().await;
            }
            None => tracing::debug!(chapter_id, "Chapter already queued"),
        }

        Ok(inserted)
    }

    /// Enqueue many chapters in one transaction with a shared `added_at`
    ///
    /// Chapters that are already queued, or repeated within `entries`, are
    /// skipped. Input order is preserved among the inserted rows. Returns the
    /// number of rows inserted.
    pub async fn add_all(&self, entries: &[(MangaId, ChapterId)], priority: Priority) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let now = self.clock.now_millis();
        let mut tx = self.db.begin_write().await?;
        let outcome = async {
            let mut inserted = Vec::with_capacity(entries.len());
            for &(manga_id, chapter_id) in entries {
                if queue::insert_pending(tx.conn(), manga_id, chapter_id, priority.to_i32(), now)
                    .await?
                    .is_some()
                {
                    inserted.push(chapter_id);
                }
            }
            Ok(inserted)
        }
        .await;
        let inserted = tx.finish(outcome).await?;

        tracing::info!(
            requested = entries.len(),
            inserted = inserted.len(),
            "Bulk enqueue finished"
        );

        if !inserted.is_empty() {
            for &chapter_id in &inserted {
                self.emit_event(Event::Queued { chapter_id });
            }
            self.publish().await;
        }

        Ok(inserted.len())
    }

    /// All pending entries, highest priority first, then oldest first
    pub async fn get_pending_by_priority(&self) -> Result<Vec<QueueEntry>> {
        let rows = queue::list_pending(self.db.pool()).await?;
        Ok(rows.into_iter().map(QueueEntry::from).collect())
    }

    /// Pending entries whose backoff window has elapsed, in service order
    pub async fn get_pending_with_backoff(&self) -> Result<Vec<QueueEntry>> {
        let rows = queue::list_pending_eligible(
            self.db.pool(),
            self.clock.now_millis(),
            duration_to_millis(self.policy.base_delay()),
            duration_to_millis(self.policy.max_delay()),
        )
        .await?;
        Ok(rows.into_iter().map(QueueEntry::from).collect())
    }

    /// Entry for a chapter, if queued
    pub async fn get_by_chapter_id(&self, chapter_id: ChapterId) -> Result<Option<QueueEntry>> {
        let row = queue::find_by_chapter_id(self.db.pool(), chapter_id).await?;
        Ok(row.map(QueueEntry::from))
    }

    /// All entries of one manga
    pub async fn get_by_manga_id(&self, manga_id: MangaId) -> Result<Vec<QueueEntry>> {
        let rows = queue::list_by_manga_id(self.db.pool(), manga_id).await?;
        Ok(rows.into_iter().map(QueueEntry::from).collect())
    }

    /// Every entry regardless of status
    pub async fn get_all(&self) -> Result<Vec<QueueEntry>> {
        load_all(&self.db).await
    }

    /// Stream of full-queue snapshots
    ///
    /// Yields the current queue immediately, then a fresh snapshot after every
    /// mutation. Intermediate snapshots may be skipped by slow consumers.
    pub fn subscribe(&self) -> WatchStream<Vec<QueueEntry>> {
        WatchStream::new(self.snapshot_tx.subscribe())
    }

    /// Overwrite status, last attempt and last error of one entry
    ///
    /// `None` clears the corresponding column. Returns whether the entry exists.
    pub async fn update_status(
        &self,
        id: QueueEntryId,
        status: QueueStatus,
        last_attempt_at: Option<DateTime<Utc>>,
        last_error_message: Option<&str>,
    ) -> Result<bool> {
        let updated = queue::write_status(
            self.db.pool(),
            id,
            status,
            last_attempt_at.map(|t| t.timestamp_millis()),
            last_error_message,
        )
        .await?;

        if updated > 0 {
            self.publish().await;
        }
        Ok(updated > 0)
    }

    /// Record a failed attempt for a chapter
    ///
    /// Retryable failures keep the entry pending with an incremented retry
    /// count; non-retryable ones, or a failure past the retry budget, mark it
    /// failed. Returns the decision taken, or `None` if the chapter is not
    /// queued or its entry is no longer pending.
    pub async fn record_failure(
        &self,
        chapter_id: ChapterId,
        error_message: &str,
        error_kind: FetchErrorKind,
    ) -> Result<Option<FailureDecision>> {
        let now = self.clock.now_millis();
        let mut tx = self.db.begin_write().await?;
        let outcome = async {
            let Some(row) = queue::find_by_chapter_id(tx.conn(), chapter_id).await? else {
                return Ok(None);
            };
            if QueueStatus::from_i32(row.status) != QueueStatus::Pending {
                tracing::debug!(
                    chapter_id,
                    status = row.status,
                    "Ignoring failure for entry that is not pending"
                );
                return Ok(None);
            }
            let id = QueueEntryId(row.id);
            let retry_count = u32::try_from(row.retry_count).unwrap_or(0);

            let decision = self.policy.decide(retry_count, error_kind);
            match decision {
                FailureDecision::Retry { retry_count } => {
                    queue::write_retry(tx.conn(), id, retry_count, now, error_message).await?;
                }
                FailureDecision::Fail => {
                    queue::write_status(
                        tx.conn(),
                        id,
                        QueueStatus::Failed,
                        Some(now),
                        Some(error_message),
                    )
                    .await?;
                }
            }
            Ok(Some(decision))
        }
        .await;
        let decision = tx.finish(outcome).await?;

        match decision {
            Some(FailureDecision::Retry { retry_count }) => {
                tracing::warn!(
                    chapter_id,
                    retry_count,
                    kind = ?error_kind,
                    error = error_message,
                    "Chapter download failed, will retry"
                );
            }
            Some(FailureDecision::Fail) => {
                tracing::error!(
                    chapter_id,
                    kind = ?error_kind,
                    error = error_message,
                    "Chapter download failed permanently"
                );
            }
            None => {
                tracing::debug!(chapter_id, "Failure not recorded");
                return Ok(None);
            }
        }

        self.publish().await;
        Ok(decision)
    }

    /// Mark a chapter as downloaded
    ///
    /// Clears the last error and stamps the attempt time. Returns `false` if the
    /// chapter is not queued or its entry is no longer pending.
    pub async fn mark_completed(&self, chapter_id: ChapterId) -> Result<bool> {
        let now = self.clock.now_millis();
        let mut tx = self.db.begin_write().await?;
        let outcome = async {
            let Some(row) = queue::find_by_chapter_id(tx.conn(), chapter_id).await? else {
                return Ok(false);
            };
            if QueueStatus::from_i32(row.status) != QueueStatus::Pending {
                tracing::debug!(
                    chapter_id,
                    status = row.status,
                    "Ignoring completion for entry that is not pending"
                );
                return Ok(false);
            }
            queue::write_status(
                tx.conn(),
                QueueEntryId(row.id),
                QueueStatus::Completed,
                Some(now),
                None,
            )
            .await?;
            Ok(true)
        }
        .await;
        let completed = tx.finish(outcome).await?;

        if completed {
            tracing::debug!(chapter_id, "Chapter marked completed");
            self.publish().await;
        }
        Ok(completed)
    }

    /// Change the priority of one entry
    pub async fn update_priority(&self, id: QueueEntryId, priority: Priority) -> Result<bool> {
        let updated = queue::write_priority(self.db.pool(), id, priority.to_i32()).await?;
        if updated > 0 {
            self.publish().await;
        }
        Ok(updated > 0)
    }

    /// Remove the entry for a chapter
    pub async fn remove_by_chapter_id(&self, chapter_id: ChapterId) -> Result<bool> {
        let deleted = queue::delete_by_chapter_id(self.db.pool(), chapter_id).await?;
        self.after_delete(deleted).await;
        Ok(deleted > 0)
    }

    /// Remove one entry by id
    pub async fn remove_by_id(&self, id: QueueEntryId) -> Result<bool> {
        let deleted = queue::delete_by_id(self.db.pool(), id).await?;
        self.after_delete(deleted).await;
        Ok(deleted > 0)
    }

    /// Remove every entry of a manga
    pub async fn remove_by_manga_id(&self, manga_id: MangaId) -> Result<u64> {
        let deleted = queue::delete_by_manga_id(self.db.pool(), manga_id).await?;
        self.after_delete(deleted).await;
        Ok(deleted)
    }

    /// Remove completed entries
    pub async fn clear_completed(&self) -> Result<u64> {
        let deleted = queue::delete_by_status(self.db.pool(), QueueStatus::Completed).await?;
        self.after_delete(deleted).await;
        Ok(deleted)
    }

    /// Remove every entry
    pub async fn clear_all(&self) -> Result<u64> {
        let deleted = queue::delete_all(self.db.pool()).await?;
        self.after_delete(deleted).await;
        Ok(deleted)
    }

    /// Return all failed entries to pending with a fresh retry budget
    pub async fn reset_failed_to_pending(&self) -> Result<u64> {
        let reset = queue::reset_failed(self.db.pool()).await?;
        if reset > 0 {
            tracing::info!(count = reset, "Failed entries reset to pending");
            self.publish().await;
        }
        Ok(reset)
    }

    /// Number of entries with a status
    pub async fn count_by_status(&self, status: QueueStatus) -> Result<u64> {
        let count = queue::count_by_status(self.db.pool(), status).await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Make pending entries that look abandoned mid-attempt eligible again
    ///
    /// There is no persisted running state, so an entry whose last attempt is
    /// older than `threshold` is assumed to belong to a run that died. Its
    /// `last_attempt_at` is cleared; status and retry count are kept.
    pub async fn reset_stuck_downloads(&self, threshold: Duration) -> Result<u64> {
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(duration_to_millis(threshold));
        let reset = queue::clear_stale_attempts(self.db.pool(), cutoff).await?;

        if reset > 0 {
            tracing::warn!(count = reset, "Requeued stuck entries");
            self.emit_event(Event::StuckReset { count: reset });
            self.publish().await;
        }
        Ok(reset)
    }

    async fn after_delete(&self, deleted: u64) {
        if deleted > 0 {
            tracing::debug!(count = deleted, "Queue entries removed");
            self.publish().await;
        }
    }

    /// Re-read the queue and push it to subscribers
    ///
    /// The mutation has already committed, so a failed read is only logged.
    async fn publish(&self) {
        let _guard = self.publish_lock.lock().await;
        match load_all(&self.db).await {
            Ok(entries) => {
                self.snapshot_tx.send_replace(entries);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to refresh queue snapshot");
            }
        }
    }
}

async fn load_all(db: &Database) -> Result<Vec<QueueEntry>> {
    let rows = queue::list_all(db.pool()).await?;
    Ok(rows.into_iter().map(QueueEntry::from).collect())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

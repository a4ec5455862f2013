//! Database layer for chapter-dl
//!
//! SQLite persistence for the download queue, the single source of truth for
//! queue state.
//!
//! ## Submodules
//!
//! - [`migrations`]: Database lifecycle, schema migrations
//! - [`queue`]: Store-level queue queries, usable on the pool or inside a
//!   write transaction
//!
//! Nothing outside [`QueueRepository`](crate::queue::QueueRepository) should call
//! the mutating queries directly.

use crate::error::DatabaseError;
use crate::types::{Priority, QueueEntry, QueueEntryId, QueueStatus};
use crate::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqlitePool;
use sqlx::{FromRow, Sqlite, SqliteConnection};

mod migrations;
pub(crate) mod queue;

/// Queue row as stored in SQLite
#[derive(Debug, Clone, FromRow)]
pub struct QueueEntryRow {
    /// Unique database ID
    pub id: i64,
    /// Manga the chapter belongs to
    pub manga_id: i64,
    /// Chapter id (unique)
    pub chapter_id: i64,
    /// Priority code (higher first)
    pub priority: i32,
    /// Unix milliseconds when the row was inserted
    pub added_at: i64,
    /// Recorded failures since last success or reset
    pub retry_count: i64,
    /// Unix milliseconds of the last attempt
    pub last_attempt_at: Option<i64>,
    /// Last failure description
    pub last_error_message: Option<String>,
    /// Status code (0=pending, 1=failed, 2=completed)
    pub status: i32,
}

impl From<QueueEntryRow> for QueueEntry {
    fn from(row: QueueEntryRow) -> Self {
        QueueEntry {
            id: QueueEntryId(row.id),
            manga_id: row.manga_id,
            chapter_id: row.chapter_id,
            priority: Priority::from_i32(row.priority),
            added_at: millis_to_datetime(row.added_at),
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            last_attempt_at: row.last_attempt_at.map(millis_to_datetime),
            last_error_message: row.last_error_message,
            status: QueueStatus::from_i32(row.status),
        }
    }
}

/// Stored millis to a timestamp, clamped to the representable range
pub(crate) fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    if let Some(at) = Utc.timestamp_millis_opt(millis).single() {
        return at;
    }
    tracing::warn!(millis, "Stored timestamp out of range, clamping");
    if millis < 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    }
}

/// Database handle for chapter-dl
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Start a write transaction (`BEGIN IMMEDIATE`)
    ///
    /// Taking the write lock up front serializes concurrent read-then-write
    /// operations: a second writer waits on the busy timeout instead of failing
    /// when it tries to upgrade a read lock.
    pub(crate) async fn begin_write(&self) -> Result<WriteTx> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to acquire connection: {}",
                e
            )))
        })?;

        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::TransactionFailed(format!(
                    "Failed to begin transaction: {}",
                    e
                )))
            })?;

        Ok(WriteTx { conn, open: true })
    }
}

/// An open write transaction
///
/// If dropped before [`finish`](WriteTx::finish) completes (e.g. the calling
/// future was cancelled), the connection is closed instead of being returned to
/// the pool, which makes SQLite discard the transaction.
pub(crate) struct WriteTx {
    conn: PoolConnection<Sqlite>,
    open: bool,
}

impl WriteTx {
    /// Connection to run statements on
    pub(crate) fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }

    /// Commit on `Ok`, roll back on `Err`, and pass the outcome through
    pub(crate) async fn finish<T>(mut self, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => {
                sqlx::query("COMMIT")
                    .execute(&mut *self.conn)
                    .await
                    .map_err(|e| {
                        Error::Database(DatabaseError::TransactionFailed(format!(
                            "Failed to commit transaction: {}",
                            e
                        )))
                    })?;
                self.open = false;
                Ok(value)
            }
            Err(e) => {
                if sqlx::query("ROLLBACK")
                    .execute(&mut *self.conn)
                    .await
                    .is_ok()
                {
                    self.open = false;
                }
                Err(e)
            }
        }
    }
}

impl Drop for WriteTx {
    fn drop(&mut self) {
        if self.open {
            self.conn.close_on_drop();
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

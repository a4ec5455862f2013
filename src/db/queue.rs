//! Store-level queue queries.
//!
//! Every function takes any SQLite executor, so the same statement runs on the
//! pool for plain reads and on a [`WriteTx`](super::WriteTx) connection inside
//! read-then-write operations.

use crate::error::DatabaseError;
use crate::types::{ChapterId, MangaId, QueueEntryId, QueueStatus};
use crate::{Error, Result};
use sqlx::sqlite::SqliteExecutor;

use super::QueueEntryRow;

fn query_failed(context: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| Error::Database(DatabaseError::QueryFailed(format!("{}: {}", context, e)))
}

/// Fetch the entry for a chapter
pub(crate) async fn find_by_chapter_id<'e, E>(
    executor: E,
    chapter_id: ChapterId,
) -> Result<Option<QueueEntryRow>>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query_as::<_, QueueEntryRow>(
        r#"
        SELECT
            id, manga_id, chapter_id, priority, added_at, retry_count,
            last_attempt_at, last_error_message, status
        FROM download_queue
        WHERE chapter_id = ?
        "#,
    )
    .bind(chapter_id)
    .fetch_optional(executor)
    .await
    .map_err(query_failed("Failed to get queue entry by chapter"))
}

/// Fetch the entry with a given id
pub(crate) async fn find_by_id<'e, E>(executor: E, id: QueueEntryId) -> Result<Option<QueueEntryRow>>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query_as::<_, QueueEntryRow>(
        r#"
        SELECT
            id, manga_id, chapter_id, priority, added_at, retry_count,
            last_attempt_at, last_error_message, status
        FROM download_queue
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await
    .map_err(query_failed("Failed to get queue entry"))
}

/// Insert a pending entry unless the chapter is already queued
///
/// Returns the new id, or `None` when the unique chapter index already holds a row.
pub(crate) async fn insert_pending<'e, E>(
    executor: E,
    manga_id: MangaId,
    chapter_id: ChapterId,
    priority: i32,
    added_at: i64,
) -> Result<Option<QueueEntryId>>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO download_queue (
            manga_id, chapter_id, priority, added_at, retry_count, status
        ) VALUES (?, ?, ?, ?, 0, ?)
        ON CONFLICT(chapter_id) DO NOTHING
        "#,
    )
    .bind(manga_id)
    .bind(chapter_id)
    .bind(priority)
    .bind(added_at)
    .bind(QueueStatus::Pending.to_i32())
    .execute(executor)
    .await
    .map_err(query_failed("Failed to insert queue entry"))?;

    if result.rows_affected() == 0 {
        Ok(None)
    } else {
        Ok(Some(QueueEntryId(result.last_insert_rowid())))
    }
}

/// All pending entries in service order
pub(crate) async fn list_pending<'e, E>(executor: E) -> Result<Vec<QueueEntryRow>>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query_as::<_, QueueEntryRow>(
        r#"
        SELECT
            id, manga_id, chapter_id, priority, added_at, retry_count,
            last_attempt_at, last_error_message, status
        FROM download_queue
        WHERE status = 0
        ORDER BY priority DESC, added_at ASC, id ASC
        "#,
    )
    .fetch_all(executor)
    .await
    .map_err(query_failed("Failed to list pending entries"))
}

/// Pending entries whose backoff window has elapsed at `now_ms`
///
/// The window is `0` for `retry_count = 0`, else
/// `min(base_ms << min(retry_count - 1, 30), cap_ms)`, the same function as
/// [`RetryPolicy::backoff`](crate::retry::RetryPolicy::backoff). The cap is
/// taken before shifting whenever the shift would exceed it, so the shift
/// never overflows.
pub(crate) async fn list_pending_eligible<'e, E>(
    executor: E,
    now_ms: i64,
    base_ms: i64,
    cap_ms: i64,
) -> Result<Vec<QueueEntryRow>>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query_as::<_, QueueEntryRow>(
        r#"
        SELECT
            id, manga_id, chapter_id, priority, added_at, retry_count,
            last_attempt_at, last_error_message, status
        FROM download_queue
        WHERE status = 0
          AND (
            last_attempt_at IS NULL
            OR last_attempt_at + (
                CASE
                    WHEN retry_count <= 0 THEN 0
                    WHEN ?1 > (?2 >> MIN(retry_count - 1, 30)) THEN ?2
                    ELSE ?1 << MIN(retry_count - 1, 30)
                END
            ) <= ?3
          )
        ORDER BY priority DESC, added_at ASC, id ASC
        "#,
    )
    .bind(base_ms)
    .bind(cap_ms)
    .bind(now_ms)
    .fetch_all(executor)
    .await
    .map_err(query_failed("Failed to list eligible entries"))
}

/// Entries for one manga, in service order
pub(crate) async fn list_by_manga_id<'e, E>(executor: E, manga_id: MangaId) -> Result<Vec<QueueEntryRow>>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query_as::<_, QueueEntryRow>(
        r#"
        SELECT
            id, manga_id, chapter_id, priority, added_at, retry_count,
            last_attempt_at, last_error_message, status
        FROM download_queue
        WHERE manga_id = ?
        ORDER BY priority DESC, added_at ASC, id ASC
        "#,
    )
    .bind(manga_id)
    .fetch_all(executor)
    .await
    .map_err(query_failed("Failed to list entries by manga"))
}

/// Every entry regardless of status
pub(crate) async fn list_all<'e, E>(executor: E) -> Result<Vec<QueueEntryRow>>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query_as::<_, QueueEntryRow>(
        r#"
        SELECT
            id, manga_id, chapter_id, priority, added_at, retry_count,
            last_attempt_at, last_error_message, status
        FROM download_queue
        ORDER BY priority DESC, added_at ASC, id ASC
        "#,
    )
    .fetch_all(executor)
    .await
    .map_err(query_failed("Failed to list queue entries"))
}

/// Overwrite status, last attempt and last error
pub(crate) async fn write_status<'e, E>(
    executor: E,
    id: QueueEntryId,
    status: QueueStatus,
    last_attempt_at: Option<i64>,
    last_error_message: Option<&str>,
) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        UPDATE download_queue
        SET status = ?, last_attempt_at = ?, last_error_message = ?
        WHERE id = ?
        "#,
    )
    .bind(status.to_i32())
    .bind(last_attempt_at)
    .bind(last_error_message)
    .bind(id)
    .execute(executor)
    .await
    .map_err(query_failed("Failed to update status"))?;

    Ok(result.rows_affected())
}

/// Keep an entry pending after a retryable failure
pub(crate) async fn write_retry<'e, E>(
    executor: E,
    id: QueueEntryId,
    retry_count: u32,
    last_attempt_at: i64,
    last_error_message: &str,
) -> Result<()>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        r#"
        UPDATE download_queue
        SET status = ?, retry_count = ?, last_attempt_at = ?, last_error_message = ?
        WHERE id = ?
        "#,
    )
    .bind(QueueStatus::Pending.to_i32())
    .bind(i64::from(retry_count))
    .bind(last_attempt_at)
    .bind(last_error_message)
    .bind(id)
    .execute(executor)
    .await
    .map_err(query_failed("Failed to record retry"))?;

    Ok(())
}

/// Update the priority of one entry
pub(crate) async fn write_priority<'e, E>(executor: E, id: QueueEntryId, priority: i32) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query("UPDATE download_queue SET priority = ? WHERE id = ?")
        .bind(priority)
        .bind(id)
        .execute(executor)
        .await
        .map_err(query_failed("Failed to update priority"))?;

    Ok(result.rows_affected())
}

/// Delete the entry for a chapter
pub(crate) async fn delete_by_chapter_id<'e, E>(executor: E, chapter_id: ChapterId) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query("DELETE FROM download_queue WHERE chapter_id = ?")
        .bind(chapter_id)
        .execute(executor)
        .await
        .map_err(query_failed("Failed to delete entry by chapter"))?;

    Ok(result.rows_affected())
}

/// Delete one entry by id
pub(crate) async fn delete_by_id<'e, E>(executor: E, id: QueueEntryId) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query("DELETE FROM download_queue WHERE id = ?")
        .bind(id)
        .execute(executor)
        .await
        .map_err(query_failed("Failed to delete entry"))?;

    Ok(result.rows_affected())
}

/// Delete all entries of one manga
pub(crate) async fn delete_by_manga_id<'e, E>(executor: E, manga_id: MangaId) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query("DELETE FROM download_queue WHERE manga_id = ?")
        .bind(manga_id)
        .execute(executor)
        .await
        .map_err(query_failed("Failed to delete entries by manga"))?;

    Ok(result.rows_affected())
}

/// Delete all entries with a status
pub(crate) async fn delete_by_status<'e, E>(executor: E, status: QueueStatus) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query("DELETE FROM download_queue WHERE status = ?")
        .bind(status.to_i32())
        .execute(executor)
        .await
        .map_err(query_failed("Failed to delete entries by status"))?;

    Ok(result.rows_affected())
}

/// Delete everything
pub(crate) async fn delete_all<'e, E>(executor: E) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query("DELETE FROM download_queue")
        .execute(executor)
        .await
        .map_err(query_failed("Failed to clear queue"))?;

    Ok(result.rows_affected())
}

/// Return every failed entry to pending with a fresh retry budget
pub(crate) async fn reset_failed<'e, E>(executor: E) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        UPDATE download_queue
        SET status = 0, retry_count = 0, last_attempt_at = NULL, last_error_message = NULL
        WHERE status = 1
        "#,
    )
    .execute(executor)
    .await
    .map_err(query_failed("Failed to reset failed entries"))?;

    Ok(result.rows_affected())
}

/// Number of entries with a status
pub(crate) async fn count_by_status<'e, E>(executor: E, status: QueueStatus) -> Result<i64>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM download_queue WHERE status = ?")
        .bind(status.to_i32())
        .fetch_one(executor)
        .await
        .map_err(query_failed("Failed to count entries"))
}

/// Clear `last_attempt_at` on pending entries last attempted before `cutoff_ms`
pub(crate) async fn clear_stale_attempts<'e, E>(executor: E, cutoff_ms: i64) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        UPDATE download_queue
        SET last_attempt_at = NULL
        WHERE status = 0
          AND last_attempt_at IS NOT NULL
          AND last_attempt_at < ?
        "#,
    )
    .bind(cutoff_ms)
    .execute(executor)
    .await
    .map_err(query_failed("Failed to reset stuck entries"))?;

    Ok(result.rows_affected())
}

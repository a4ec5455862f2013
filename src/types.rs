//! Core types for chapter-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a manga in the host application's library
pub type MangaId = i64;

/// Identifier of a chapter in the host application's library; the queue's natural key
pub type ChapterId = i64;

/// Unique identifier for a queue entry, assigned by the store on insert
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueEntryId(pub i64);

impl QueueEntryId {
    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for QueueEntryId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<QueueEntryId> for i64 {
    fn from(id: QueueEntryId) -> Self {
        id.0
    }
}

impl std::fmt::Display for QueueEntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Implement sqlx Type, Encode, and Decode for database operations
impl sqlx::Type<sqlx::Sqlite> for QueueEntryId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for QueueEntryId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for QueueEntryId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Queue entry status
///
/// Allowed transitions: `Pending → Completed`, `Pending → Pending` (retryable
/// failure), `Pending → Failed`, and `Failed → Pending` (explicit reset).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    /// Waiting to be fetched (possibly inside a backoff window)
    Pending,
    /// Terminal failure; needs an explicit reset
    Failed,
    /// Fetched successfully
    Completed,
}

impl QueueStatus {
    /// Convert integer status code to QueueStatus
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => QueueStatus::Pending,
            1 => QueueStatus::Failed,
            2 => QueueStatus::Completed,
            _ => QueueStatus::Failed, // Unknown codes are never picked up again
        }
    }

    /// Convert QueueStatus to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            QueueStatus::Pending => 0,
            QueueStatus::Failed => 1,
            QueueStatus::Completed => 2,
        }
    }
}

/// Queue priority; higher values are serviced first
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority (-1)
    Low = -1,
    /// Normal priority (0)
    #[default]
    Normal = 0,
    /// High priority (1)
    High = 1,
    /// Jump ahead of everything else (2)
    Urgent = 2,
}

impl Priority {
    /// Convert integer priority code to Priority
    ///
    /// Valid codes are the closed range `-1..=2`. Codes outside it clamp to the
    /// nearest end: below `-1` reads as [`Priority::Low`], above `2` as
    /// [`Priority::Urgent`].
    pub fn from_i32(priority: i32) -> Self {
        match priority {
            i32::MIN..=-1 => Priority::Low,
            0 => Priority::Normal,
            1 => Priority::High,
            _ => Priority::Urgent,
        }
    }

    /// Convert Priority to its integer code
    pub fn to_i32(&self) -> i32 {
        *self as i32
    }
}

/// One persisted unit of chapter download work
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Store-assigned identity
    pub id: QueueEntryId,
    /// Manga the chapter belongs to
    pub manga_id: MangaId,
    /// Chapter to download (unique across the queue)
    pub chapter_id: ChapterId,
    /// Service priority
    pub priority: Priority,
    /// When the entry was enqueued
    pub added_at: DateTime<Utc>,
    /// Failures recorded since the last success or reset
    pub retry_count: u32,
    /// Most recent attempt, if any
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Last recorded failure description
    pub last_error_message: Option<String>,
    /// Current status
    pub status: QueueStatus,
}

/// Lifecycle state of the download runner
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunnerState {
    /// Not processing; waiting for a trigger
    #[default]
    Idle,
    /// Processing the queue
    Active,
    /// Last activation ended
    Stopped {
        /// Why the activation ended
        reason: String,
    },
}

/// Event emitted by the download subsystem
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A chapter was added to the queue
    Queued {
        /// Chapter that was queued
        chapter_id: ChapterId,
    },

    /// The runner started processing the queue
    RunnerStarted,

    /// The runner stopped
    RunnerStopped {
        /// Why it stopped
        reason: String,
    },

    /// A chapter finished downloading
    ChapterCompleted {
        /// Chapter that completed
        chapter_id: ChapterId,
    },

    /// A chapter download failed
    ChapterFailed {
        /// Chapter that failed
        chapter_id: ChapterId,
        /// Failure description
        error: String,
        /// Whether the entry stays pending for another attempt
        will_retry: bool,
    },

    /// Stale entries were made eligible again
    StuckReset {
        /// Number of entries requeued
        count: u64,
    },
}

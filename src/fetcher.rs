//! Fetcher contract: the external collaborator that downloads one chapter.
//!
//! The queue never inspects fetch errors itself: the retryable/non-retryable
//! classification comes from the [`FetchErrorKind`] the fetcher reports.

use crate::library::WorkItem;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Classification of a failed fetch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    /// The source has no pages for this chapter
    NoPages,
    /// Connection failure, timeout, or HTTP error
    Network,
    /// The source rejected or mangled the request
    Source,
    /// Local storage is full or unwritable
    Storage,
    /// Anything else
    Unknown,
}

impl FetchErrorKind {
    /// Whether another attempt may succeed
    pub fn can_retry(&self) -> bool {
        match self {
            FetchErrorKind::NoPages | FetchErrorKind::Storage => false,
            FetchErrorKind::Network | FetchErrorKind::Source | FetchErrorKind::Unknown => true,
        }
    }
}

/// A failed fetch attempt
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct FetchError {
    /// Failure classification
    pub kind: FetchErrorKind,
    /// Human-readable description, stored on the queue entry
    pub message: String,
}

impl FetchError {
    /// Create a fetch error
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Downloads a single chapter
///
/// Implementations may be invoked more than once for the same chapter (retries,
/// stale-task recovery). The cancellation token is a hint: the runner never
/// aborts an in-flight call, but a fetcher may stop early when it fires.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch one chapter
    async fn fetch(
        &self,
        item: &WorkItem,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), FetchError>;
}

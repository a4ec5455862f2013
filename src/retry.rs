//! Retry policy with exponential backoff
//!
//! The queue never retries in-process: a failed chapter stays `Pending` with an
//! incremented `retry_count`, and becomes eligible again once its backoff window
//! has elapsed. This module holds the pure decision logic used by
//! [`QueueRepository::record_failure`](crate::queue::QueueRepository::record_failure)
//! and the backoff function the store-level eligibility query mirrors.
//!
//! # Example
//!
//! ```
//! use chapter_dl::retry::{FailureDecision, RetryPolicy};
//! use chapter_dl::fetcher::FetchErrorKind;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(3, Duration::from_secs(60), Duration::from_secs(3600));
//! assert_eq!(policy.backoff(0), Duration::ZERO);
//! assert_eq!(policy.backoff(2), Duration::from_secs(120));
//! assert_eq!(
//!     policy.decide(0, FetchErrorKind::Network),
//!     FailureDecision::Retry { retry_count: 1 }
//! );
//! assert_eq!(policy.decide(0, FetchErrorKind::NoPages), FailureDecision::Fail);
//! ```

use crate::config::RetryConfig;
use crate::error::{DatabaseError, Error};
use crate::fetcher::FetchErrorKind;
use rand::Rng;
use std::time::Duration;

/// Highest shift applied to the base delay; keeps the multiplication inside i64
pub(crate) const MAX_BACKOFF_SHIFT: u32 = 30;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, source busy) should return `true`.
/// Permanent failures (chapter has no pages, disk full) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for FetchErrorKind {
    fn is_retryable(&self) -> bool {
        self.can_retry()
    }
}

/// Implementation of IsRetryable for our Error type
impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // SQLite busy/locked conditions clear up on their own
            Error::Sqlx(sqlx::Error::PoolTimedOut) => true,
            Error::Sqlx(sqlx::Error::Database(db)) => is_transient_store_message(db.message()),
            // Store queries carry the sqlx error as text
            Error::Database(
                DatabaseError::QueryFailed(msg) | DatabaseError::TransactionFailed(msg),
            ) => is_transient_store_message(msg),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            Error::Sqlx(_) | Error::Database(_) => false,
            Error::Config { .. } => false,
            Error::Serialization(_) => false,
            Error::LegacyStore(_) => false,
            Error::Scheduler(_) => false,
            Error::ShuttingDown => false,
        }
    }
}

fn is_transient_store_message(msg: &str) -> bool {
    msg.contains("locked") || msg.contains("busy") || msg.contains("timed out")
}

/// Outcome of recording one failure against a queue entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureDecision {
    /// Entry stays pending with the new retry count
    Retry {
        /// Retry count after this failure
        retry_count: u32,
    },
    /// Entry becomes failed; no more automatic attempts
    Fail,
}

/// Retry decision and backoff computation for queue entries
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Create a policy from explicit values
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Maximum number of retryable failures tolerated
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff base delay
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Backoff cap
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Decide what a new failure does to an entry that has `retry_count` failures so far
    pub fn decide(&self, retry_count: u32, kind: FetchErrorKind) -> FailureDecision {
        let new_retry_count = retry_count.saturating_add(1);
        if !kind.can_retry() || new_retry_count > self.max_retries {
            FailureDecision::Fail
        } else {
            FailureDecision::Retry {
                retry_count: new_retry_count,
            }
        }
    }

    /// Backoff window for an entry with `retry_count` recorded failures
    ///
    /// Zero for entries that never failed; otherwise `base · 2^(retry_count-1)`,
    /// capped at `max_delay`. Must stay in sync with the SQL eligibility filter in
    /// `db::queue`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let shift = (retry_count - 1).min(MAX_BACKOFF_SHIFT);
        let base_ms = crate::clock::duration_to_millis(self.base_delay);
        let cap_ms = crate::clock::duration_to_millis(self.max_delay);
        let delay_ms = base_ms.saturating_mul(1i64 << shift).min(cap_ms);
        Duration::from_millis(delay_ms.max(0) as u64)
    }

    /// Whether an entry's backoff window has elapsed at `now_millis`
    pub fn is_eligible(&self, retry_count: u32, last_attempt_millis: Option<i64>, now_millis: i64) -> bool {
        match last_attempt_millis {
            None => true,
            Some(last) => {
                let window = crate::clock::duration_to_millis(self.backoff(retry_count));
                last.saturating_add(window) <= now_millis
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_retries, config.initial_delay, config.max_delay)
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// result lies between `delay` and `2 * delay`.
pub(crate) fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}

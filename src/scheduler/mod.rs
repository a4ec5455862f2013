//! Job scheduling contract for recurring and one-shot background work.
//!
//! The download subsystem never runs its own timers for the downloader, the
//! history poll or the temp-folder cleanup. It describes each job (name,
//! interval, constraints, backoff) to a [`JobScheduler`], which decides when the
//! registered [`JobHandler`] actually runs. On a mobile OS that is the platform's
//! work manager; [`TokioJobScheduler`] is the in-process implementation.
//!
//! # Example
//!
//! ```rust
//! use chapter_dl::scheduler::{
//!     BackoffCriteria, DeviceConditions, JobConstraints, NetworkState, NetworkType,
//! };
//! use std::time::Duration;
//!
//! let constraints = JobConstraints {
//!     network_type: NetworkType::Unmetered,
//!     battery_not_low: true,
//!     storage_not_low: true,
//! };
//!
//! let on_mobile_data = DeviceConditions {
//!     network: NetworkState { connected: true, metered: true },
//!     ..Default::default()
//! };
//! assert!(constraints.violation(&on_mobile_data).is_some());
//!
//! let backoff = BackoffCriteria::exponential(Duration::from_secs(30));
//! assert_eq!(backoff.delay(3), Duration::from_secs(120));
//! ```

use crate::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod local;

pub use local::TokioJobScheduler;

/// Longest delay a backoff policy will produce
pub const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(5 * 60 * 60);

/// Network requirement of a job
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    /// No network needed
    #[default]
    None,
    /// Any connection that is not metered (typically Wi-Fi)
    Unmetered,
    /// Any connection
    Connected,
}

/// Conditions that must hold before a job may run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConstraints {
    /// Required network
    pub network_type: NetworkType,
    /// Do not run while the battery is low
    pub battery_not_low: bool,
    /// Do not run while storage is low
    pub storage_not_low: bool,
}

impl JobConstraints {
    /// Describe the first unmet constraint, or `None` when all hold
    pub fn violation(&self, conditions: &DeviceConditions) -> Option<String> {
        if let Some(reason) = self.network_type.violation(&conditions.network) {
            return Some(reason);
        }
        if self.battery_not_low && conditions.battery_low {
            return Some("battery is low".to_string());
        }
        if self.storage_not_low && conditions.storage_low {
            return Some("storage is low".to_string());
        }
        None
    }
}

impl NetworkType {
    /// Describe why `network` does not satisfy this requirement
    pub fn violation(&self, network: &NetworkState) -> Option<String> {
        match self {
            NetworkType::None => None,
            NetworkType::Connected if !network.connected => Some("no network connection".to_string()),
            NetworkType::Connected => None,
            NetworkType::Unmetered if !network.connected => Some("no network connection".to_string()),
            NetworkType::Unmetered if network.metered => {
                Some("connection is metered, waiting for an unmetered network".to_string())
            }
            NetworkType::Unmetered => None,
        }
    }
}

/// Current network state as reported by the host
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    /// Any connection is up
    pub connected: bool,
    /// The active connection is metered
    pub metered: bool,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            connected: true,
            metered: false,
        }
    }
}

/// Device state that job constraints are evaluated against
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConditions {
    /// Network state
    pub network: NetworkState,
    /// Battery is low
    pub battery_low: bool,
    /// Storage is low
    pub storage_low: bool,
}

/// Growth of retry delays
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Delay doubles with each attempt
    #[default]
    Exponential,
    /// Delay grows by the initial delay with each attempt
    Linear,
}

/// How a job is retried after a [`JobOutcome::Retry`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffCriteria {
    /// Growth policy
    pub policy: BackoffPolicy,
    /// Delay before the first retry
    pub initial_delay: Duration,
}

impl BackoffCriteria {
    /// Exponential backoff starting at `initial_delay`
    pub fn exponential(initial_delay: Duration) -> Self {
        Self {
            policy: BackoffPolicy::Exponential,
            initial_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based), capped at [`MAX_BACKOFF_DELAY`]
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.policy {
            BackoffPolicy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.initial_delay.saturating_mul(factor)
            }
            BackoffPolicy::Linear => self.initial_delay.saturating_mul(attempt),
        };
        delay.min(MAX_BACKOFF_DELAY)
    }
}

impl Default for BackoffCriteria {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(30))
    }
}

/// A recurring job
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeriodicJob {
    /// Unique name; scheduling the same name again replaces the schedule
    pub name: String,
    /// Period between runs
    pub interval: Duration,
    /// Window at the end of each period in which the run may start
    pub flex: Duration,
    /// Conditions required to run
    pub constraints: JobConstraints,
    /// Retry behaviour
    pub backoff: BackoffCriteria,
}

/// Result reported by a job handler
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// Work done
    Success,
    /// Run again after the job's backoff delay
    Retry,
    /// Give up on this run
    Failure,
}

/// Work executed when a scheduled job fires
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job; `cancel` fires when the job is cancelled or the scheduler shuts down
    async fn run(&self, cancel: CancellationToken) -> JobOutcome;
}

/// Facility that runs named background jobs under constraints
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Schedule or replace a recurring job
    ///
    /// Scheduling an identical job again keeps the current schedule. A changed
    /// job keeps the time already elapsed in the current period.
    async fn schedule_periodic(&self, job: PeriodicJob) -> Result<()>;

    /// Schedule or replace a single run
    async fn schedule_one_shot(
        &self,
        name: &str,
        constraints: JobConstraints,
        backoff: BackoffCriteria,
    ) -> Result<()>;

    /// Stop scheduling a job and signal its in-flight run
    async fn cancel(&self, name: &str) -> Result<()>;

    /// Whether a run of the job is in progress
    async fn is_running(&self, name: &str) -> bool;

    /// Running state of the job, starting with the current value
    async fn running_stream(&self, name: &str) -> BoxStream<'static, bool>;
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

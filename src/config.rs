//! Configuration types for chapter-dl

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Main configuration
///
/// Fields are organized into logical sub-configs:
/// - [`persistence`](PersistenceConfig): database and legacy store locations
/// - [`queue`](QueueConfig): retry policy and stale-task recovery
/// - [`preferences`](DownloadPreferences): user preferences that drive scheduling
/// - [`janitor`](JanitorConfig): orphaned temp-folder cleanup
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Data storage locations
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Queue retry and recovery behavior
    #[serde(default)]
    pub queue: QueueConfig,

    /// User preferences applied at startup (can be changed at runtime)
    #[serde(default)]
    pub preferences: DownloadPreferences,

    /// Temp-folder cleanup settings
    #[serde(default)]
    pub janitor: JanitorConfig,
}

impl Config {
    /// Check settings that would make the queue misbehave at runtime
    pub fn validate(&self) -> Result<()> {
        let retry = &self.queue.retry;
        if retry.initial_delay.is_zero() {
            return Err(Error::config(
                "queue.retry.initial_delay",
                "backoff base delay must be greater than zero",
            ));
        }
        if retry.max_delay < retry.initial_delay {
            return Err(Error::config(
                "queue.retry.max_delay",
                "backoff cap must not be smaller than the base delay",
            ));
        }
        if self.queue.stuck_threshold <= retry.max_delay {
            return Err(Error::config(
                "queue.stuck_threshold",
                "stuck threshold must exceed the maximum backoff delay",
            ));
        }
        if self.janitor.temp_suffix.is_empty() {
            return Err(Error::config(
                "janitor.temp_suffix",
                "temp suffix must not be empty",
            ));
        }
        Ok(())
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Database path (default: "./chapter-dl.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Legacy key/value queue file to migrate on startup (None = nothing to migrate)
    #[serde(default)]
    pub legacy_queue_path: Option<PathBuf>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            legacy_queue_path: None,
        }
    }
}

/// Queue behavior configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Retry policy for failed chapters
    #[serde(default)]
    pub retry: RetryConfig,

    /// Age of `last_attempt_at` after which a pending entry is considered abandoned
    /// (default: 2 hours)
    #[serde(default = "default_stuck_threshold", with = "duration_serde")]
    pub stuck_threshold: Duration,

    /// How often the stale-task reconciler runs (default: 15 minutes)
    #[serde(default = "default_reconcile_interval", with = "duration_serde")]
    pub reconcile_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            stuck_threshold: default_stuck_threshold(),
            reconcile_interval: default_reconcile_interval(),
        }
    }
}

/// Retry behavior for failed chapter downloads
///
/// The backoff doubles with each recorded failure, starting at `initial_delay`
/// and capped at `max_delay`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retryable failures before an entry becomes failed (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff after the first failure (default: 1 minute)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum backoff (default: 1 hour)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
        }
    }
}

/// User preferences that translate into scheduling constraints
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPreferences {
    /// Only download over unmetered networks (Wi-Fi) (default: true)
    #[serde(default = "default_true")]
    pub only_on_unmetered: bool,

    /// Interval of the periodic downloader trigger; zero disables it (default: 0)
    #[serde(default, with = "duration_serde")]
    pub downloader_interval: Duration,

    /// Periodically queue the next chapters of recently read manga (default: false)
    #[serde(default)]
    pub auto_download_from_history: bool,

    /// Periodically remove orphaned temp folders (default: true)
    #[serde(default = "default_true")]
    pub clean_temp_folders: bool,
}

impl Default for DownloadPreferences {
    fn default() -> Self {
        Self {
            only_on_unmetered: true,
            downloader_interval: Duration::ZERO,
            auto_download_from_history: false,
            clean_temp_folders: true,
        }
    }
}

/// Orphaned temp-folder cleanup configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JanitorConfig {
    /// Root of the chapter download tree (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Directory-name suffix that marks an in-progress chapter (default: "_tmp")
    #[serde(default = "default_temp_suffix")]
    pub temp_suffix: String,

    /// Temp folders younger than this are left alone (default: 1 hour)
    #[serde(default = "default_min_age", with = "duration_serde")]
    pub min_age: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            temp_suffix: default_temp_suffix(),
            min_age: default_min_age(),
        }
    }
}

// Default value functions
fn default_database_path() -> PathBuf {
    PathBuf::from("chapter-dl.db")
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_temp_suffix() -> String {
    "_tmp".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_stuck_threshold() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_min_age() -> Duration {
    Duration::from_secs(60 * 60)
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

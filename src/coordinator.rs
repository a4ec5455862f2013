//! Periodic work coordination
//!
//! Translates [`DownloadPreferences`] into job schedules:
//!
//! | Job | Schedule | Constraints |
//! |-----|----------|-------------|
//! | [`DOWNLOADER_JOB`] | `downloader_interval`, 0 disables | unmetered or any network, battery and storage not low |
//! | [`AUTO_DOWNLOAD_JOB`] | every 12 h | battery not low |
//! | [`CLEANUP_JOB`] | daily | battery and storage not low |
//!
//! Every job uses a unique name, so re-applying preferences replaces the
//! existing schedule instead of adding another one.

use crate::config::DownloadPreferences;
use crate::library::AutoDownloadCandidates;
use crate::queue::QueueRepository;
use crate::runner::required_network;
use crate::scheduler::{
    BackoffCriteria, JobConstraints, JobHandler, JobOutcome, JobScheduler, NetworkType,
    PeriodicJob,
};
use crate::Result;
use crate::types::Priority;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Recurring downloader trigger
pub const DOWNLOADER_JOB: &str = "chapter-downloader";
/// One-shot downloader trigger
pub const DOWNLOADER_NOW_JOB: &str = "chapter-downloader-now";
/// History-based auto-download poll
pub const AUTO_DOWNLOAD_JOB: &str = "history-auto-download";
/// Orphaned temp folder cleanup
pub const CLEANUP_JOB: &str = "temp-folder-cleanup";

const DOWNLOADER_FLEX: Duration = Duration::from_secs(10 * 60);
const AUTO_DOWNLOAD_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
const AUTO_DOWNLOAD_FLEX: Duration = Duration::from_secs(60 * 60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const CLEANUP_FLEX: Duration = Duration::from_secs(6 * 60 * 60);
const JOB_BACKOFF: Duration = Duration::from_secs(30);

/// Constraints for any downloader run under `preferences`
pub fn downloader_constraints(preferences: &DownloadPreferences) -> JobConstraints {
    JobConstraints {
        network_type: required_network(preferences),
        battery_not_low: true,
        storage_not_low: true,
    }
}

/// Schedules and cancels the recurring jobs of the download subsystem
pub struct PeriodicWorkCoordinator {
    scheduler: Arc<dyn JobScheduler>,
}

impl PeriodicWorkCoordinator {
    /// Create a coordinator on top of a job scheduler
    pub fn new(scheduler: Arc<dyn JobScheduler>) -> Self {
        Self { scheduler }
    }

    /// Bring all three schedules in line with `preferences`
    pub async fn apply(&self, preferences: &DownloadPreferences) -> Result<()> {
        self.schedule_downloader(preferences).await?;
        self.schedule_auto_download(preferences.auto_download_from_history)
            .await?;
        self.schedule_cleanup(preferences.clean_temp_folders).await?;
        Ok(())
    }

    /// Schedule the recurring downloader, or cancel it when the interval is zero
    pub async fn schedule_downloader(&self, preferences: &DownloadPreferences) -> Result<()> {
        let interval = preferences.downloader_interval;
        if interval.is_zero() {
            debug!("Periodic downloader disabled");
            return self.scheduler.cancel(DOWNLOADER_JOB).await;
        }

        self.scheduler
            .schedule_periodic(PeriodicJob {
                name: DOWNLOADER_JOB.to_string(),
                interval,
                flex: DOWNLOADER_FLEX.min(interval),
                constraints: downloader_constraints(preferences),
                backoff: BackoffCriteria::exponential(JOB_BACKOFF),
            })
            .await
    }

    /// Schedule or cancel the history-based auto-download poll
    pub async fn schedule_auto_download(&self, enabled: bool) -> Result<()> {
        if !enabled {
            debug!("History auto-download disabled");
            return self.scheduler.cancel(AUTO_DOWNLOAD_JOB).await;
        }

        self.scheduler
            .schedule_periodic(PeriodicJob {
                name: AUTO_DOWNLOAD_JOB.to_string(),
                interval: AUTO_DOWNLOAD_INTERVAL,
                flex: AUTO_DOWNLOAD_FLEX,
                constraints: JobConstraints {
                    network_type: NetworkType::None,
                    battery_not_low: true,
                    storage_not_low: false,
                },
                backoff: BackoffCriteria::exponential(JOB_BACKOFF),
            })
            .await
    }

    /// Schedule or cancel the temp folder cleanup
    pub async fn schedule_cleanup(&self, enabled: bool) -> Result<()> {
        if !enabled {
            debug!("Temp folder cleanup disabled");
            return self.scheduler.cancel(CLEANUP_JOB).await;
        }

        self.scheduler
            .schedule_periodic(PeriodicJob {
                name: CLEANUP_JOB.to_string(),
                interval: CLEANUP_INTERVAL,
                flex: CLEANUP_FLEX,
                constraints: JobConstraints {
                    network_type: NetworkType::None,
                    battery_not_low: true,
                    storage_not_low: true,
                },
                backoff: BackoffCriteria::exponential(JOB_BACKOFF),
            })
            .await
    }

    /// Run the downloader as soon as its constraints allow
    pub async fn start_downloader_now(&self, preferences: &DownloadPreferences) -> Result<()> {
        info!("Starting downloader now");
        self.scheduler
            .schedule_one_shot(
                DOWNLOADER_NOW_JOB,
                downloader_constraints(preferences),
                BackoffCriteria::exponential(JOB_BACKOFF),
            )
            .await
    }

    /// Cancel the one-shot downloader trigger and signal its in-flight run
    pub async fn stop_downloader(&self) -> Result<()> {
        self.scheduler.cancel(DOWNLOADER_NOW_JOB).await
    }

    /// Whether either downloader trigger is running
    pub async fn is_downloader_running(&self) -> bool {
        self.scheduler.is_running(DOWNLOADER_NOW_JOB).await
            || self.scheduler.is_running(DOWNLOADER_JOB).await
    }

    /// Re-apply schedules on every preference change until `cancel` fires
    pub fn watch_preferences(
        self: Arc<Self>,
        mut preferences: watch::Receiver<DownloadPreferences>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = preferences.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }

                let current = preferences.borrow_and_update().clone();
                info!(?current, "Download preferences changed, rescheduling jobs");
                if let Err(e) = self.apply(&current).await {
                    warn!(error = %e, "Failed to reschedule jobs");
                }
            }
            debug!("Preference watcher stopped");
        })
    }
}

/// Job that enqueues chapters suggested by reading history and starts the downloader
pub struct HistoryAutoDownload {
    candidates: Arc<dyn AutoDownloadCandidates>,
    repo: Arc<QueueRepository>,
    coordinator: Arc<PeriodicWorkCoordinator>,
    preferences: watch::Receiver<DownloadPreferences>,
}

impl HistoryAutoDownload {
    /// Create the job
    pub fn new(
        candidates: Arc<dyn AutoDownloadCandidates>,
        repo: Arc<QueueRepository>,
        coordinator: Arc<PeriodicWorkCoordinator>,
        preferences: watch::Receiver<DownloadPreferences>,
    ) -> Self {
        Self {
            candidates,
            repo,
            coordinator,
            preferences,
        }
    }
}

#[async_trait]
impl JobHandler for HistoryAutoDownload {
    async fn run(&self, _cancel: CancellationToken) -> JobOutcome {
        let chapters = match self.candidates.candidates().await {
            Ok(chapters) => chapters,
            Err(e) => {
                warn!(error = %e, "Failed to load auto-download candidates");
                return JobOutcome::Retry;
            }
        };
        if chapters.is_empty() {
            debug!("No auto-download candidates");
            return JobOutcome::Success;
        }

        let inserted = match self.repo.add_all(&chapters, Priority::Normal).await {
            Ok(inserted) => inserted,
            Err(e) => {
                warn!(error = %e, "Failed to enqueue auto-download candidates");
                return JobOutcome::Retry;
            }
        };
        info!(
            candidates = chapters.len(),
            inserted, "History auto-download enqueued chapters"
        );

        if inserted > 0 {
            let preferences = self.preferences.borrow().clone();
            if let Err(e) = self.coordinator.start_downloader_now(&preferences).await {
                warn!(error = %e, "Failed to start downloader after auto-download poll");
            }
        }
        JobOutcome::Success
    }
}

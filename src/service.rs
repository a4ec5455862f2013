//! Download service wiring
//!
//! [`DownloadService`] owns every component of the subsystem. Construction:
//!
//! 1. Validate the configuration and open the database
//! 2. Build the queue repository
//! 3. Migrate the legacy key/value queue, if one is configured, and restore pending work
//! 4. Register the runner, auto-download and cleanup handlers with the scheduler
//! 5. Apply the preferences and start watching them
//! 6. Start the stale-task reconciler

use crate::config::{Config, DownloadPreferences};
use crate::coordinator::{
    AUTO_DOWNLOAD_JOB, CLEANUP_JOB, DOWNLOADER_JOB, DOWNLOADER_NOW_JOB, HistoryAutoDownload,
    PeriodicWorkCoordinator,
};
use crate::db::Database;
use crate::fetcher::Fetcher;
use crate::janitor::TempArtifactJanitor;
use crate::library::{AutoDownloadCandidates, LibraryLookup, WorkItem};
use crate::migration::{JsonFileLegacyStore, LegacyMigrator, MigrationReport, restore_pending};
use crate::queue::QueueRepository;
use crate::reconciler::StaleTaskReconciler;
use crate::retry::RetryPolicy;
use crate::runner::{DownloadRunner, RunnerDeps};
use crate::scheduler::{DeviceConditions, TokioJobScheduler};
use crate::types::{Event, RunnerState};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long shutdown waits for an in-flight runner activation
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// External collaborators supplied by the embedding application
#[derive(Clone)]
pub struct Collaborators {
    /// Resolves manga and chapter identity
    pub library: Arc<dyn LibraryLookup>,
    /// Downloads a single chapter
    pub fetcher: Arc<dyn Fetcher>,
    /// Chapters suggested by reading history
    pub candidates: Arc<dyn AutoDownloadCandidates>,
}

/// Background chapter download subsystem
pub struct DownloadService {
    db: Arc<Database>,
    repo: Arc<QueueRepository>,
    scheduler: Arc<TokioJobScheduler>,
    coordinator: Arc<PeriodicWorkCoordinator>,
    runner: Arc<DownloadRunner>,
    preferences_tx: watch::Sender<DownloadPreferences>,
    migration: MigrationReport,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DownloadService {
    /// Build and start the service
    pub async fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        Self::with_conditions(config, collaborators, DeviceConditions::default()).await
    }

    /// Build and start the service with known initial device conditions
    pub async fn with_conditions(
        config: Config,
        collaborators: Collaborators,
        conditions: DeviceConditions,
    ) -> Result<Self> {
        config.validate()?;

        let db = Arc::new(Database::new(&config.persistence.database_path).await?);
        let repo = Arc::new(
            QueueRepository::new(db.clone(), RetryPolicy::from(&config.queue.retry)).await?,
        );

        let migration = match &config.persistence.legacy_queue_path {
            Some(path) => {
                let store = Arc::new(JsonFileLegacyStore::new(path));
                LegacyMigrator::new(store, repo.clone(), collaborators.library.clone())
                    .migrate()
                    .await?
            }
            None => MigrationReport {
                complete: true,
                work_items: restore_pending(&repo, collaborators.library.as_ref()).await?,
                ..Default::default()
            },
        };

        let scheduler = Arc::new(TokioJobScheduler::new(conditions));
        let coordinator = Arc::new(PeriodicWorkCoordinator::new(scheduler.clone()));
        let (preferences_tx, preferences_rx) = watch::channel(config.preferences.clone());

        let runner = Arc::new(DownloadRunner::new(RunnerDeps {
            repo: repo.clone(),
            library: collaborators.library.clone(),
            fetcher: collaborators.fetcher.clone(),
            conditions: scheduler.watch_conditions(),
            preferences: preferences_rx.clone(),
            stuck_threshold: config.queue.stuck_threshold,
        }));
        scheduler.register(DOWNLOADER_JOB, runner.clone()).await;
        scheduler.register(DOWNLOADER_NOW_JOB, runner.clone()).await;
        scheduler
            .register(
                AUTO_DOWNLOAD_JOB,
                Arc::new(HistoryAutoDownload::new(
                    collaborators.candidates.clone(),
                    repo.clone(),
                    coordinator.clone(),
                    preferences_rx.clone(),
                )),
            )
            .await;
        scheduler
            .register(
                CLEANUP_JOB,
                Arc::new(TempArtifactJanitor::new(config.janitor.clone())),
            )
            .await;

        coordinator.apply(&config.preferences).await?;

        let cancel = CancellationToken::new();
        let watcher = coordinator
            .clone()
            .watch_preferences(preferences_rx, cancel.child_token());
        let reconciler = StaleTaskReconciler::new(
            repo.clone(),
            config.queue.stuck_threshold,
            config.queue.reconcile_interval,
        );
        let reconciler = tokio::spawn(reconciler.run(cancel.child_token()));

        tracing::info!(
            database = %config.persistence.database_path.display(),
            migrated = migration.legacy_entries,
            restored = migration.work_items.len(),
            "Download service started"
        );

        Ok(Self {
            db,
            repo,
            scheduler,
            coordinator,
            runner,
            preferences_tx,
            migration,
            cancel,
            tasks: Mutex::new(vec![watcher, reconciler]),
        })
    }

    /// Queue repository for producers and consumers of queue state
    pub fn queue(&self) -> &Arc<QueueRepository> {
        &self.repo
    }

    /// Subscribe to runner and queue events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.repo.subscribe_events()
    }

    /// Subscribe to runner lifecycle changes
    pub fn watch_runner_state(&self) -> watch::Receiver<RunnerState> {
        self.runner.watch_state()
    }

    /// Result of the startup legacy migration
    pub fn migration_report(&self) -> &MigrationReport {
        &self.migration
    }

    /// Work restored from the queue at startup
    pub fn restored_work(&self) -> &[WorkItem] {
        &self.migration.work_items
    }

    /// Current download preferences
    pub fn preferences(&self) -> DownloadPreferences {
        self.preferences_tx.borrow().clone()
    }

    /// Replace the download preferences; jobs are rescheduled in the background
    pub fn update_preferences(&self, preferences: DownloadPreferences) {
        tracing::debug!(?preferences, "Updating download preferences");
        self.preferences_tx.send_replace(preferences);
    }

    /// Report new device conditions (network, battery, storage)
    pub fn update_conditions(&self, conditions: DeviceConditions) {
        self.scheduler.update_conditions(conditions);
    }

    /// Start the downloader as soon as constraints allow
    pub async fn start_now(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        self.coordinator
            .start_downloader_now(&self.preferences())
            .await
    }

    /// Stop the current download activation
    ///
    /// The recurring downloader schedule stays in place.
    pub async fn stop_downloads(&self) -> Result<()> {
        self.coordinator.stop_downloader().await?;
        self.runner.stop().await;
        Ok(())
    }

    /// Whether a downloader job is running
    pub async fn is_downloading(&self) -> bool {
        self.coordinator.is_downloader_running().await
    }

    /// Gracefully shut down
    ///
    /// Stops the scheduler and background tasks, waits for the runner to leave
    /// its current chapter, then closes the database.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        self.cancel.cancel();
        self.scheduler.shutdown();
        self.runner.stop().await;

        let mut state = self.runner.watch_state();
        let stopped = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            state
                .wait_for(|s| !matches!(s, RunnerState::Active))
                .await
                .is_ok()
        })
        .await
        .is_ok();
        if stopped {
            tracing::info!("Runner stopped");
        } else {
            tracing::warn!("Timeout waiting for runner to stop, proceeding with shutdown");
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.db.close().await;
        tracing::info!("Graceful shutdown complete");
        Ok(())
    }
}

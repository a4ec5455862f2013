//! # chapter-dl
//!
//! Background chapter download orchestration for manga reader applications.
//!
//! ## Design Philosophy
//!
//! chapter-dl is designed to be:
//! - **Durable** - The queue lives in SQLite and survives restarts and crashes
//! - **Constraint-aware** - Downloads only run when network, battery and storage allow
//! - **Library-first** - No CLI or UI, collaborators are supplied as trait objects
//! - **Event-driven** - Consumers subscribe to events and queue snapshots
//!
//! ## Quick Start
//!
//! ```no_run
//! use chapter_dl::{Collaborators, Config, DownloadService, Priority};
//! # fn collaborators() -> Collaborators { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = DownloadService::new(Config::default(), collaborators()).await?;
//!
//!     // Subscribe to events
//!     let mut events = service.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     service.queue().add(1, 42, Priority::High).await?;
//!     service.start_now().await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Time source abstraction
pub mod clock;
/// Configuration types
pub mod config;
/// Preference-driven job scheduling
pub mod coordinator;
/// Database persistence layer
pub mod db;
/// Error types
pub mod error;
/// Chapter fetcher contract
pub mod fetcher;
/// Orphaned temp folder cleanup
pub mod janitor;
/// Library lookup contracts
pub mod library;
/// One-time legacy queue migration
pub mod migration;
/// Transactional queue repository
pub mod queue;
/// Stale-task recovery
pub mod reconciler;
/// Retry logic with exponential backoff
pub mod retry;
/// Queue-draining download runner
pub mod runner;
/// Job scheduling contract and local implementation
pub mod scheduler;
/// Service wiring and lifecycle
pub mod service;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, DownloadPreferences, JanitorConfig, QueueConfig, RetryConfig};
pub use coordinator::{HistoryAutoDownload, PeriodicWorkCoordinator};
pub use db::Database;
pub use error::{DatabaseError, Error, Result};
pub use fetcher::{FetchError, FetchErrorKind, Fetcher};
pub use janitor::{Filesystem, LocalFilesystem, TempArtifactJanitor};
pub use library::{AutoDownloadCandidates, Chapter, LibraryLookup, Manga, WorkItem};
pub use migration::{
    JsonFileLegacyStore, LegacyEntry, LegacyMigrator, LegacyQueueStore, MigrationReport,
    restore_pending,
};
pub use queue::QueueRepository;
pub use reconciler::StaleTaskReconciler;
pub use retry::{FailureDecision, IsRetryable, RetryPolicy};
pub use runner::{DownloadRunner, RunnerDeps, RunnerExit};
pub use scheduler::{
    DeviceConditions, JobConstraints, JobHandler, JobOutcome, JobScheduler, NetworkState,
    NetworkType, TokioJobScheduler,
};
pub use service::{Collaborators, DownloadService};
pub use types::{
    ChapterId, Event, MangaId, Priority, QueueEntry, QueueEntryId, QueueStatus, RunnerState,
};

/// Helper function to run the service with graceful signal handling.
///
/// Waits for a termination signal and then calls the service's `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use chapter_dl::{Collaborators, Config, DownloadService, run_with_shutdown};
/// # fn collaborators() -> Collaborators { unimplemented!() }
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let service = DownloadService::new(Config::default(), collaborators()).await?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(service).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(service: DownloadService) -> Result<()> {
    wait_for_signal().await;
    service.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}

//! Test configuration helpers for creating services on throwaway directories

use chapter_dl::{Config, DownloadPreferences};
use std::path::Path;
use std::time::Duration;

/// Configuration rooted at `dir` with only on-demand downloads enabled
///
/// The periodic downloader, history poll and cleanup jobs are switched off so
/// tests control exactly when the runner activates.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = dir.join("queue.db");
    config.janitor.download_dir = dir.join("downloads");
    config.preferences = DownloadPreferences {
        only_on_unmetered: true,
        downloader_interval: Duration::ZERO,
        auto_download_from_history: false,
        clean_temp_folders: false,
    };
    config
}

/// Same as [`test_config`], with a legacy queue file to migrate on startup
pub fn test_config_with_legacy(dir: &Path) -> Config {
    let mut config = test_config(dir);
    config.persistence.legacy_queue_path = Some(dir.join("legacy-queue.json"));
    config
}

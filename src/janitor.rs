//! Temp artifact janitor
//!
//! Chapter downloads write into a `<chapter>_tmp` directory that is renamed once
//! the chapter is complete. A crash or a killed fetch leaves these directories
//! behind. The janitor walks the download root and deletes every temp directory
//! older than a minimum age, bottom-up, through the [`Filesystem`] contract.
//!
//! Failures are logged and counted but never abort the pass or fail the job.

use crate::clock::{Clock, SystemClock, duration_to_millis};
use crate::config::JanitorConfig;
use crate::error::{Error, Result};
use crate::scheduler::{JobHandler, JobOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One directory entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsEntry {
    /// File name
    pub name: String,
    /// Full path
    pub path: PathBuf,
    /// Last modification time, if the platform reports one
    pub modified: Option<DateTime<Utc>>,
    /// Whether the entry is a directory
    pub is_dir: bool,
}

/// Filesystem operations the janitor needs
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// List the direct children of a directory
    async fn list(&self, dir: &Path) -> Result<Vec<FsEntry>>;

    /// Delete a file
    async fn remove_file(&self, path: &Path) -> Result<()>;

    /// Delete an empty directory
    async fn remove_dir(&self, path: &Path) -> Result<()>;
}

/// [`Filesystem`] on the local disk
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFilesystem;

#[async_trait]
impl Filesystem for LocalFilesystem {
    async fn list(&self, dir: &Path) -> Result<Vec<FsEntry>> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut listed = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = ?entry.path(), error = %e, "failed to read metadata");
                    continue;
                }
            };
            listed.push(FsEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: entry.path(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                is_dir: metadata.is_dir(),
            });
        }

        Ok(listed)
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        tokio::fs::remove_file(path).await?;
        Ok(())
    }

    async fn remove_dir(&self, path: &Path) -> Result<()> {
        tokio::fs::remove_dir(path).await?;
        Ok(())
    }
}

/// Counters from one janitor pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JanitorReport {
    /// Directories listed
    pub scanned_dirs: usize,
    /// Directories removed (temp directories and their subdirectories)
    pub deleted_dirs: usize,
    /// Files removed
    pub deleted_files: usize,
    /// Operations that failed
    pub failures: usize,
}

type BoxedSweep<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
type BoxedDelete<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Deletes orphaned temp directories under the download root
pub struct TempArtifactJanitor {
    fs: Arc<dyn Filesystem>,
    config: JanitorConfig,
    clock: Arc<dyn Clock>,
}

impl TempArtifactJanitor {
    /// Create a janitor on the local filesystem and system clock
    pub fn new(config: JanitorConfig) -> Self {
        Self::with_parts(Arc::new(LocalFilesystem), config, Arc::new(SystemClock))
    }

    /// Create a janitor with explicit collaborators
    pub fn with_parts(fs: Arc<dyn Filesystem>, config: JanitorConfig, clock: Arc<dyn Clock>) -> Self {
        Self { fs, config, clock }
    }

    /// Run one pass over the download root
    pub async fn sweep(&self, cancel: &CancellationToken) -> JanitorReport {
        let root = &self.config.download_dir;
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(duration_to_millis(self.config.min_age));

        info!(root = ?root, "Cleaning temp download folders");
        let mut report = JanitorReport::default();
        self.sweep_dir(root, cutoff, cancel, &mut report, true).await;

        info!(
            scanned_dirs = report.scanned_dirs,
            deleted_dirs = report.deleted_dirs,
            deleted_files = report.deleted_files,
            failures = report.failures,
            "Temp folder cleanup complete"
        );
        report
    }

    fn is_temp_dir(&self, entry: &FsEntry) -> bool {
        entry.is_dir && entry.name.ends_with(&self.config.temp_suffix)
    }

    fn sweep_dir<'a>(
        &'a self,
        dir: &'a Path,
        cutoff: i64,
        cancel: &'a CancellationToken,
        report: &'a mut JanitorReport,
        is_root: bool,
    ) -> BoxedSweep<'a> {
        Box::pin(async move {
            let entries = match self.fs.list(dir).await {
                Ok(entries) => entries,
                Err(Error::Io(e)) if is_root && e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(?dir, "download root does not exist, nothing to clean");
                    return;
                }
                Err(e) => {
                    warn!(?dir, error = %e, "failed to list directory during cleanup");
                    report.failures += 1;
                    return;
                }
            };
            report.scanned_dirs += 1;

            for entry in entries {
                if cancel.is_cancelled() {
                    debug!("temp folder cleanup cancelled");
                    return;
                }
                if !entry.is_dir {
                    continue;
                }

                if !self.is_temp_dir(&entry) {
                    self.sweep_dir(&entry.path, cutoff, cancel, report, false)
                        .await;
                    continue;
                }

                match entry.modified {
                    Some(modified) if modified.timestamp_millis() < cutoff => {
                        debug!(path = ?entry.path, "deleting stale temp folder");
                        self.delete_tree(&entry.path, report).await;
                    }
                    Some(_) => debug!(path = ?entry.path, "temp folder too recent, keeping"),
                    None => debug!(path = ?entry.path, "temp folder age unknown, keeping"),
                }
            }
        })
    }

    /// Delete a directory and its contents bottom-up; `true` if it is gone
    fn delete_tree<'a>(&'a self, dir: &'a Path, report: &'a mut JanitorReport) -> BoxedDelete<'a> {
        Box::pin(async move {
            let entries = match self.fs.list(dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(?dir, error = %e, "failed to list temp folder");
                    report.failures += 1;
                    return false;
                }
            };

            let mut emptied = true;
            for entry in entries {
                if entry.is_dir {
                    emptied &= self.delete_tree(&entry.path, report).await;
                } else {
                    match self.fs.remove_file(&entry.path).await {
                        Ok(()) => report.deleted_files += 1,
                        Err(e) => {
                            warn!(path = ?entry.path, error = %e, "failed to delete file");
                            report.failures += 1;
                            emptied = false;
                        }
                    }
                }
            }

            if !emptied {
                return false;
            }
            match self.fs.remove_dir(dir).await {
                Ok(()) => {
                    report.deleted_dirs += 1;
                    true
                }
                Err(e) => {
                    warn!(?dir, error = %e, "failed to delete folder");
                    report.failures += 1;
                    false
                }
            }
        })
    }
}

#[async_trait]
impl JobHandler for TempArtifactJanitor {
    async fn run(&self, cancel: CancellationToken) -> JobOutcome {
        self.sweep(&cancel).await;
        JobOutcome::Success
    }
}

//! One-time migration of the legacy key/value download queue.
//!
//! Older releases kept queued chapters in a flat key/value store, one JSON
//! value per chapter (`{"mangaId":..,"chapterId":..,"order":..}`). The
//! [`LegacyMigrator`] moves them into the SQLite queue exactly once:
//!
//! 1. Skip if the store's "migration complete" flag is set.
//! 2. Insert every legacy entry, in `order`, at normal priority.
//! 3. If any insert failed, stop. The flag stays unset and the legacy entries
//!    stay in place, so the next start retries the whole migration.
//! 4. Otherwise set the flag, then delete the legacy entries.
//!
//! Setting the flag before deleting means a crash between the two steps leaves
//! stale legacy entries behind but never loses or re-imports work.

use crate::error::{Error, Result};
use crate::library::{self, LibraryLookup, WorkItem};
use crate::queue::QueueRepository;
use crate::types::{ChapterId, MangaId, Priority};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Access to the legacy key/value queue representation
#[async_trait]
pub trait LegacyQueueStore: Send + Sync {
    /// All stored entries as `(key, raw JSON value)` pairs
    async fn entries(&self) -> Result<Vec<(String, String)>>;

    /// Whether a previous migration finished
    async fn is_migration_complete(&self) -> Result<bool>;

    /// Persist the "migration complete" flag
    async fn set_migration_complete(&self) -> Result<()>;

    /// Delete every legacy entry
    async fn clear_entries(&self) -> Result<()>;
}

/// One entry in the legacy format
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyEntry {
    /// Manga the chapter belongs to
    pub manga_id: MangaId,
    /// Chapter to download
    pub chapter_id: ChapterId,
    /// Position in the legacy queue
    pub order: i64,
}

/// Outcome of [`LegacyMigrator::migrate`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Legacy values that parsed
    pub legacy_entries: usize,
    /// Legacy values that could not be parsed and were dropped
    pub malformed: usize,
    /// Entries that failed to insert
    pub failed: usize,
    /// Whether the migration is complete after this call
    pub complete: bool,
    /// Pending queue entries resolved into fetchable work
    pub work_items: Vec<WorkItem>,
}

/// Migrates the legacy queue and restores pending work
pub struct LegacyMigrator {
    store: Arc<dyn LegacyQueueStore>,
    repo: Arc<QueueRepository>,
    library: Arc<dyn LibraryLookup>,
}

impl LegacyMigrator {
    /// Create a migrator
    pub fn new(
        store: Arc<dyn LegacyQueueStore>,
        repo: Arc<QueueRepository>,
        library: Arc<dyn LibraryLookup>,
    ) -> Self {
        Self {
            store,
            repo,
            library,
        }
    }

    /// Run the migration if needed and return the pending work
    ///
    /// When any legacy insert fails the migration is left incomplete and the
    /// returned report has no work items.
    pub async fn migrate(&self) -> Result<MigrationReport> {
        let mut report = MigrationReport::default();

        if self.store.is_migration_complete().await? {
            tracing::debug!("Legacy queue already migrated");
        } else {
            self.import(&mut report).await?;
            if report.failed > 0 {
                tracing::warn!(
                    failed = report.failed,
                    total = report.legacy_entries,
                    "Legacy queue migration incomplete, will retry on next start"
                );
                return Ok(report);
            }

            self.store.set_migration_complete().await?;
            self.store.clear_entries().await?;
            tracing::info!(
                migrated = report.legacy_entries,
                malformed = report.malformed,
                "Legacy queue migrated"
            );
        }

        report.complete = true;
        report.work_items = restore_pending(&self.repo, self.library.as_ref()).await?;
        Ok(report)
    }

    async fn import(&self, report: &mut MigrationReport) -> Result<()> {
        let raw = self.store.entries().await?;

        let mut entries = Vec::with_capacity(raw.len());
        for (key, value) in raw {
            match serde_json::from_str::<LegacyEntry>(&value) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping malformed legacy queue entry");
                    report.malformed += 1;
                }
            }
        }
        entries.sort_by_key(|e| e.order);
        report.legacy_entries = entries.len();

        for entry in entries {
            match self
                .repo
                .add(entry.manga_id, entry.chapter_id, Priority::Normal)
                .await
            {
                // Already queued counts as migrated
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(
                        chapter_id = entry.chapter_id,
                        error = %e,
                        "Failed to migrate legacy queue entry"
                    );
                    report.failed += 1;
                }
            }
        }

        Ok(())
    }
}

/// Resolve every pending entry into work, skipping those whose manga or chapter is gone
///
/// Entries come back in processing order.
pub async fn restore_pending(
    repo: &QueueRepository,
    library: &dyn LibraryLookup,
) -> Result<Vec<WorkItem>> {
    let pending = repo.get_pending_by_priority().await?;
    let mut items = Vec::with_capacity(pending.len());

    for entry in &pending {
        match library::resolve(library, entry).await? {
            Some(item) => items.push(item),
            None => tracing::debug!(
                chapter_id = entry.chapter_id,
                "Skipping queued chapter missing from library"
            ),
        }
    }

    Ok(items)
}

/// On-disk layout of [`JsonFileLegacyStore`]
#[derive(Debug, Default, Serialize, Deserialize)]
struct LegacyFile {
    #[serde(default)]
    migration_complete: bool,
    #[serde(default)]
    entries: BTreeMap<String, String>,
}

/// Legacy store kept in a single JSON file
///
/// A missing file reads as an empty, unmigrated store. Writes go to a sibling
/// temp file that is renamed over the original.
pub struct JsonFileLegacyStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileLegacyStore {
    /// Open a store at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add or replace a raw entry
    pub async fn insert_raw(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        file.entries.insert(key.into(), value.into());
        self.write(&file).await
    }

    /// Add an entry in the legacy format, keyed by chapter id
    pub async fn insert(&self, entry: &LegacyEntry) -> Result<()> {
        let value = serde_json::to_string(entry)?;
        self.insert_raw(entry.chapter_id.to_string(), value).await
    }

    async fn read(&self) -> Result<LegacyFile> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::LegacyStore(format!(
                    "Failed to parse {}: {}",
                    self.path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LegacyFile::default()),
            Err(e) => Err(Error::LegacyStore(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn write(&self, file: &LegacyFile) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(file)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &bytes).await.map_err(|e| {
            Error::LegacyStore(format!("Failed to write {}: {}", tmp.display(), e))
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            Error::LegacyStore(format!(
                "Failed to replace {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(())
    }
}

#[async_trait]
impl LegacyQueueStore for JsonFileLegacyStore {
    async fn entries(&self) -> Result<Vec<(String, String)>> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.entries.into_iter().collect())
    }

    async fn is_migration_complete(&self) -> Result<bool> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.migration_complete)
    }

    async fn set_migration_complete(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        file.migration_complete = true;
        self.write(&file).await
    }

    async fn clear_entries(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        if file.entries.is_empty() {
            return Ok(());
        }
        file.entries.clear();
        self.write(&file).await
    }
}

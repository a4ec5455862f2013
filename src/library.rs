//! Library lookup contract and fetch-ready work descriptors.

use crate::error::Result;
use crate::types::{ChapterId, MangaId, QueueEntry, QueueEntryId};
use serde::{Deserialize, Serialize};

/// Manga identity as known to the host library
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manga {
    /// Library id
    pub id: MangaId,
    /// Content source the manga comes from
    pub source_id: i64,
    /// Display title
    pub title: String,
}

/// Chapter identity as known to the host library
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    /// Library id
    pub id: ChapterId,
    /// Owning manga
    pub manga_id: MangaId,
    /// Display name
    pub name: String,
    /// Source-relative URL
    pub url: String,
}

/// Everything a fetcher needs to download one chapter
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Queue entry this work item came from
    pub entry_id: QueueEntryId,
    /// Content source
    pub source_id: i64,
    /// Manga
    pub manga: Manga,
    /// Chapter
    pub chapter: Chapter,
}

/// Resolves manga and chapter identity from the host library
#[async_trait::async_trait]
pub trait LibraryLookup: Send + Sync {
    /// Look up a manga; `None` if it was removed from the library
    async fn manga(&self, id: MangaId) -> Result<Option<Manga>>;

    /// Look up a chapter; `None` if it no longer exists
    async fn chapter(&self, id: ChapterId) -> Result<Option<Chapter>>;
}

/// Join a queue entry with its manga and chapter
///
/// Returns `Ok(None)` when either side no longer exists.
pub async fn resolve(library: &dyn LibraryLookup, entry: &QueueEntry) -> Result<Option<WorkItem>> {
    let Some(manga) = library.manga(entry.manga_id).await? else {
        return Ok(None);
    };
    let Some(chapter) = library.chapter(entry.chapter_id).await? else {
        return Ok(None);
    };

    Ok(Some(WorkItem {
        entry_id: entry.id,
        source_id: manga.source_id,
        manga,
        chapter,
    }))
}

/// Supplies chapters for the history-based auto-download poll
#[async_trait::async_trait]
pub trait AutoDownloadCandidates: Send + Sync {
    /// Chapters that should be downloaded because the user is following along
    async fn candidates(&self) -> Result<Vec<(MangaId, ChapterId)>>;
}

//! In-memory collaborators for driving a service end to end

use async_trait::async_trait;
use chapter_dl::{
    AutoDownloadCandidates, Chapter, ChapterId, Collaborators, FetchError, FetchErrorKind,
    Fetcher, LibraryLookup, Manga, MangaId, Result, WorkItem,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Manga every test chapter belongs to
pub const MANGA_ID: MangaId = 1;

/// Library where every chapter exists unless removed
#[derive(Default)]
pub struct TestLibrary {
    removed: Mutex<HashSet<ChapterId>>,
}

impl TestLibrary {
    /// Make `chapter_id` disappear from the library
    pub fn remove_chapter(&self, chapter_id: ChapterId) {
        self.removed.lock().unwrap().insert(chapter_id);
    }
}

#[async_trait]
impl LibraryLookup for TestLibrary {
    async fn manga(&self, id: MangaId) -> Result<Option<Manga>> {
        Ok(Some(Manga {
            id,
            source_id: 100,
            title: format!("Manga {id}"),
        }))
    }

    async fn chapter(&self, id: ChapterId) -> Result<Option<Chapter>> {
        if self.removed.lock().unwrap().contains(&id) {
            return Ok(None);
        }
        Ok(Some(Chapter {
            id,
            manga_id: MANGA_ID,
            name: format!("Chapter {id}"),
            url: format!("/chapter/{id}"),
        }))
    }
}

/// Fetcher that records every call
///
/// Chapters can be told to fail, or to block until the activation is cancelled.
#[derive(Default)]
pub struct TestFetcher {
    fetched: Mutex<Vec<ChapterId>>,
    failures: Mutex<HashMap<ChapterId, FetchErrorKind>>,
    blocking: Mutex<HashSet<ChapterId>>,
    started: Notify,
}

impl TestFetcher {
    /// Chapters fetched so far, in call order
    pub fn fetched(&self) -> Vec<ChapterId> {
        self.fetched.lock().unwrap().clone()
    }

    /// Fail every fetch of `chapter_id` with `kind`
    pub fn fail(&self, chapter_id: ChapterId, kind: FetchErrorKind) {
        self.failures.lock().unwrap().insert(chapter_id, kind);
    }

    /// Hold the fetch of `chapter_id` until its token is cancelled
    pub fn block(&self, chapter_id: ChapterId) {
        self.blocking.lock().unwrap().insert(chapter_id);
    }

    /// Wait until a fetch call has started
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }
}

#[async_trait]
impl Fetcher for TestFetcher {
    async fn fetch(
        &self,
        item: &WorkItem,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), FetchError> {
        let chapter_id = item.chapter.id;
        self.fetched.lock().unwrap().push(chapter_id);
        self.started.notify_one();

        let blocks = self.blocking.lock().unwrap().contains(&chapter_id);
        if blocks {
            cancel.cancelled().await;
            return Err(FetchError::new(FetchErrorKind::Network, "interrupted"));
        }

        match self.failures.lock().unwrap().get(&chapter_id) {
            Some(kind) => Err(FetchError::new(*kind, format!("chapter {chapter_id} failed"))),
            None => Ok(()),
        }
    }
}

/// Candidate list that can be swapped between polls
#[derive(Default)]
pub struct TestCandidates {
    chapters: Mutex<Vec<(MangaId, ChapterId)>>,
}

impl TestCandidates {
    /// Replace the candidates returned by the next poll
    pub fn set(&self, chapters: &[ChapterId]) {
        *self.chapters.lock().unwrap() = chapters.iter().map(|&c| (MANGA_ID, c)).collect();
    }
}

#[async_trait]
impl AutoDownloadCandidates for TestCandidates {
    async fn candidates(&self) -> Result<Vec<(MangaId, ChapterId)>> {
        Ok(self.chapters.lock().unwrap().clone())
    }
}

/// Handles on the collaborators given to a service
#[derive(Clone, Default)]
pub struct TestCollaborators {
    pub library: Arc<TestLibrary>,
    pub fetcher: Arc<TestFetcher>,
    pub candidates: Arc<TestCandidates>,
}

impl TestCollaborators {
    /// Trait-object bundle for [`chapter_dl::DownloadService::new`]
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            library: self.library.clone(),
            fetcher: self.fetcher.clone(),
            candidates: self.candidates.clone(),
        }
    }
}

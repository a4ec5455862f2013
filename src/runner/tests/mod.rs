use super::*;
use crate::clock::ManualClock;
use crate::db::Database;
use crate::error::Error;
use crate::fetcher::{FetchError, FetchErrorKind};
use crate::library::{Chapter, Manga, WorkItem};
use crate::retry::RetryPolicy;
use crate::scheduler::NetworkState;
use crate::types::{ChapterId, MangaId, Priority};
use std::collections::{HashMap, HashSet};
use tempfile::NamedTempFile;

mod activation;

pub(super) const T0: i64 = 1_700_000_000_000;

pub(super) struct FakeLibrary {
    pub missing_chapters: HashSet<ChapterId>,
    pub broken_chapters: HashSet<ChapterId>,
}

#[async_trait]
impl LibraryLookup for FakeLibrary {
    async fn manga(&self, id: MangaId) -> Result<Option<Manga>> {
        Ok(Some(Manga {
            id,
            source_id: 7,
            title: format!("Manga {id}"),
        }))
    }

    async fn chapter(&self, id: ChapterId) -> Result<Option<Chapter>> {
        if self.broken_chapters.contains(&id) {
            return Err(Error::LegacyStore(format!("chapter {id} unreadable")));
        }
        if self.missing_chapters.contains(&id) {
            return Ok(None);
        }
        Ok(Some(Chapter {
            id,
            manga_id: 1,
            name: format!("Chapter {id}"),
            url: format!("/c/{id}"),
        }))
    }
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// Fetcher that records calls, fails chapters on request, and can run a hook
/// on one chapter and then wait for cancellation
#[derive(Default)]
pub(super) struct FakeFetcher {
    pub fetched: std::sync::Mutex<Vec<ChapterId>>,
    pub failures: std::sync::Mutex<HashMap<ChapterId, FetchError>>,
    pub hook: std::sync::Mutex<Option<(ChapterId, Hook)>>,
}

impl FakeFetcher {
    pub fn fail(&self, chapter_id: ChapterId, kind: FetchErrorKind, message: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(chapter_id, FetchError::new(kind, message));
    }

    pub fn on_fetch(&self, chapter_id: ChapterId, hook: impl Fn() + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some((chapter_id, Box::new(hook)));
    }

    pub fn fetched(&self) -> Vec<ChapterId> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(
        &self,
        item: &WorkItem,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), FetchError> {
        let chapter_id = item.chapter.id;
        self.fetched.lock().unwrap().push(chapter_id);

        let hooked = {
            let hook = self.hook.lock().unwrap();
            match hook.as_ref() {
                Some((id, hook)) if *id == chapter_id => {
                    hook();
                    true
                }
                _ => false,
            }
        };
        if hooked {
            // Honour the cancellation the hook triggers
            tokio::time::timeout(Duration::from_secs(5), cancel.cancelled())
                .await
                .expect("hook should cancel the activation");
        }

        match self.failures.lock().unwrap().get(&chapter_id) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

pub(super) struct Fixture {
    pub db: Arc<Database>,
    pub repo: Arc<QueueRepository>,
    pub clock: Arc<ManualClock>,
    pub fetcher: Arc<FakeFetcher>,
    pub runner: Arc<DownloadRunner>,
    pub conditions_tx: Arc<watch::Sender<DeviceConditions>>,
    pub preferences_tx: Arc<watch::Sender<DownloadPreferences>>,
    _temp: NamedTempFile,
}

pub(super) struct FixtureOptions {
    pub conditions: DeviceConditions,
    pub only_on_unmetered: bool,
    pub policy: RetryPolicy,
    pub stuck_threshold: Duration,
    pub missing_chapters: Vec<ChapterId>,
    pub broken_chapters: Vec<ChapterId>,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            conditions: DeviceConditions::default(),
            only_on_unmetered: true,
            policy: RetryPolicy::new(3, Duration::from_secs(60), Duration::from_secs(3600)),
            stuck_threshold: Duration::from_secs(2 * 3600),
            missing_chapters: Vec::new(),
            broken_chapters: Vec::new(),
        }
    }
}

pub(super) async fn fixture() -> Fixture {
    fixture_with(FixtureOptions::default()).await
}

pub(super) async fn fixture_with(options: FixtureOptions) -> Fixture {
    let temp = NamedTempFile::new().unwrap();
    let db = Arc::new(Database::new(temp.path()).await.unwrap());
    let clock = Arc::new(ManualClock::new(T0));
    let repo = Arc::new(
        QueueRepository::with_clock(db.clone(), options.policy, clock.clone())
            .await
            .unwrap(),
    );

    let (conditions_tx, conditions) = watch::channel(options.conditions);
    let (preferences_tx, preferences) = watch::channel(DownloadPreferences {
        only_on_unmetered: options.only_on_unmetered,
        ..Default::default()
    });

    let fetcher = Arc::new(FakeFetcher::default());
    let runner = Arc::new(DownloadRunner::new(RunnerDeps {
        repo: repo.clone(),
        library: Arc::new(FakeLibrary {
            missing_chapters: options.missing_chapters.into_iter().collect(),
            broken_chapters: options.broken_chapters.into_iter().collect(),
        }),
        fetcher: fetcher.clone(),
        conditions,
        preferences,
        stuck_threshold: options.stuck_threshold,
    }));

    Fixture {
        db,
        repo,
        clock,
        fetcher,
        runner,
        conditions_tx: Arc::new(conditions_tx),
        preferences_tx: Arc::new(preferences_tx),
        _temp: temp,
    }
}

pub(super) fn metered() -> DeviceConditions {
    DeviceConditions {
        network: NetworkState {
            connected: true,
            metered: true,
        },
        ..Default::default()
    }
}

pub(super) async fn enqueue(f: &Fixture, chapters: &[ChapterId], priority: Priority) {
    let entries: Vec<_> = chapters.iter().map(|&c| (1, c)).collect();
    f.repo.add_all(&entries, priority).await.unwrap();
}

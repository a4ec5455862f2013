use super::*;
use crate::clock::ManualClock;
use tempfile::NamedTempFile;

mod maintenance;

/// Start of the manual clock used by repository tests
pub(super) const T0: i64 = 1_700_000_000_000;

pub(super) struct Fixture {
    pub repo: Arc<QueueRepository>,
    pub clock: Arc<ManualClock>,
    _temp: NamedTempFile,
}

/// Repository on a fresh database: 3 retries, 10s base, 60s cap
pub(super) async fn fixture() -> Fixture {
    fixture_with_policy(RetryPolicy::new(
        3,
        Duration::from_secs(10),
        Duration::from_secs(60),
    ))
    .await
}

pub(super) async fn fixture_with_policy(policy: RetryPolicy) -> Fixture {
    let temp = NamedTempFile::new().unwrap();
    let db = Arc::new(Database::new(temp.path()).await.unwrap());
    let clock = Arc::new(ManualClock::new(T0));
    let repo = QueueRepository::with_clock(db, policy, clock.clone())
        .await
        .unwrap();
    Fixture {
        repo: Arc::new(repo),
        clock,
        _temp: temp,
    }
}

pub(super) fn chapter_ids(entries: &[QueueEntry]) -> Vec<ChapterId> {
    entries.iter().map(|e| e.chapter_id).collect()
}

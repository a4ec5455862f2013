//! Waiting helpers for integration tests

use chapter_dl::{ChapterId, Event, QueueRepository, QueueStatus};
use std::time::Duration;
use tokio::sync::broadcast;

/// Default timeout for anything the tests wait on
pub const WAIT: Duration = Duration::from_secs(10);

/// Wait for the first event matching `predicate`
///
/// Returns `None` on timeout or when the channel closes.
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<Event>,
    timeout: Duration,
    mut predicate: F,
) -> Option<Event>
where
    F: FnMut(&Event) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Collect `ChapterCompleted` ids until `count` have arrived
pub async fn collect_completed(
    events: &mut broadcast::Receiver<Event>,
    count: usize,
    timeout: Duration,
) -> Vec<ChapterId> {
    let mut completed = Vec::with_capacity(count);
    while completed.len() < count {
        let event = wait_for_event(events, timeout, |e| {
            matches!(e, Event::ChapterCompleted { .. })
        })
        .await;
        match event {
            Some(Event::ChapterCompleted { chapter_id }) => completed.push(chapter_id),
            _ => break,
        }
    }
    completed
}

/// Poll until the entry for `chapter_id` has `status`
pub async fn wait_for_status(
    repo: &QueueRepository,
    chapter_id: ChapterId,
    status: QueueStatus,
    timeout: Duration,
) -> bool {
    tokio::time::timeout(timeout, async {
        loop {
            if let Ok(Some(entry)) = repo.get_by_chapter_id(chapter_id).await
                && entry.status == status
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

use super::*;

#[tokio::test]
async fn test_reset_failed_to_pending_restores_entries() {
    let f = fixture().await;
    f.repo
        .add_all(&[(1, 1), (1, 2), (1, 3)], Priority::Normal)
        .await
        .unwrap();
    f.repo
        .record_failure(1, "no pages", FetchErrorKind::NoPages)
        .await
        .unwrap();
    f.repo
        .record_failure(2, "disk full", FetchErrorKind::Storage)
        .await
        .unwrap();

    assert_eq!(f.repo.count_by_status(QueueStatus::Failed).await.unwrap(), 2);
    assert_eq!(
        chapter_ids(&f.repo.get_pending_by_priority().await.unwrap()),
        vec![3]
    );

    let reset = f.repo.reset_failed_to_pending().await.unwrap();
    assert_eq!(reset, 2);

    let pending = f.repo.get_pending_by_priority().await.unwrap();
    assert_eq!(chapter_ids(&pending), vec![1, 2, 3]);
    for entry in &pending {
        assert_eq!(entry.retry_count, 0);
        assert!(entry.last_attempt_at.is_none());
        assert!(entry.last_error_message.is_none());
    }
    assert_eq!(f.repo.count_by_status(QueueStatus::Failed).await.unwrap(), 0);
}

#[tokio::test]
async fn test_reset_failed_leaves_completed_alone() {
    let f = fixture().await;
    f.repo.add(1, 1, Priority::Normal).await.unwrap();
    f.repo.mark_completed(1).await.unwrap();

    assert_eq!(f.repo.reset_failed_to_pending().await.unwrap(), 0);
    assert_eq!(f.repo.count_by_status(QueueStatus::Completed).await.unwrap(), 1);
}

#[tokio::test]
async fn test_removals() {
    let f = fixture().await;
    let first = f.repo.add(1, 10, Priority::Normal).await.unwrap().unwrap();
    f.repo.add(1, 11, Priority::Normal).await.unwrap();
    f.repo.add(2, 20, Priority::Normal).await.unwrap();
    f.repo.add(3, 30, Priority::Normal).await.unwrap();

    assert!(f.repo.remove_by_id(first).await.unwrap());
    assert!(!f.repo.remove_by_id(first).await.unwrap());
    assert_eq!(f.repo.remove_by_manga_id(1).await.unwrap(), 1);
    assert!(f.repo.remove_by_chapter_id(20).await.unwrap());
    assert!(!f.repo.remove_by_chapter_id(20).await.unwrap());

    assert_eq!(chapter_ids(&f.repo.get_all().await.unwrap()), vec![30]);

    // Removed chapters can be queued again
    assert!(f.repo.add(1, 10, Priority::Normal).await.unwrap().is_some());
}

#[tokio::test]
async fn test_clear_completed_and_clear_all() {
    let f = fixture().await;
    f.repo
        .add_all(&[(1, 1), (1, 2), (1, 3)], Priority::Normal)
        .await
        .unwrap();
    f.repo.mark_completed(1).await.unwrap();
    f.repo.mark_completed(2).await.unwrap();

    assert_eq!(f.repo.clear_completed().await.unwrap(), 2);
    assert_eq!(chapter_ids(&f.repo.get_all().await.unwrap()), vec![3]);

    assert_eq!(f.repo.clear_all().await.unwrap(), 1);
    assert!(f.repo.get_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_count_by_status() {
    let f = fixture().await;
    f.repo
        .add_all(&[(1, 1), (1, 2), (1, 3), (1, 4)], Priority::Normal)
        .await
        .unwrap();
    f.repo.mark_completed(1).await.unwrap();
    f.repo
        .record_failure(2, "x", FetchErrorKind::NoPages)
        .await
        .unwrap();

    assert_eq!(f.repo.count_by_status(QueueStatus::Pending).await.unwrap(), 2);
    assert_eq!(f.repo.count_by_status(QueueStatus::Failed).await.unwrap(), 1);
    assert_eq!(f.repo.count_by_status(QueueStatus::Completed).await.unwrap(), 1);
}

#[tokio::test]
async fn test_reset_stuck_downloads_requeues_old_attempts() {
    let f = fixture().await;
    let stuck = f.repo.add(1, 1, Priority::Normal).await.unwrap().unwrap();
    let recent = f.repo.add(1, 2, Priority::Normal).await.unwrap().unwrap();
    f.repo.add(1, 3, Priority::Normal).await.unwrap();

    // Chapter 1 attempted at T0, chapter 2 one hour later
    f.repo
        .update_status(stuck, QueueStatus::Pending, Some(f.repo.now()), None)
        .await
        .unwrap();
    f.clock.advance(Duration::from_secs(3600));
    f.repo
        .update_status(recent, QueueStatus::Pending, Some(f.repo.now()), None)
        .await
        .unwrap();
    f.clock.advance(Duration::from_secs(3600 + 1));

    let mut events = f.repo.subscribe_events();
    let reset = f
        .repo
        .reset_stuck_downloads(Duration::from_secs(2 * 3600))
        .await
        .unwrap();
    assert_eq!(reset, 1);

    let entry = f.repo.get_by_chapter_id(1).await.unwrap().unwrap();
    assert!(entry.last_attempt_at.is_none());
    assert_eq!(entry.status, QueueStatus::Pending);
    let entry = f.repo.get_by_chapter_id(2).await.unwrap().unwrap();
    assert!(entry.last_attempt_at.is_some());

    match events.try_recv().unwrap() {
        Event::StuckReset { count } => assert_eq!(count, 1),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_reset_stuck_keeps_retry_count() {
    let f = fixture().await;
    f.repo.add(1, 1, Priority::Normal).await.unwrap();
    f.repo
        .record_failure(1, "e", FetchErrorKind::Network)
        .await
        .unwrap();

    f.clock.advance(Duration::from_secs(3 * 3600));
    let reset = f
        .repo
        .reset_stuck_downloads(Duration::from_secs(2 * 3600))
        .await
        .unwrap();
    assert_eq!(reset, 1);

    let entry = f.repo.get_by_chapter_id(1).await.unwrap().unwrap();
    assert_eq!(entry.retry_count, 1);
    assert_eq!(entry.last_error_message.as_deref(), Some("e"));
}

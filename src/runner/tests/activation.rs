use super::*;

#[tokio::test]
async fn test_drains_queue_in_priority_order() {
    let f = fixture().await;
    enqueue(&f, &[1, 2, 3], Priority::Normal).await;
    enqueue(&f, &[4], Priority::High).await;

    let mut events = f.repo.subscribe_events();
    let exit = f.runner.run(CancellationToken::new()).await;

    assert_eq!(exit, RunnerExit::QueueDrained);
    assert_eq!(exit.job_outcome(), JobOutcome::Success);
    assert_eq!(f.fetcher.fetched(), vec![4, 1, 2, 3]);
    assert_eq!(f.repo.count_by_status(QueueStatus::Completed).await.unwrap(), 4);
    assert_eq!(
        f.runner.state(),
        RunnerState::Stopped {
            reason: "queue drained".into()
        }
    );

    assert!(matches!(events.try_recv().unwrap(), Event::RunnerStarted));
    let mut completed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Event::ChapterCompleted { chapter_id } = event {
            completed.push(chapter_id);
        }
    }
    assert_eq!(completed, vec![4, 1, 2, 3]);
}

#[tokio::test]
async fn test_empty_queue_drains_immediately() {
    let f = fixture().await;
    assert_eq!(f.runner.state(), RunnerState::Idle);

    let exit = f.runner.run(CancellationToken::new()).await;
    assert_eq!(exit, RunnerExit::QueueDrained);
    assert!(f.fetcher.fetched().is_empty());
}

#[tokio::test]
async fn test_metered_network_blocks_start_when_unmetered_required() {
    let f = fixture_with(FixtureOptions {
        conditions: metered(),
        ..Default::default()
    })
    .await;
    enqueue(&f, &[1], Priority::Normal).await;

    let exit = f.runner.run(CancellationToken::new()).await;

    assert!(matches!(exit, RunnerExit::ConstraintViolated(_)));
    assert_eq!(exit.job_outcome(), JobOutcome::Retry);
    assert!(f.fetcher.fetched().is_empty());
    assert!(matches!(f.runner.state(), RunnerState::Stopped { .. }));
}

#[tokio::test]
async fn test_metered_network_allowed_without_preference() {
    let f = fixture_with(FixtureOptions {
        conditions: metered(),
        only_on_unmetered: false,
        ..Default::default()
    })
    .await;
    enqueue(&f, &[1], Priority::Normal).await;

    let exit = f.runner.run(CancellationToken::new()).await;
    assert_eq!(exit, RunnerExit::QueueDrained);
    assert_eq!(f.fetcher.fetched(), vec![1]);
}

#[tokio::test]
async fn test_network_change_stops_after_in_flight_entry() {
    let f = fixture().await;
    enqueue(&f, &[1, 2, 3], Priority::Normal).await;

    let conditions_tx = f.conditions_tx.clone();
    f.fetcher.on_fetch(1, move || {
        conditions_tx.send_replace(metered());
    });

    let exit = f.runner.run(CancellationToken::new()).await;

    match &exit {
        RunnerExit::ConstraintViolated(reason) => assert!(reason.contains("metered")),
        other => panic!("unexpected exit {other:?}"),
    }
    assert_eq!(f.fetcher.fetched(), vec![1]);
    // The in-flight chapter still finished
    let entry = f.repo.get_by_chapter_id(1).await.unwrap().unwrap();
    assert_eq!(entry.status, QueueStatus::Completed);
    assert_eq!(f.repo.count_by_status(QueueStatus::Pending).await.unwrap(), 2);
}

#[tokio::test]
async fn test_preference_change_stops_runner() {
    let f = fixture_with(FixtureOptions {
        conditions: metered(),
        only_on_unmetered: false,
        ..Default::default()
    })
    .await;
    enqueue(&f, &[1, 2], Priority::Normal).await;

    let preferences_tx = f.preferences_tx.clone();
    f.fetcher.on_fetch(1, move || {
        preferences_tx.send_modify(|p| p.only_on_unmetered = true);
    });

    let exit = f.runner.run(CancellationToken::new()).await;
    assert!(matches!(exit, RunnerExit::ConstraintViolated(_)));
    assert_eq!(f.fetcher.fetched(), vec![1]);
}

#[tokio::test]
async fn test_cancel_stops_between_entries() {
    let f = fixture().await;
    enqueue(&f, &[1, 2, 3], Priority::Normal).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    f.fetcher.on_fetch(2, move || trigger.cancel());

    let exit = f.runner.run(cancel).await;

    assert_eq!(exit, RunnerExit::Cancelled);
    assert_eq!(exit.job_outcome(), JobOutcome::Success);
    assert_eq!(f.fetcher.fetched(), vec![1, 2]);
    assert_eq!(f.repo.count_by_status(QueueStatus::Pending).await.unwrap(), 1);
}

#[tokio::test]
async fn test_stop_cancels_current_activation() {
    let f = fixture().await;
    enqueue(&f, &[1, 2], Priority::Normal).await;

    // Signal when the first fetch starts; it then waits for cancellation
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let tx = std::sync::Mutex::new(Some(tx));
    f.fetcher.on_fetch(1, move || {
        if let Some(tx) = tx.lock().unwrap().take() {
            tx.send(()).ok();
        }
    });

    let runner = f.runner.clone();
    let handle = tokio::spawn(async move { runner.run(CancellationToken::new()).await });

    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("first fetch should start")
        .unwrap();
    assert!(f.runner.is_active());
    f.runner.stop().await;

    let exit = handle.await.unwrap();
    assert_eq!(exit, RunnerExit::Cancelled);
    assert_eq!(f.fetcher.fetched(), vec![1]);
}

#[tokio::test]
async fn test_second_activation_is_rejected_while_active() {
    let f = fixture().await;
    enqueue(&f, &[1], Priority::Normal).await;

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let tx = std::sync::Mutex::new(Some(tx));
    f.fetcher.on_fetch(1, move || {
        if let Some(tx) = tx.lock().unwrap().take() {
            tx.send(()).ok();
        }
    });

    let runner = f.runner.clone();
    let first = tokio::spawn(async move { runner.run(CancellationToken::new()).await });
    rx.await.unwrap();

    let second = f.runner.run(CancellationToken::new()).await;
    assert_eq!(second, RunnerExit::AlreadyRunning);

    f.runner.stop().await;
    assert_eq!(first.await.unwrap(), RunnerExit::Cancelled);
}

#[tokio::test]
async fn test_stale_entries_requeued_at_start() {
    let f = fixture_with(FixtureOptions {
        policy: RetryPolicy::new(5, Duration::from_secs(3600), Duration::from_secs(3600)),
        stuck_threshold: Duration::from_secs(300),
        ..Default::default()
    })
    .await;
    enqueue(&f, &[1], Priority::Normal).await;
    f.repo
        .record_failure(1, "interrupted", FetchErrorKind::Network)
        .await
        .unwrap();

    // Still inside the one-hour backoff, but past the stuck threshold
    f.clock.advance(Duration::from_secs(600));
    assert!(f.repo.get_pending_with_backoff().await.unwrap().is_empty());

    let exit = f.runner.run(CancellationToken::new()).await;
    assert_eq!(exit, RunnerExit::QueueDrained);
    assert_eq!(f.fetcher.fetched(), vec![1]);
}

#[test]
fn test_store_error_outcome_follows_retryability() {
    let busy = RunnerExit::StoreError {
        message: "database is locked".into(),
        retryable: true,
    };
    assert_eq!(busy.job_outcome(), JobOutcome::Retry);
    assert_eq!(busy.reason(), "queue store error: database is locked");

    let broken = RunnerExit::StoreError {
        message: "no such table: download_queue".into(),
        retryable: false,
    };
    assert_eq!(broken.job_outcome(), JobOutcome::Failure);
}

#[tokio::test]
async fn test_closed_store_ends_activation_as_failure() {
    let f = fixture().await;
    enqueue(&f, &[1], Priority::Normal).await;
    f.db.close().await;

    let exit = f.runner.run(CancellationToken::new()).await;
    assert!(matches!(exit, RunnerExit::StoreError { retryable: false, .. }));
    assert_eq!(exit.job_outcome(), JobOutcome::Failure);
    assert!(f.fetcher.fetched().is_empty());
}

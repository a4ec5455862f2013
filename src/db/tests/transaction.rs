use crate::db::*;
use crate::error::Error;
use tempfile::NamedTempFile;

#[tokio::test]
async fn test_finish_commits_on_ok() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let mut tx = db.begin_write().await.unwrap();
    let outcome = queue::insert_pending(tx.conn(), 1, 1, 0, 0).await;
    tx.finish(outcome).await.unwrap();

    assert!(queue::find_by_chapter_id(db.pool(), 1).await.unwrap().is_some());
    db.close().await;
}

#[tokio::test]
async fn test_finish_rolls_back_on_err() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let mut tx = db.begin_write().await.unwrap();
    let outcome = async {
        queue::insert_pending(tx.conn(), 1, 1, 0, 0).await?;
        Err::<(), _>(Error::LegacyStore("abort".into()))
    }
    .await;
    let result = tx.finish(outcome).await;
    assert!(result.is_err());

    assert!(
        queue::find_by_chapter_id(db.pool(), 1).await.unwrap().is_none(),
        "insert must be rolled back"
    );
    db.close().await;
}

#[tokio::test]
async fn test_dropped_transaction_is_discarded() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    {
        let mut tx = db.begin_write().await.unwrap();
        queue::insert_pending(tx.conn(), 1, 1, 0, 0).await.unwrap();
        // dropped without finish
    }

    // The write lock must be released and the insert gone
    let mut tx = db.begin_write().await.unwrap();
    let outcome = queue::find_by_chapter_id(tx.conn(), 1).await;
    let row = tx.finish(outcome).await.unwrap();
    assert!(row.is_none());

    db.close().await;
}

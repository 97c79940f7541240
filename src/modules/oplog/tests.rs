use bytes::Bytes;
use sqlx::sqlite::SqlitePoolOptions;
use std::time::Duration;

use super::{OperationKind, OperationLog, OperationStatus};
use crate::modules::database::Database;
use crate::shared::error::EngineError;

async fn setup_log() -> OperationLog {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    Database::create_schema(&pool).await.unwrap();
    OperationLog::new(pool)
}

fn draft_payload(content: &str) -> Bytes {
    Bytes::from(format!(r#"{{"content":"{content}"}}"#))
}

#[tokio::test]
async fn test_append_then_list_pending() {
    let log = setup_log().await;

    let record = log
        .append(
            OperationKind::CreateDraft,
            "draft",
            "d1",
            draft_payload("hello"),
        )
        .await
        .unwrap();

    assert_eq!(record.status, OperationStatus::Pending);
    assert_eq!(record.retry_count, 0);

    let pending = log.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, record.id);
    assert_eq!(pending[0].operation, OperationKind::CreateDraft);
    assert_eq!(pending[0].data, draft_payload("hello"));
}

#[tokio::test]
async fn test_list_pending_preserves_insertion_order() {
    let log = setup_log().await;

    let mut ids = Vec::new();
    for i in 0..5 {
        let record = log
            .append(
                OperationKind::UpdateDraft,
                "draft",
                &format!("d{i}"),
                draft_payload("x"),
            )
            .await
            .unwrap();
        ids.push(record.id);
    }

    let pending = log.list_pending().await.unwrap();
    let listed: Vec<String> = pending.into_iter().map(|r| r.id).collect();
    assert_eq!(listed, ids);
}

#[tokio::test]
async fn test_record_attempt_increments_retry_count() {
    let log = setup_log().await;
    let record = log
        .append(OperationKind::DeleteDraft, "draft", "d1", draft_payload(""))
        .await
        .unwrap();

    log.record_attempt(&record.id).await.unwrap();
    log.record_attempt(&record.id).await.unwrap();

    let stored = log.get(&record.id).await.unwrap().unwrap();
    assert_eq!(stored.retry_count, 2);
}

#[tokio::test]
async fn test_mark_synced_is_terminal() {
    let log = setup_log().await;
    let record = log
        .append(OperationKind::UpdateSettings, "settings", "s1", draft_payload(""))
        .await
        .unwrap();

    log.mark_synced(&record.id).await.unwrap();

    // synced の後から failed には倒せない
    let result = log.mark_failed(&record.id, "boom").await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));

    let stored = log.get(&record.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OperationStatus::Synced);
    assert!(stored.error.is_none());

    // 再度 synced を指示しても冪等
    log.mark_synced(&record.id).await.unwrap();
}

#[tokio::test]
async fn test_requeue_restores_pending_and_keeps_retry_count() {
    let log = setup_log().await;
    let record = log
        .append(OperationKind::UploadImage, "image", "i1", draft_payload(""))
        .await
        .unwrap();

    log.record_attempt(&record.id).await.unwrap();
    log.mark_failed(&record.id, "remote unreachable").await.unwrap();

    let failed = log.list_failed().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error.as_deref(), Some("remote unreachable"));

    log.requeue(&record.id).await.unwrap();

    let stored = log.get(&record.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OperationStatus::Pending);
    assert_eq!(stored.retry_count, 1);
    assert!(stored.error.is_none());
}

#[tokio::test]
async fn test_requeue_rejects_pending_record() {
    let log = setup_log().await;
    let record = log
        .append(OperationKind::CreateDraft, "draft", "d1", draft_payload(""))
        .await
        .unwrap();

    let result = log.requeue(&record.id).await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn test_remove_and_purge_retention() {
    let log = setup_log().await;
    let keep = log
        .append(OperationKind::CreateDraft, "draft", "d1", draft_payload(""))
        .await
        .unwrap();
    let gone = log
        .append(OperationKind::CreateDraft, "draft", "d2", draft_payload(""))
        .await
        .unwrap();

    log.remove(&gone.id).await.unwrap();
    assert!(log.get(&gone.id).await.unwrap().is_none());

    log.mark_synced(&keep.id).await.unwrap();
    // 保持期間ゼロなら synced は即座に掃除対象になる
    tokio::time::sleep(Duration::from_millis(10)).await;
    let purged = log.purge_synced_older_than(Duration::ZERO).await.unwrap();
    assert_eq!(purged, 1);
}

#[tokio::test]
async fn test_count_by_status() {
    let log = setup_log().await;
    let a = log
        .append(OperationKind::CreateDraft, "draft", "d1", draft_payload(""))
        .await
        .unwrap();
    log.append(OperationKind::CreateDraft, "draft", "d2", draft_payload(""))
        .await
        .unwrap();

    log.record_attempt(&a.id).await.unwrap();
    log.mark_failed(&a.id, "boom").await.unwrap();

    let (pending, failed) = log.count_by_status().await.unwrap();
    assert_eq!(pending, 1);
    assert_eq!(failed, 1);
}

use bytes::Bytes;
use chrono::Utc;
use std::time::Duration;
use uuid::Uuid;

use super::models::{OperationKind, OperationRecord, OperationRow, OperationStatus};
use crate::modules::database::DbPool;
use crate::shared::error::{EngineError, Result};

/// ミューテーション意図の追記型ログ。
///
/// `status` / `retry_count` / `error` を書き換えるのはこの型だけで、
/// 生成側（UI 層）は `append` でレコードを作る以外の変更をしない。
pub struct OperationLog {
    pool: DbPool,
}

impl OperationLog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// ミューテーション意図を耐久記録する。ネットワークには一切触れない。
    pub async fn append(
        &self,
        operation: OperationKind,
        entity_type: &str,
        entity_id: &str,
        data: Bytes,
    ) -> Result<OperationRecord> {
        let id = Uuid::new_v4().to_string();
        let timestamp = Utc::now().timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO operation_log (
                id, operation, entity_type, entity_id, data,
                status, timestamp, retry_count, error
            ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, 0, NULL)
            "#,
        )
        .bind(&id)
        .bind(operation.as_str())
        .bind(entity_type)
        .bind(entity_id)
        .bind(data.as_ref())
        .bind(timestamp)
        .execute(&self.pool)
        .await?;

        Ok(OperationRecord {
            id,
            operation,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            status: OperationStatus::Pending,
            timestamp,
            retry_count: 0,
            error: None,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<OperationRecord>> {
        let row: Option<OperationRow> =
            sqlx::query_as("SELECT * FROM operation_log WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(OperationRecord::try_from).transpose()
    }

    /// 挿入順（FIFO）の未同期レコード。後続の操作が先行の適用を
    /// 前提にしうるため、この順序はそのまま再実行順になる。
    pub async fn list_pending(&self) -> Result<Vec<OperationRecord>> {
        self.list_by_status(OperationStatus::Pending).await
    }

    pub async fn list_failed(&self) -> Result<Vec<OperationRecord>> {
        self.list_by_status(OperationStatus::Failed).await
    }

    async fn list_by_status(&self, status: OperationStatus) -> Result<Vec<OperationRecord>> {
        let rows: Vec<OperationRow> = sqlx::query_as(
            r#"
            SELECT * FROM operation_log
            WHERE status = ?1
            ORDER BY timestamp ASC, rowid ASC
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(OperationRecord::try_from).collect()
    }

    /// 再実行の試行を記録する。`retry_count` は単調増加のみ。
    pub async fn record_attempt(&self, id: &str) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE operation_log
            SET retry_count = retry_count + 1
            WHERE id = ?1 AND status != 'synced'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(EngineError::NotFound(format!(
                "no mutable operation record {id}"
            )));
        }
        Ok(())
    }

    pub async fn mark_synced(&self, id: &str) -> Result<()> {
        self.mark_synced_with_note(id, None).await
    }

    /// synced への遷移。note は remote_wins やリモート側削除など、
    /// 操作を破棄した理由を残すのに使う。
    pub async fn mark_synced_with_note(&self, id: &str, note: Option<&str>) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE operation_log
            SET status = 'synced', error = ?2
            WHERE id = ?1 AND status != 'synced'
            "#,
        )
        .bind(id)
        .bind(note)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            // 既に synced なら終端状態のため何もしない。未知の id はエラー。
            match self.get(id).await? {
                Some(_) => Ok(()),
                None => Err(EngineError::NotFound(format!("operation record {id}"))),
            }
        } else {
            Ok(())
        }
    }

    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE operation_log
            SET status = 'failed', error = ?2
            WHERE id = ?1 AND status != 'synced'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(EngineError::NotFound(format!(
                "no mutable operation record {id}"
            )));
        }
        Ok(())
    }

    /// failed → pending に戻す。`error` はクリアし `retry_count` は保つ。
    pub async fn requeue(&self, id: &str) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE operation_log
            SET status = 'pending', error = NULL
            WHERE id = ?1 AND status = 'failed'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return match self.get(id).await? {
                Some(record) => Err(EngineError::Validation(format!(
                    "cannot requeue operation {id} in status {}",
                    record.status
                ))),
                None => Err(EngineError::NotFound(format!("operation record {id}"))),
            };
        }
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM operation_log WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// 保持期間を過ぎた synced レコードを掃除する。
    pub async fn purge_synced_older_than(&self, retention: Duration) -> Result<u64> {
        let cutoff = Utc::now().timestamp_millis() - retention.as_millis() as i64;
        let removed = sqlx::query(
            "DELETE FROM operation_log WHERE status = 'synced' AND timestamp < ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(removed)
    }

    /// (pending, failed) のレコード数。
    pub async fn count_by_status(&self) -> Result<(i64, i64)> {
        let (pending,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM operation_log WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        let (failed,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM operation_log WHERE status = 'failed'")
                .fetch_one(&self.pool)
                .await?;
        Ok((pending, failed))
    }
}

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};

use crate::shared::error::EngineError;

/// 再実行対象となるミューテーションの種別。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateDraft,
    UpdateDraft,
    DeleteDraft,
    UploadImage,
    DeleteImage,
    UpdateSettings,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::CreateDraft => "create_draft",
            OperationKind::UpdateDraft => "update_draft",
            OperationKind::DeleteDraft => "delete_draft",
            OperationKind::UploadImage => "upload_image",
            OperationKind::DeleteImage => "delete_image",
            OperationKind::UpdateSettings => "update_settings",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create_draft" => Ok(OperationKind::CreateDraft),
            "update_draft" => Ok(OperationKind::UpdateDraft),
            "delete_draft" => Ok(OperationKind::DeleteDraft),
            "upload_image" => Ok(OperationKind::UploadImage),
            "delete_image" => Ok(OperationKind::DeleteImage),
            "update_settings" => Ok(OperationKind::UpdateSettings),
            _ => Err(()),
        }
    }
}

/// レコードの同期状態。`Synced` は終端で不変。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Synced,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Synced => "synced",
            OperationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "synced" => Ok(OperationStatus::Synced),
            "failed" => Ok(OperationStatus::Failed),
            _ => Err(()),
        }
    }
}

/// 耐久化されたミューテーション意図。
/// `data` は再実行に必要なペイロードで、ログ層からは不透明なバイト列。
#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub id: String,
    pub operation: OperationKind,
    pub entity_type: String,
    pub entity_id: String,
    pub data: Bytes,
    pub status: OperationStatus,
    pub timestamp: i64,
    pub retry_count: i64,
    pub error: Option<String>,
}

/// `operation_log` テーブルの行表現。
#[derive(Debug, Clone, FromRow)]
pub(crate) struct OperationRow {
    pub id: String,
    pub operation: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: Vec<u8>,
    pub status: String,
    pub timestamp: i64,
    pub retry_count: i64,
    pub error: Option<String>,
}

impl TryFrom<OperationRow> for OperationRecord {
    type Error = EngineError;

    fn try_from(row: OperationRow) -> Result<Self, Self::Error> {
        let operation = OperationKind::from_str(&row.operation)
            .map_err(|_| EngineError::Database(format!("unknown operation kind: {}", row.operation)))?;
        let status = OperationStatus::from_str(&row.status)
            .map_err(|_| EngineError::Database(format!("unknown operation status: {}", row.status)))?;

        Ok(OperationRecord {
            id: row.id,
            operation,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            data: Bytes::from(row.data),
            status,
            timestamp: row.timestamp,
            retry_count: row.retry_count,
            error: row.error,
        })
    }
}

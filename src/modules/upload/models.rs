use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use uuid::Uuid;

use crate::modules::api::FileInfo;
use crate::shared::error::Result;

/// アップロードタスクの状態。
///
/// 遷移は一方向が基本で、例外は paused → pending（再開）と
/// failed → pending（上限内の再試行）のみ。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Paused => "paused",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Cancelled => "cancelled",
        }
    }

    /// クリーンアップ対象（アクティブ集合から外してよい状態）か。
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Failed | UploadStatus::Cancelled
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// チャンク転送の進行状態。
/// `uploaded_chunks` は単調増加で `[0, total_chunks)` の部分集合。
/// 再起動後はリモート側の一覧が正本になる。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub upload_id: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub uploaded_chunks: BTreeSet<u32>,
}

impl ChunkInfo {
    pub fn is_complete(&self) -> bool {
        self.uploaded_chunks.len() as u32 == self.total_chunks
    }

    /// 確定済みチャンクが占めるバイト数。再開時の進捗復元に使う。
    pub fn uploaded_bytes(&self, file_size: u64) -> u64 {
        self.uploaded_chunks
            .iter()
            .map(|index| {
                let start = u64::from(*index) * self.chunk_size;
                let end = (start + self.chunk_size).min(file_size);
                end.saturating_sub(start)
            })
            .sum()
    }
}

/// アップロード対象。データはタスクが終わるまでメモリに保持する。
#[derive(Clone)]
pub struct UploadSource {
    pub file_name: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl UploadSource {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, data: Bytes) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            data,
        }
    }

    pub async fn from_path(path: impl AsRef<Path>, mime_type: &str) -> Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        Ok(Self {
            file_name,
            mime_type: mime_type.to_string(),
            data: Bytes::from(data),
        })
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// 1 ファイル分のアップロードタスク。Local Store には永続化しない。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    pub id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub status: UploadStatus,
    /// 0-100。チャンク転送では確定チャンク数から算出する。
    pub progress: f64,
    pub uploaded_bytes: u64,
    /// 直近計測の転送速度（bytes/s）。
    pub speed: f64,
    /// speed が 0 の間は未定義。
    pub remaining_secs: Option<f64>,
    pub chunk_info: Option<ChunkInfo>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error: Option<String>,
    pub result: Option<FileInfo>,
}

impl UploadTask {
    pub fn new(source: &UploadSource, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            file_name: source.file_name.clone(),
            file_size: source.size(),
            mime_type: source.mime_type.clone(),
            status: UploadStatus::Pending,
            progress: 0.0,
            uploaded_bytes: 0,
            speed: 0.0,
            remaining_secs: None,
            chunk_info: None,
            retry_count: 0,
            max_retries,
            error: None,
            result: None,
        }
    }

    /// 進捗系フィールドを再計算する。`session_bytes` はこの試行で
    /// 送ったバイト数（速度算出用）、`elapsed_secs` は試行開始からの経過。
    pub fn update_progress(&mut self, session_bytes: u64, elapsed_secs: f64) {
        self.progress = match &self.chunk_info {
            Some(info) if info.total_chunks > 0 => {
                info.uploaded_chunks.len() as f64 / f64::from(info.total_chunks) * 100.0
            }
            _ if self.file_size > 0 => self.uploaded_bytes as f64 / self.file_size as f64 * 100.0,
            _ => 0.0,
        };

        if elapsed_secs > 0.0 {
            self.speed = session_bytes as f64 / elapsed_secs;
        }
        self.remaining_secs = if self.speed > 0.0 {
            Some((self.file_size.saturating_sub(self.uploaded_bytes)) as f64 / self.speed)
        } else {
            None
        };
    }
}

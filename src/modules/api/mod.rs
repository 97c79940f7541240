use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::modules::oplog::models::OperationRecord;
use crate::shared::error::Result;

/// リモート API の共通レスポンス形式。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
}

/// チャンクアップロードのセッション情報。`init_upload` が返す。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub upload_id: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
}

/// アップロード完了後にリモート側が発行するファイル記述子。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub url: String,
}

/// バックエンドへの到達手段を抽象化した境界。
///
/// ミューテーション系の呼び出しは operation id 単位で冪等であることを
/// 前提とする。ネットワーク再試行で同じ呼び出しが二重に届きうるため、
/// 二重適用の安全性はリモート側の契約であってエンジンでは再実装しない。
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// リソースの取得。キャッシュのリフレッシュ経路から呼ばれる。
    async fn fetch(&self, endpoint: &str, params: &[(String, String)]) -> Result<Bytes>;

    /// キュー済みミューテーションの再実行。
    /// `force` は local_wins ポリシーによる強制適用を示す。
    async fn replay_operation(&self, record: &OperationRecord, force: bool)
        -> Result<ApiResponse>;

    /// マージポリシー用に現在のリモート状態を取得する。
    async fn fetch_entity(&self, entity_type: &str, entity_id: &str) -> Result<Option<Bytes>>;

    /// チャンク分割の閾値以下のファイルを一括アップロードする。
    async fn upload_file(&self, file_name: &str, mime_type: &str, data: Bytes) -> Result<FileInfo>;

    async fn init_upload(
        &self,
        file_name: &str,
        file_size: u64,
        mime_type: &str,
        chunk_size: u64,
    ) -> Result<UploadSession>;

    async fn upload_chunk(&self, upload_id: &str, index: u32, data: Bytes) -> Result<()>;

    /// 全チャンク到着後のマージ指示。
    async fn complete_upload(&self, upload_id: &str) -> Result<FileInfo>;

    async fn cancel_upload(&self, upload_id: &str) -> Result<()>;

    /// 再開時の突き合わせ用。リモート側が把握しているチャンク番号の一覧。
    async fn list_uploaded_chunks(&self, upload_id: &str) -> Result<Vec<u32>>;
}

use serde::{Deserialize, Serialize};

/// 同期競合の解決ポリシー。
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// 両バージョンを保持したままレコードを failed にし、ユーザーへ委ねる。
    #[default]
    Manual,
    /// ローカルの変更を強制適用する。
    LocalWins,
    /// ローカルの操作を破棄し、リモートの状態を受け入れる。
    RemoteWins,
    /// フィールド単位の置き換えマージを試み、失敗したら Manual に落とす。
    MergeReplace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub sync: SyncConfig,
    pub upload: UploadConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connection_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 呼び出し側が TTL を指定しなかった場合の既定値（秒）。
    pub default_ttl: u64,
    /// メモリ層に保持するエントリ数の上限。
    pub max_entries: usize,
    /// Local Store 側のペイロード合計サイズ上限（バイト）。
    pub max_total_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub auto_sync: bool,
    pub sync_interval: u64,
    /// 操作リプレイの再試行上限。アップロード側の上限とは独立。
    pub max_retries: u32,
    pub conflict_policy: ConflictPolicy,
    pub request_timeout: u64,
    /// synced レコードを保持する期間（秒）。経過後に掃除対象となる。
    pub synced_retention: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// マネージャ全体で同時に走らせる転送数の上限。
    pub max_concurrent: usize,
    pub chunk_size: u64,
    pub max_retries: u32,
    /// 転送系の呼び出しに使う延長タイムアウト（秒）。
    pub upload_timeout: u64,
    pub max_image_bytes: u64,
    pub max_video_bytes: u64,
    pub max_file_bytes: u64,
    pub allowed_mime_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// 強制オフラインモード。有効な間は常に offline として扱う。
    pub offline_mode: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite:data/fude.db".to_string(),
                max_connections: 5,
                connection_timeout: 30,
            },
            cache: CacheConfig {
                default_ttl: 24 * 60 * 60, // 24 hours
                max_entries: 1024,
                max_total_bytes: 100 * 1024 * 1024, // 100MB
            },
            sync: SyncConfig {
                auto_sync: true,
                sync_interval: 300, // 5 minutes
                max_retries: 3,
                conflict_policy: ConflictPolicy::default(),
                request_timeout: 30,
                synced_retention: 7 * 24 * 60 * 60, // 7 days
            },
            upload: UploadConfig {
                max_concurrent: 3,
                chunk_size: 2 * 1024 * 1024, // 2MB
                max_retries: 3,
                upload_timeout: 120,
                max_image_bytes: 10 * 1024 * 1024,
                max_video_bytes: 100 * 1024 * 1024,
                max_file_bytes: 50 * 1024 * 1024,
                allowed_mime_prefixes: vec![
                    "image/".to_string(),
                    "video/".to_string(),
                    "application/pdf".to_string(),
                ],
            },
            network: NetworkConfig {
                offline_mode: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = EngineConfig::default();
        assert_eq!(config.cache.default_ttl, 86400);
        assert_eq!(config.upload.max_concurrent, 3);
        assert_eq!(config.upload.chunk_size, 2 * 1024 * 1024);
        assert_eq!(config.sync.conflict_policy, ConflictPolicy::Manual);
    }

    #[test]
    fn test_conflict_policy_serde_roundtrip() {
        let json = serde_json::to_string(&ConflictPolicy::LocalWins).unwrap();
        assert_eq!(json, r#""local_wins""#);
        let back: ConflictPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ConflictPolicy::LocalWins);
    }
}

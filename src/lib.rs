//! オフラインファーストの同期・アップロードエンジン。
//!
//! サーバ応答の TTL キャッシュ、切断中ミューテーションの耐久記録と
//! 再実行、チャンク分割アップロードを一つのハンドル
//! ([`EngineState`]) の下で提供する。リモートへの到達手段は
//! [`RemoteApi`] トレイトとして外部から注入する。

pub mod modules;
pub mod shared;
mod state;

pub use modules::api::{ApiResponse, FileInfo, RemoteApi, UploadSession};
pub use modules::cache::{fingerprint, CachedPayload, FetchOptions, TtlCache};
pub use modules::network::{ConnectionQuality, NetworkMonitor};
pub use modules::oplog::{OperationKind, OperationLog, OperationRecord, OperationStatus};
pub use modules::sync::{SyncOrchestrator, SyncReport};
pub use modules::upload::{UploadManager, UploadSource, UploadStatus, UploadTask};
pub use shared::config::{ConflictPolicy, EngineConfig};
pub use shared::error::{EngineError, Result};
pub use shared::events::{EngineEvent, EventBus};
pub use state::{EngineState, OfflineStatus, StorageUsage};

/// ログ設定の初期化。組み込み先アプリが subscriber を持たない場合用。
pub fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fude_offline=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

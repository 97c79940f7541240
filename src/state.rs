use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::modules::api::RemoteApi;
use crate::modules::cache::{fingerprint, CachedPayload, FetchOptions, TtlCache};
use crate::modules::database::{Database, DbPool};
use crate::modules::network::NetworkMonitor;
use crate::modules::oplog::{OperationKind, OperationLog, OperationRecord};
use crate::modules::sync::SyncOrchestrator;
use crate::modules::upload::UploadManager;
use crate::shared::config::EngineConfig;
use crate::shared::error::Result;
use crate::shared::events::{EngineEvent, EventBus};

#[derive(Debug, Clone, Serialize)]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub quota_bytes: u64,
    pub percentage: f64,
}

/// 読み取り専用のオフライン状態スナップショット。
#[derive(Debug, Clone, Serialize)]
pub struct OfflineStatus {
    pub pending_operations: i64,
    pub failed_operations: i64,
    pub cached_items: BTreeMap<String, i64>,
    pub storage_usage: StorageUsage,
    pub last_sync: Option<i64>,
}

/// エンジン全体を束ねるハンドル。
///
/// 起動時に一度だけ構築し、利用側（UI 層・プラットフォーム層）へ
/// 参照で引き回す。グローバルシングルトンは持たない。
pub struct EngineState {
    pub config: EngineConfig,
    pub db_pool: DbPool,
    pub api: Arc<dyn RemoteApi>,
    pub cache: Arc<TtlCache>,
    pub oplog: Arc<OperationLog>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub uploads: Arc<UploadManager>,
    pub network: Arc<NetworkMonitor>,
    pub events: Arc<EventBus>,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl EngineState {
    /// ストア初期化・期限切れスイープ・バックグラウンドタスクの起動まで
    /// 済ませた状態のハンドルを返す。
    pub async fn initialize(
        config: EngineConfig,
        api: Arc<dyn RemoteApi>,
    ) -> anyhow::Result<Arc<Self>> {
        info!("offline engine starting");

        let db_pool = Database::initialize(&config.database).await?;
        let events = Arc::new(EventBus::default());
        let network = Arc::new(NetworkMonitor::new(config.network.offline_mode));
        let cache = Arc::new(TtlCache::new(db_pool.clone(), config.cache.clone()));
        let oplog = Arc::new(OperationLog::new(db_pool.clone()));

        // 起動時の掃除。期限切れキャッシュと保持期間超過の synced レコード
        let removed = cache.cleanup_expired().await?;
        if removed > 0 {
            info!(target: "cache", removed, "expired cache entries purged");
        }
        let purged = oplog
            .purge_synced_older_than(Duration::from_secs(config.sync.synced_retention))
            .await?;
        if purged > 0 {
            info!(target: "sync", purged, "old synced operations purged");
        }

        let orchestrator = Arc::new(SyncOrchestrator::new(
            oplog.clone(),
            api.clone(),
            network.clone(),
            events.clone(),
            config.sync.clone(),
        ));
        let uploads = Arc::new(UploadManager::new(
            api.clone(),
            events.clone(),
            config.upload.clone(),
            Some(oplog.clone()),
        ));

        let state = Arc::new(Self {
            config,
            db_pool,
            api,
            cache,
            oplog,
            orchestrator,
            uploads,
            network,
            events,
            background: Mutex::new(Vec::new()),
        });

        state.spawn_background().await;
        Ok(state)
    }

    /// ネットワーク遷移の監視と自動同期を起動する。
    async fn spawn_background(self: &Arc<Self>) {
        let mut handles = self.background.lock().await;

        // オンライン復帰で同期を蹴るウォッチャ
        let network = self.network.clone();
        let orchestrator = self.orchestrator.clone();
        let events = self.events.clone();
        let mut rx = self.network.subscribe();
        let mut was_online = network.is_online();
        handles.push(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                rx.borrow_and_update();
                let online = network.is_online();
                events.emit(EngineEvent::NetworkChanged { online });

                if online && !was_online {
                    info!(target: "network", "connectivity restored, triggering sync");
                    if let Err(err) = orchestrator.sync_pending_operations().await {
                        warn!(target: "sync", error = %err, "sync after reconnect failed");
                    }
                }
                was_online = online;
            }
        }));

        if self.config.sync.auto_sync {
            handles.push(
                self.orchestrator
                    .schedule_auto_sync(self.config.sync.sync_interval),
            );
        }
    }

    /// バックグラウンドタスクを止め、接続プールを閉じる。
    pub async fn dispose(&self) {
        let handles: Vec<_> = self.background.lock().await.drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        // 停止を見届けてからプールを閉じる
        let _ = futures::future::join_all(handles).await;
        self.db_pool.close().await;
        info!("offline engine disposed");
    }

    /// キャッシュ経由のリモート取得。UI 層の読み出しはここを通る。
    pub async fn fetch_cached(
        &self,
        endpoint: &str,
        params: &[(String, String)],
        options: FetchOptions,
    ) -> Result<CachedPayload> {
        let key = fingerprint(endpoint, params);
        let api = self.api.clone();
        let endpoint = endpoint.to_string();
        let params = params.to_vec();
        self.cache
            .fetch_with_cache(&key, options, move || async move {
                api.fetch(&endpoint, &params).await
            })
            .await
    }

    /// ミューテーション意図をログに積む。オフラインでも常に成功する。
    pub async fn queue_operation(
        &self,
        operation: OperationKind,
        entity_type: &str,
        entity_id: &str,
        data: bytes::Bytes,
    ) -> Result<OperationRecord> {
        self.oplog
            .append(operation, entity_type, entity_id, data)
            .await
    }

    pub async fn status(&self) -> Result<OfflineStatus> {
        let (pending_operations, failed_operations) = self.oplog.count_by_status().await?;
        let cached_items = self.cache.count_by_namespace().await?;
        let used_bytes = self.cache.used_bytes().await?;
        let quota_bytes = self.config.cache.max_total_bytes;
        let percentage = if quota_bytes > 0 {
            used_bytes as f64 / quota_bytes as f64 * 100.0
        } else {
            0.0
        };

        Ok(OfflineStatus {
            pending_operations,
            failed_operations,
            cached_items,
            storage_usage: StorageUsage {
                used_bytes,
                quota_bytes,
                percentage,
            },
            last_sync: self.orchestrator.last_sync().await,
        })
    }
}

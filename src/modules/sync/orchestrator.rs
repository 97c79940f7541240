use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{info, warn};

use super::conflict::{conflict_note, merge_by_replace};
use crate::modules::api::{ApiResponse, RemoteApi};
use crate::modules::network::NetworkMonitor;
use crate::modules::oplog::{OperationLog, OperationRecord};
use crate::shared::config::{ConflictPolicy, SyncConfig};
use crate::shared::error::{EngineError, Result};
use crate::shared::events::{EngineEvent, EventBus};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub synced_count: u32,
    pub failed_count: u32,
}

/// 1 レコードの再実行結果。
enum ReplayOutcome {
    Synced,
    Failed(String),
    /// 一時エラー。pending のまま次の同期周期へ持ち越す。
    Deferred,
}

/// Operation Log をリモート API に対してドレインする司令塔。
///
/// 周期ごとの状態遷移は Idle → Draining →（レコード単位の再実行）→ Idle。
/// 同一周期内の再実行順は挿入順（FIFO）で、1 件の失敗は後続を止めない。
pub struct SyncOrchestrator {
    log: Arc<OperationLog>,
    api: Arc<dyn RemoteApi>,
    network: Arc<NetworkMonitor>,
    events: Arc<EventBus>,
    config: SyncConfig,
    last_sync: RwLock<Option<i64>>,
    // 再入防止。二重ドレインはレコードの二重送信につながる
    gate: Mutex<()>,
    cancel_requested: AtomicBool,
}

impl SyncOrchestrator {
    pub fn new(
        log: Arc<OperationLog>,
        api: Arc<dyn RemoteApi>,
        network: Arc<NetworkMonitor>,
        events: Arc<EventBus>,
        config: SyncConfig,
    ) -> Self {
        Self {
            log,
            api,
            network,
            events,
            config,
            last_sync: RwLock::new(None),
            gate: Mutex::new(()),
            cancel_requested: AtomicBool::new(false),
        }
    }

    pub async fn last_sync(&self) -> Option<i64> {
        *self.last_sync.read().await
    }

    /// 実行中の周期に対して中断を要求する。処理中のレコードは
    /// 完了（またはタイムアウト）まで走り、次のレコードは開始されない。
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    /// pending レコードを挿入順にリモートへ再実行する。
    /// オフライン中の呼び出しは即座にエラーとなる。
    pub async fn sync_pending_operations(&self) -> Result<SyncReport> {
        if !self.network.is_online() {
            return Err(EngineError::Network("cannot sync while offline".into()));
        }

        let _guard = self.gate.lock().await;
        self.cancel_requested.store(false, Ordering::SeqCst);

        let pending = self.log.list_pending().await?;
        self.events.emit(EngineEvent::SyncStarted {
            count: pending.len(),
        });
        info!(target: "sync", count = pending.len(), "sync cycle started");

        let mut report = SyncReport::default();
        for record in pending {
            if self.cancel_requested.load(Ordering::SeqCst) {
                info!(target: "sync", "sync cycle cancelled");
                break;
            }

            match self.replay_record(&record).await {
                ReplayOutcome::Synced => {
                    report.synced_count += 1;
                    self.events.emit(EngineEvent::OperationSynced {
                        id: record.id.clone(),
                    });
                }
                ReplayOutcome::Failed(error) => {
                    report.failed_count += 1;
                    self.events.emit(EngineEvent::OperationFailed {
                        id: record.id.clone(),
                        error,
                    });
                }
                ReplayOutcome::Deferred => {}
            }
        }

        *self.last_sync.write().await = Some(Utc::now().timestamp());
        self.events.emit(EngineEvent::SyncCompleted {
            synced_count: report.synced_count,
            failed_count: report.failed_count,
        });
        info!(
            target: "sync",
            synced = report.synced_count,
            failed = report.failed_count,
            "sync cycle completed"
        );

        Ok(report)
    }

    async fn replay_record(&self, record: &OperationRecord) -> ReplayOutcome {
        match self.dispatch(record, false).await {
            Ok(_) => self.finish_synced(&record.id, None).await,
            Err(err) => {
                if let Err(log_err) = self.log.record_attempt(&record.id).await {
                    warn!(target: "sync", id = %record.id, error = %log_err, "failed to record attempt");
                }
                self.handle_replay_error(record, err).await
            }
        }
    }

    async fn handle_replay_error(
        &self,
        record: &OperationRecord,
        err: EngineError,
    ) -> ReplayOutcome {
        match err {
            EngineError::Conflict { remote_data, .. } => {
                self.resolve_conflict(record, remote_data).await
            }
            // リモート側で既に消えている対象への操作は破棄して完了扱い
            EngineError::NotFound(_) => {
                self.finish_synced(&record.id, Some("entity deleted remotely, operation discarded"))
                    .await
            }
            err if err.is_retryable() => {
                if record.retry_count + 1 >= i64::from(self.config.max_retries) {
                    self.finish_failed(&record.id, &format!("retries exhausted: {err}"))
                        .await
                } else {
                    warn!(
                        target: "sync",
                        id = %record.id,
                        error = %err,
                        "transient replay failure, will retry next cycle"
                    );
                    ReplayOutcome::Deferred
                }
            }
            err => self.finish_failed(&record.id, &err.to_string()).await,
        }
    }

    async fn resolve_conflict(
        &self,
        record: &OperationRecord,
        remote_data: Option<String>,
    ) -> ReplayOutcome {
        match self.config.conflict_policy {
            ConflictPolicy::LocalWins => match self.dispatch(record, true).await {
                Ok(_) => self.finish_synced(&record.id, None).await,
                Err(err) => {
                    self.finish_failed(&record.id, &format!("forced apply failed: {err}"))
                        .await
                }
            },
            ConflictPolicy::RemoteWins => {
                self.finish_synced(&record.id, Some("conflict resolved: remote wins"))
                    .await
            }
            ConflictPolicy::MergeReplace => self.resolve_by_merge(record, remote_data).await,
            ConflictPolicy::Manual => {
                let remote = self.remote_snapshot(record, remote_data).await;
                let note = conflict_note(&record.data, remote.as_deref());
                self.finish_failed(&record.id, &note).await
            }
        }
    }

    async fn resolve_by_merge(
        &self,
        record: &OperationRecord,
        remote_data: Option<String>,
    ) -> ReplayOutcome {
        let remote = self.remote_snapshot(record, remote_data).await;
        let merged = remote
            .as_deref()
            .and_then(|r| merge_by_replace(&record.data, r.as_bytes()));

        match merged {
            Some(data) => {
                let mut merged_record = record.clone();
                merged_record.data = Bytes::from(data);
                match self.dispatch(&merged_record, true).await {
                    Ok(_) => {
                        self.finish_synced(&record.id, Some("conflict resolved: merged"))
                            .await
                    }
                    Err(err) => {
                        // マージ適用にも失敗したら手動解決へ落とす
                        let note = conflict_note(&record.data, remote.as_deref());
                        warn!(target: "sync", id = %record.id, error = %err, "merge apply failed");
                        self.finish_failed(&record.id, &note).await
                    }
                }
            }
            None => {
                let note = conflict_note(&record.data, remote.as_deref());
                self.finish_failed(&record.id, &note).await
            }
        }
    }

    /// 競合通知に載っていればそれを、無ければリモートから現況を取る。
    async fn remote_snapshot(
        &self,
        record: &OperationRecord,
        remote_data: Option<String>,
    ) -> Option<String> {
        if remote_data.is_some() {
            return remote_data;
        }
        match self
            .api
            .fetch_entity(&record.entity_type, &record.entity_id)
            .await
        {
            Ok(Some(bytes)) => String::from_utf8(bytes.to_vec()).ok(),
            _ => None,
        }
    }

    async fn dispatch(&self, record: &OperationRecord, force: bool) -> Result<ApiResponse> {
        let limit = Duration::from_secs(self.config.request_timeout);
        let response = match timeout(limit, self.api.replay_operation(record, force)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(EngineError::Timeout(format!(
                    "replay of operation {} timed out",
                    record.id
                )))
            }
        };

        if !response.success {
            let message = response
                .message
                .unwrap_or_else(|| "remote rejected operation".to_string());
            return Err(EngineError::Internal(message));
        }
        Ok(response)
    }

    async fn finish_synced(&self, id: &str, note: Option<&str>) -> ReplayOutcome {
        if let Err(err) = self.log.mark_synced_with_note(id, note).await {
            warn!(target: "sync", id, error = %err, "failed to mark record synced");
            return ReplayOutcome::Failed(err.to_string());
        }
        ReplayOutcome::Synced
    }

    async fn finish_failed(&self, id: &str, error: &str) -> ReplayOutcome {
        if let Err(err) = self.log.mark_failed(id, error).await {
            warn!(target: "sync", id, error = %err, "failed to mark record failed");
        }
        ReplayOutcome::Failed(error.to_string())
    }

    /// 一定間隔で同期を回すバックグラウンドタスクを起動する。
    pub fn schedule_auto_sync(self: &Arc<Self>, interval_secs: u64) -> tokio::task::JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            // interval の初回 tick は即時発火なので読み捨てる
            interval.tick().await;
            loop {
                interval.tick().await;
                if !orchestrator.network.is_online() {
                    continue;
                }
                if let Err(err) = orchestrator.sync_pending_operations().await {
                    warn!(target: "sync", error = %err, "auto sync failed");
                }
            }
        })
    }
}

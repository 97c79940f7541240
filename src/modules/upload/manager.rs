use bytes::Bytes;
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::models::{ChunkInfo, UploadSource, UploadStatus, UploadTask};
use super::validate::validate_file;
use crate::modules::api::{FileInfo, RemoteApi};
use crate::modules::oplog::{OperationKind, OperationLog};
use crate::shared::config::UploadConfig;
use crate::shared::error::{EngineError, Result};
use crate::shared::events::{EngineEvent, EventBus};

/// 指数バックオフ + ジッタ。転送系の一時エラー再試行に使う。
fn retry_delay(attempt: u32) -> Duration {
    let base = 300u64.saturating_mul(1 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..200);
    Duration::from_millis(base + jitter)
}

/// チャンク分割アップロードの管理者。
///
/// 同時転送数はマネージャ全体で `max_concurrent` に制限される。
/// 各タスクはセマフォの permit を保持している間だけ転送でき、
/// permit の獲得待ちは FIFO なので超過分は順番待ちになる。
/// タスクの状態はこの型のメソッドだけが書き換える。
pub struct UploadManager {
    api: Arc<dyn RemoteApi>,
    events: Arc<EventBus>,
    config: UploadConfig,
    tasks: Arc<RwLock<HashMap<String, UploadTask>>>,
    sources: Arc<RwLock<HashMap<String, UploadSource>>>,
    /// 完了時に upload_image 操作としてログへ積む接続先。
    attach_targets: Arc<RwLock<HashMap<String, (String, String)>>>,
    oplog: Option<Arc<OperationLog>>,
    semaphore: Arc<Semaphore>,
}

impl UploadManager {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        events: Arc<EventBus>,
        config: UploadConfig,
        oplog: Option<Arc<OperationLog>>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            api,
            events,
            config,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            sources: Arc::new(RwLock::new(HashMap::new())),
            attach_targets: Arc::new(RwLock::new(HashMap::new())),
            oplog,
            semaphore,
        }
    }

    /// ファイルを検証してキューに積む。検証はネットワークに触れず、
    /// 違反は同期的に `Validation` で返る。
    pub async fn enqueue(self: &Arc<Self>, source: UploadSource) -> Result<String> {
        self.enqueue_inner(source, None).await
    }

    /// 完了後に `upload_image` 操作として Operation Log へ接続する版。
    /// 添付先エンティティへの反映そのものは同期の仕組みに乗る。
    pub async fn enqueue_with_attach(
        self: &Arc<Self>,
        source: UploadSource,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<String> {
        self.enqueue_inner(source, Some((entity_type.to_string(), entity_id.to_string())))
            .await
    }

    async fn enqueue_inner(
        self: &Arc<Self>,
        source: UploadSource,
        attach: Option<(String, String)>,
    ) -> Result<String> {
        validate_file(
            &self.config,
            &source.file_name,
            source.size(),
            &source.mime_type,
        )?;

        let task = UploadTask::new(&source, self.config.max_retries);
        let task_id = task.id.clone();
        self.tasks.write().await.insert(task_id.clone(), task);
        self.sources.write().await.insert(task_id.clone(), source);
        if let Some(target) = attach {
            self.attach_targets
                .write()
                .await
                .insert(task_id.clone(), target);
        }

        debug!(target: "upload", task_id = %task_id, "upload task enqueued");
        self.spawn_driver(task_id.clone());
        Ok(task_id)
    }

    /// 再起動後の再開。チャンク進捗はメモリにしか無いので、
    /// リモートの `list_uploaded_chunks` を正本として突き合わせる。
    pub async fn resume_from_remote(
        self: &Arc<Self>,
        source: UploadSource,
        upload_id: &str,
    ) -> Result<String> {
        validate_file(
            &self.config,
            &source.file_name,
            source.size(),
            &source.mime_type,
        )?;

        let remote = self.api.list_uploaded_chunks(upload_id).await?;
        let chunk_size = self.config.chunk_size;
        let total_chunks = source.size().div_ceil(chunk_size) as u32;
        let uploaded_chunks: BTreeSet<u32> = remote
            .into_iter()
            .filter(|index| *index < total_chunks)
            .collect();

        let mut task = UploadTask::new(&source, self.config.max_retries);
        let info = ChunkInfo {
            upload_id: upload_id.to_string(),
            chunk_size,
            total_chunks,
            uploaded_chunks,
        };
        task.uploaded_bytes = info.uploaded_bytes(task.file_size);
        task.chunk_info = Some(info);
        task.update_progress(0, 0.0);

        let task_id = task.id.clone();
        self.tasks.write().await.insert(task_id.clone(), task);
        self.sources.write().await.insert(task_id.clone(), source);

        info!(target: "upload", task_id = %task_id, upload_id, "resuming upload from remote state");
        self.spawn_driver(task_id.clone());
        Ok(task_id)
    }

    pub async fn get_task(&self, task_id: &str) -> Option<UploadTask> {
        self.tasks.read().await.get(task_id).cloned()
    }

    pub async fn list_tasks(&self) -> Vec<UploadTask> {
        self.tasks.read().await.values().cloned().collect()
    }

    /// uploading 状態のタスク数。
    pub async fn active_count(&self) -> usize {
        self.tasks
            .read()
            .await
            .values()
            .filter(|task| task.status == UploadStatus::Uploading)
            .count()
    }

    /// 転送中のタスクを一時停止する。転送中のチャンクは流れきり、
    /// 次のチャンク境界でドライバが停止する。
    pub async fn pause(&self, task_id: &str) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| EngineError::NotFound(format!("upload task {task_id}")))?;
        match task.status {
            UploadStatus::Uploading => {
                task.status = UploadStatus::Paused;
                info!(target: "upload", task_id, "upload paused");
                Ok(())
            }
            other => Err(EngineError::Validation(format!(
                "cannot pause upload in status {other}"
            ))),
        }
    }

    /// paused → pending。ドライバを積み直し、チャンク進捗は
    /// リモートとの突き合わせで復元される。
    pub async fn resume(self: &Arc<Self>, task_id: &str) -> Result<()> {
        {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| EngineError::NotFound(format!("upload task {task_id}")))?;
            if task.status != UploadStatus::Paused {
                return Err(EngineError::Validation(format!(
                    "cannot resume upload in status {}",
                    task.status
                )));
            }
            task.status = UploadStatus::Pending;
            Self::rollback_to_chunk_boundary(task);
        }
        self.spawn_driver(task_id.to_string());
        Ok(())
    }

    /// failed → pending。`max_retries` 回まで。進捗はゼロではなく
    /// 最後に確定したチャンク境界まで戻る。
    pub async fn retry(self: &Arc<Self>, task_id: &str) -> Result<()> {
        if !self.sources.read().await.contains_key(task_id) {
            return Err(EngineError::NotFound(format!(
                "upload source for task {task_id} is gone"
            )));
        }
        {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| EngineError::NotFound(format!("upload task {task_id}")))?;
            if task.status != UploadStatus::Failed {
                return Err(EngineError::Validation(format!(
                    "cannot retry upload in status {}",
                    task.status
                )));
            }
            if task.retry_count >= task.max_retries {
                return Err(EngineError::Validation(format!(
                    "retry budget exhausted for task {task_id}"
                )));
            }
            task.retry_count += 1;
            task.status = UploadStatus::Pending;
            task.error = None;
            Self::rollback_to_chunk_boundary(task);
        }
        self.spawn_driver(task_id.to_string());
        Ok(())
    }

    /// ローカルは無条件で cancelled にする。リモートの掃除は
    /// ベストエフォートで、失敗しても状態は変わらない。
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        let upload_id = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| EngineError::NotFound(format!("upload task {task_id}")))?;
            if task.status.is_finished() {
                return Err(EngineError::Validation(format!(
                    "upload already finished in status {}",
                    task.status
                )));
            }
            task.status = UploadStatus::Cancelled;
            task.chunk_info.as_ref().map(|info| info.upload_id.clone())
        };
        self.sources.write().await.remove(task_id);
        self.attach_targets.write().await.remove(task_id);

        if let Some(upload_id) = upload_id {
            if let Err(err) = self.api.cancel_upload(&upload_id).await {
                warn!(target: "upload", upload_id, error = %err, "remote cancel failed (ignored)");
            }
        }
        info!(target: "upload", task_id, "upload cancelled");
        Ok(())
    }

    /// 終了状態（completed / failed / cancelled）のタスクを片付ける。
    pub async fn cleanup_finished(&self) -> usize {
        let mut tasks = self.tasks.write().await;
        let finished: Vec<String> = tasks
            .iter()
            .filter(|(_, task)| task.status.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &finished {
            tasks.remove(id);
        }
        drop(tasks);

        let mut sources = self.sources.write().await;
        let mut attach = self.attach_targets.write().await;
        for id in &finished {
            sources.remove(id);
            attach.remove(id);
        }
        finished.len()
    }

    fn rollback_to_chunk_boundary(task: &mut UploadTask) {
        task.uploaded_bytes = match &task.chunk_info {
            Some(info) => info.uploaded_bytes(task.file_size),
            None => 0,
        };
        task.speed = 0.0;
        task.remaining_secs = None;
        task.update_progress(0, 0.0);
    }

    fn spawn_driver(self: &Arc<Self>, task_id: String) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.drive(&task_id).await;
        });
    }

    async fn drive(&self, task_id: &str) {
        // permit はタスクの転送が終わるまで保持する。これにより
        // 転送（チャンク・一括とも）の同時実行数が全体で抑えられる
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(task_id) else {
                return;
            };
            // 順番待ちの間に止められていたら開始しない
            if task.status != UploadStatus::Pending {
                return;
            }
            task.status = UploadStatus::Uploading;
            task.error = None;
        }

        let source = match self.sources.read().await.get(task_id).cloned() {
            Some(source) => source,
            None => {
                self.fail_task(task_id, "upload source missing").await;
                return;
            }
        };

        let outcome = if source.size() <= self.config.chunk_size {
            self.transfer_whole(task_id, &source).await
        } else {
            self.transfer_chunked(task_id, &source).await
        };
        drop(permit);

        match outcome {
            Ok(Some(result)) => self.complete_task(task_id, result).await,
            // チャンク境界で pause / cancel を検知して抜けた
            Ok(None) => {}
            Err(err) => self.fail_task(task_id, &err.to_string()).await,
        }
    }

    async fn transfer_whole(
        &self,
        task_id: &str,
        source: &UploadSource,
    ) -> Result<Option<FileInfo>> {
        let started = Instant::now();
        let mut attempt = 0u32;
        let result = loop {
            let call = self.api.upload_file(
                &source.file_name,
                &source.mime_type,
                source.data.clone(),
            );
            match self.with_timeout("upload_file", call).await {
                Ok(info) => break info,
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    if self.current_status(task_id).await? != UploadStatus::Uploading {
                        return Ok(None);
                    }
                    debug!(target: "upload", task_id, attempt, error = %err, "retrying whole-file upload");
                    tokio::time::sleep(retry_delay(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        };

        {
            let mut tasks = self.tasks.write().await;
            if let Some(task) = tasks.get_mut(task_id) {
                task.uploaded_bytes = task.file_size;
                task.update_progress(task.file_size, started.elapsed().as_secs_f64());
                self.events.emit(EngineEvent::UploadProgress {
                    task_id: task_id.to_string(),
                    progress: task.progress,
                });
            }
        }
        Ok(Some(result))
    }

    async fn transfer_chunked(
        &self,
        task_id: &str,
        source: &UploadSource,
    ) -> Result<Option<FileInfo>> {
        let mut info = match self.existing_chunk_info(task_id).await {
            // 再開。リモートの一覧が正本なのでローカルの記憶は差し替える
            Some(mut info) => {
                let remote = self
                    .with_timeout(
                        "list_uploaded_chunks",
                        self.api.list_uploaded_chunks(&info.upload_id),
                    )
                    .await?;
                info.uploaded_chunks = remote
                    .into_iter()
                    .filter(|index| *index < info.total_chunks)
                    .collect();
                info
            }
            None => {
                let session = self
                    .with_timeout(
                        "init_upload",
                        self.api.init_upload(
                            &source.file_name,
                            source.size(),
                            &source.mime_type,
                            self.config.chunk_size,
                        ),
                    )
                    .await?;
                ChunkInfo {
                    upload_id: session.upload_id,
                    chunk_size: session.chunk_size,
                    total_chunks: session.total_chunks,
                    uploaded_chunks: BTreeSet::new(),
                }
            }
        };

        let upload_id = info.upload_id.clone();
        let total_chunks = info.total_chunks;
        self.store_chunk_info(task_id, info.clone()).await;

        let started = Instant::now();
        let mut session_bytes = 0u64;
        for index in 0..total_chunks {
            if info.uploaded_chunks.contains(&index) {
                continue;
            }
            // チャンク境界での協調キャンセル / 一時停止
            match self.current_status(task_id).await? {
                UploadStatus::Uploading => {}
                _ => return Ok(None),
            }

            let start = u64::from(index) * info.chunk_size;
            let end = (start + info.chunk_size).min(source.size());
            let data = source.data.slice(start as usize..end as usize);
            let sent = data.len() as u64;

            self.send_chunk_with_retry(task_id, &upload_id, index, data)
                .await?;

            info.uploaded_chunks.insert(index);
            session_bytes += sent;
            self.record_chunk_progress(
                task_id,
                &info,
                sent,
                session_bytes,
                started.elapsed().as_secs_f64(),
            )
            .await;
        }

        if !info.is_complete() {
            return Err(EngineError::Internal(format!(
                "upload {upload_id} is missing chunks before merge"
            )));
        }
        // マージ直前にも停止要求を拾う
        if self.current_status(task_id).await? != UploadStatus::Uploading {
            return Ok(None);
        }
        let result = self
            .with_timeout("complete_upload", self.api.complete_upload(&upload_id))
            .await?;
        Ok(Some(result))
    }

    async fn send_chunk_with_retry(
        &self,
        task_id: &str,
        upload_id: &str,
        index: u32,
        data: Bytes,
    ) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            let call = self.api.upload_chunk(upload_id, index, data.clone());
            match self.with_timeout("upload_chunk", call).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    if self.current_status(task_id).await? != UploadStatus::Uploading {
                        return Err(EngineError::Cancelled);
                    }
                    debug!(
                        target: "upload",
                        upload_id,
                        index,
                        attempt,
                        error = %err,
                        "retrying chunk"
                    );
                    tokio::time::sleep(retry_delay(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn with_timeout<T>(
        &self,
        what: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match timeout(Duration::from_secs(self.config.upload_timeout), fut).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(format!("{what} timed out"))),
        }
    }

    async fn existing_chunk_info(&self, task_id: &str) -> Option<ChunkInfo> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .and_then(|task| task.chunk_info.clone())
    }

    async fn current_status(&self, task_id: &str) -> Result<UploadStatus> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .map(|task| task.status)
            .ok_or_else(|| EngineError::NotFound(format!("upload task {task_id}")))
    }

    async fn store_chunk_info(&self, task_id: &str, info: ChunkInfo) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(task_id) {
            task.uploaded_bytes = info.uploaded_bytes(task.file_size);
            task.chunk_info = Some(info);
            task.update_progress(0, 0.0);
        }
    }

    async fn record_chunk_progress(
        &self,
        task_id: &str,
        info: &ChunkInfo,
        sent: u64,
        session_bytes: u64,
        elapsed_secs: f64,
    ) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(task_id) {
            task.uploaded_bytes = task.uploaded_bytes.saturating_add(sent);
            task.chunk_info = Some(info.clone());
            task.update_progress(session_bytes, elapsed_secs);
            self.events.emit(EngineEvent::UploadProgress {
                task_id: task_id.to_string(),
                progress: task.progress,
            });
        }
    }

    async fn complete_task(&self, task_id: &str, result: FileInfo) {
        let completed = {
            let mut tasks = self.tasks.write().await;
            match tasks.get_mut(task_id) {
                // 転送完了とキャンセルが競った場合は cancelled が残る
                Some(task) if task.status == UploadStatus::Uploading => {
                    task.status = UploadStatus::Completed;
                    task.progress = 100.0;
                    task.uploaded_bytes = task.file_size;
                    task.remaining_secs = Some(0.0);
                    task.result = Some(result.clone());
                    true
                }
                _ => false,
            }
        };
        if !completed {
            return;
        }

        self.sources.write().await.remove(task_id);
        self.queue_attach_operation(task_id, &result).await;

        info!(target: "upload", task_id, file_id = %result.file_id, "upload completed");
        self.events.emit(EngineEvent::UploadCompleted {
            task_id: task_id.to_string(),
            result,
        });
    }

    /// 添付先が指定されたアップロードは、完了後の紐付けミューテーションを
    /// upload_image 操作としてログに積み、他の操作と同じ再実行に乗せる。
    async fn queue_attach_operation(&self, task_id: &str, result: &FileInfo) {
        let target = self.attach_targets.write().await.remove(task_id);
        let (Some((entity_type, entity_id)), Some(log)) = (target, self.oplog.as_ref()) else {
            return;
        };

        let payload = serde_json::json!({
            "fileId": result.file_id,
            "fileName": result.file_name,
            "url": result.url,
        })
        .to_string();

        if let Err(err) = log
            .append(
                OperationKind::UploadImage,
                &entity_type,
                &entity_id,
                Bytes::from(payload),
            )
            .await
        {
            warn!(target: "upload", task_id, error = %err, "failed to queue attach operation");
        }
    }

    async fn fail_task(&self, task_id: &str, error: &str) {
        let failed = {
            let mut tasks = self.tasks.write().await;
            match tasks.get_mut(task_id) {
                Some(task)
                    if matches!(
                        task.status,
                        UploadStatus::Uploading | UploadStatus::Pending
                    ) =>
                {
                    task.status = UploadStatus::Failed;
                    task.error = Some(error.to_string());
                    true
                }
                _ => false,
            }
        };
        if !failed {
            return;
        }

        warn!(target: "upload", task_id, error, "upload failed");
        self.events.emit(EngineEvent::UploadFailed {
            task_id: task_id.to_string(),
            error: error.to_string(),
        });
    }
}

//! 下载调度器
//!
//! 持有全部任务，按优先级把排队任务派发给独立的 worker，
//! 并负责暂停、恢复、取消、删除等状态变更。
//!
//! ## 并发模型
//!
//! - 任务表、worker 表和任务位池由同一把锁保护，锁只在内存更新期间持有，
//!   网络和磁盘 I/O 全部在锁外进行
//! - 每个 worker 拥有一个 `CancellationToken`，暂停/取消/关闭都通过它
//!   在 chunk 边界通知传输层，三者的区别记录在 `StopReason` 中，
//!   由 worker 退出时统一处理
//! - 同一任务任意时刻最多只有一个 worker，临时文件由它独占；
//!   worker 退出前它的目标路径一直被占用，即使任务已取消或移除

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::auth::HostAuth;
use super::finalizer::{discard_partial, finalize, FinalizeSpec};
use super::path::{resolve_target, sanitize_directory, sanitize_filename};
use super::progress::SpeedSampler;
use super::task::{derive_task_id, DownloadRequest, DownloadTask, TaskStatus};
use super::task_slot_pool::TaskSlotPool;
use super::transfer::{
    select_transfer, Transfer, TransferOutcome, TransferProgress, TransferRequest,
};
use crate::config::AppConfig;
use crate::persistence::{CompletionRecord, HistoryDbManager, QueueSnapshotStore};
use crate::server::events::{
    DownloadEvent, ObserverId, ProgressBroadcaster, ProgressEvent, ProgressObserver,
    TimestampedEvent,
};

/// 关闭时等待 worker 退出的最长时间
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// worker 被要求停止的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    /// 保留临时文件
    Pause,
    /// 删除临时文件
    Cancel,
    /// 进程退出：状态和临时文件都不动，下次启动降级为排队后续传
    Shutdown,
}

/// 正在运行的 worker
#[derive(Debug)]
struct WorkerHandle {
    token: CancellationToken,
    slot_id: usize,
    /// 派发序号，用于识别过期的进度回调
    attempt: u64,
    stop: Option<StopReason>,
    /// 已进入校验落盘阶段，不再响应暂停和取消
    finalizing: bool,
    /// 目标路径，worker 退出前不允许其他任务使用
    final_path: Option<PathBuf>,
}

/// 锁保护的调度状态
struct QueueState {
    tasks: HashMap<String, DownloadTask>,
    workers: HashMap<String, WorkerHandle>,
    slots: TaskSlotPool,
    next_seq: u64,
    next_attempt: u64,
    /// 快照代数，每次持久化递增
    generation: u64,
    shutting_down: bool,
}

impl QueueState {
    fn is_current_worker(&self, task_id: &str, attempt: u64) -> bool {
        self.workers
            .get(task_id)
            .map(|w| w.attempt == attempt && w.stop.is_none())
            .unwrap_or(false)
    }

    /// 占用目标路径的任务：未结束的任务，或 worker 尚未退出的任务
    fn target_occupant(
        &self,
        models_root: &Path,
        final_path: &Path,
        exclude: Option<&str>,
    ) -> Option<String> {
        let pending = self.tasks.values().find(|t| {
            Some(t.id.as_str()) != exclude
                && !t.status.is_terminal()
                && resolve_target(models_root, &t.directory, &t.filename)
                    .map(|other| other.final_path == final_path)
                    .unwrap_or(false)
        });
        if let Some(task) = pending {
            return Some(task.id.clone());
        }

        self.workers
            .iter()
            .find(|(id, w)| {
                Some(id.as_str()) != exclude && w.final_path.as_deref() == Some(final_path)
            })
            .map(|(id, _)| id.clone())
    }
}

/// worker 的最终结果
#[derive(Debug)]
enum WorkerOutcome {
    Completed(u64),
    Failed(String),
    Interrupted,
}

/// 调度器构造参数
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// 模型根目录
    pub models_root: PathBuf,
    /// 最大同时下载数（0 表示不限）
    pub max_parallel: usize,
    /// 队列快照文件
    pub queue_file: PathBuf,
    /// 完成历史数据库，None 时不记录历史
    pub history_db: Option<PathBuf>,
    /// 进度采样间隔
    pub progress_interval: Duration,
    /// 站点凭证
    pub auth: HostAuth,
}

struct Inner {
    state: Mutex<QueueState>,
    models_root: PathBuf,
    transfer: Arc<dyn Transfer>,
    auth: HostAuth,
    broadcaster: Arc<ProgressBroadcaster>,
    snapshot: QueueSnapshotStore,
    history: Option<Arc<HistoryDbManager>>,
    progress_interval: Duration,
}

/// 下载管理器
///
/// 克隆开销很小，所有克隆共享同一个调度状态
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    /// 创建下载管理器
    pub fn new(
        options: ManagerOptions,
        transfer: Arc<dyn Transfer>,
        broadcaster: Arc<ProgressBroadcaster>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&options.models_root)
            .with_context(|| format!("创建模型根目录失败: {:?}", options.models_root))?;

        let history = match &options.history_db {
            Some(path) => Some(Arc::new(
                HistoryDbManager::new(path)
                    .with_context(|| format!("打开历史数据库失败: {:?}", path))?,
            )),
            None => None,
        };

        info!(
            "✓ 下载管理器已创建: 模型目录={:?}, 最大并发={}, 传输引擎={}",
            options.models_root,
            options.max_parallel,
            transfer.name()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    tasks: HashMap::new(),
                    workers: HashMap::new(),
                    slots: TaskSlotPool::new(options.max_parallel),
                    next_seq: 0,
                    next_attempt: 0,
                    generation: 0,
                    shutting_down: false,
                }),
                models_root: options.models_root,
                transfer,
                auth: options.auth,
                broadcaster,
                snapshot: QueueSnapshotStore::new(options.queue_file),
                history,
                progress_interval: options.progress_interval,
            }),
        })
    }

    /// 按应用配置创建（传输策略在这里一次性选定）
    pub fn from_app_config(
        config: &AppConfig,
        broadcaster: Arc<ProgressBroadcaster>,
    ) -> Result<Self> {
        let transfer = select_transfer(&config.download)?;
        let options = ManagerOptions {
            models_root: config.download.models_root.clone(),
            max_parallel: config.download.max_parallel,
            queue_file: config.persistence.queue_file.clone(),
            history_db: Some(config.persistence.history_db.clone()),
            progress_interval: Duration::from_millis(config.download.progress_interval_ms),
            auth: HostAuth::from_config(&config.auth),
        };
        Self::new(options, transfer, broadcaster)
    }

    /// 事件广播器
    pub fn broadcaster(&self) -> Arc<ProgressBroadcaster> {
        self.inner.broadcaster.clone()
    }

    /// 注册进度观察者
    pub fn subscribe(&self, observer: Arc<dyn ProgressObserver>) -> ObserverId {
        self.inner.broadcaster.subscribe(observer)
    }

    /// 注册通道观察者
    pub fn subscribe_channel(
        &self,
    ) -> (ObserverId, tokio::sync::mpsc::UnboundedReceiver<TimestampedEvent>) {
        self.inner.broadcaster.subscribe_channel()
    }

    /// 注销进度观察者
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.inner.broadcaster.unsubscribe(id)
    }

    /// 从快照恢复队列并开始调度
    ///
    /// # Returns
    /// 恢复的任务数量
    pub async fn restore(&self) -> Result<usize> {
        let loaded = self.inner.snapshot.load().await?;
        let count = loaded.tasks.len();

        {
            let mut state = self.inner.state.lock();
            for task in loaded.tasks {
                state.next_seq = state.next_seq.max(task.seq + 1);
                if state.tasks.contains_key(&task.id) {
                    warn!("恢复时跳过重复任务: {}", task.id);
                    continue;
                }
                state.tasks.insert(task.id.clone(), task);
            }
        }

        if count > 0 {
            info!("🔄 已从快照恢复 {} 个任务", count);
            self.inner.persist().await;
            self.inner.dispatch();
        }
        Ok(count)
    }

    /// 添加下载任务
    ///
    /// 地址必须是 http/https；目标路径越界、占用临时后缀，
    /// 或与未结束任务的目标重复时返回错误
    pub async fn enqueue(&self, mut request: DownloadRequest) -> Result<String> {
        let url = reqwest::Url::parse(request.url.trim())
            .with_context(|| format!("无效的下载地址: {}", request.url))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            bail!("不支持的下载协议: {}", url.scheme());
        }

        request.url = request.url.trim().to_string();
        request.filename = sanitize_filename(&request.filename);
        request.directory = sanitize_directory(&request.directory);
        let target = resolve_target(
            &self.inner.models_root,
            &request.directory,
            &request.filename,
        )?;

        let (task_id, event) = {
            let mut state = self.inner.state.lock();

            if let Some(existing) =
                state.target_occupant(&self.inner.models_root, &target.final_path, None)
            {
                bail!(
                    "目标文件已在下载队列中: {:?} (任务 {})",
                    target.final_path,
                    existing
                );
            }

            let seq = state.next_seq;
            state.next_seq += 1;

            let created_nanos = chrono::Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_default();
            let mut salt = 0u32;
            let task_id = loop {
                let id = derive_task_id(&request.url, &request.filename, created_nanos, seq, salt);
                if !state.tasks.contains_key(&id) {
                    break id;
                }
                salt += 1;
            };

            let task = DownloadTask::new(task_id.clone(), request, seq);
            let event = DownloadEvent::Created {
                task: ProgressEvent::from(&task),
            };
            state.tasks.insert(task_id.clone(), task);
            (task_id, event)
        };

        info!("创建下载任务: id={}, 目标={:?}", task_id, target.final_path);
        self.inner.broadcaster.notify(event);
        self.inner.persist().await;
        self.inner.dispatch();

        Ok(task_id)
    }

    /// 批量添加任务，单条失败不影响其余记录
    pub async fn enqueue_batch(&self, requests: Vec<DownloadRequest>) -> Vec<Result<String>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let result = self.enqueue(request).await;
            if let Err(e) = &result {
                warn!("批量添加任务失败: {:#}", e);
            }
            results.push(result);
        }
        results
    }

    /// 暂停下载中的任务，临时文件保留
    pub async fn pause(&self, task_id: &str) -> bool {
        let event = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;

            let Some(task) = state.tasks.get_mut(task_id) else {
                return false;
            };
            if task.status != TaskStatus::Downloading {
                return false;
            }
            match state.workers.get_mut(task_id) {
                Some(worker) if !worker.finalizing && worker.stop.is_none() => {
                    worker.stop = Some(StopReason::Pause);
                    worker.token.cancel();
                }
                _ => {
                    debug!("任务 {} 正在落盘，忽略暂停请求", task_id);
                    return false;
                }
            }

            let old_status = task.status;
            task.mark_paused();
            DownloadEvent::for_transition(old_status, task)
        };

        info!("暂停下载任务: {}", task_id);
        self.inner.broadcaster.notify(event);
        self.inner.persist().await;
        true
    }

    /// 恢复暂停的任务：重新排队，之后从临时文件末尾续传
    pub async fn resume(&self, task_id: &str) -> bool {
        let event = {
            let mut state = self.inner.state.lock();
            let Some(task) = state.tasks.get_mut(task_id) else {
                return false;
            };
            if task.status != TaskStatus::Paused {
                return false;
            }
            let old_status = task.status;
            task.mark_queued();
            DownloadEvent::for_transition(old_status, task)
        };

        info!("恢复下载任务: {}", task_id);
        self.inner.broadcaster.notify(event);
        self.inner.persist().await;
        self.inner.dispatch();
        true
    }

    /// 重试失败的任务，保留临时文件以便续传
    ///
    /// 目标路径已被其他任务占用时拒绝
    pub async fn retry(&self, task_id: &str) -> bool {
        let event = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let Some(task) = state.tasks.get(task_id) else {
                return false;
            };
            if task.status != TaskStatus::Failed {
                return false;
            }
            let occupant = resolve_target(&self.inner.models_root, &task.directory, &task.filename)
                .ok()
                .and_then(|target| {
                    state.target_occupant(&self.inner.models_root, &target.final_path, Some(task_id))
                });
            if let Some(occupant) = occupant {
                warn!("任务 {} 的目标文件正被任务 {} 使用，拒绝重试", task_id, occupant);
                return false;
            }

            let Some(task) = state.tasks.get_mut(task_id) else {
                return false;
            };
            let old_status = task.status;
            task.mark_queued();
            task.error = None;
            task.completed_at = None;
            DownloadEvent::for_transition(old_status, task)
        };

        info!("重试下载任务: {}", task_id);
        self.inner.broadcaster.notify(event);
        self.inner.persist().await;
        self.inner.dispatch();
        true
    }

    /// 取消下载中或排队中的任务，临时文件会被删除
    pub async fn cancel(&self, task_id: &str) -> bool {
        let (event, cleanup) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;

            let Some(task) = state.tasks.get_mut(task_id) else {
                return false;
            };

            let cleanup = match task.status {
                TaskStatus::Downloading => match state.workers.get_mut(task_id) {
                    Some(worker) if !worker.finalizing => {
                        worker.stop = Some(StopReason::Cancel);
                        worker.token.cancel();
                        // worker 退出时删除临时文件
                        None
                    }
                    _ => {
                        debug!("任务 {} 正在落盘，忽略取消请求", task_id);
                        return false;
                    }
                },
                TaskStatus::Queued => match state.workers.get_mut(task_id) {
                    // 暂停后立即恢复，旧 worker 还没退出
                    Some(worker) => {
                        worker.stop = Some(StopReason::Cancel);
                        worker.token.cancel();
                        None
                    }
                    None => resolve_target(&self.inner.models_root, &task.directory, &task.filename)
                        .ok()
                        .map(|target| target.partial_path),
                },
                _ => return false,
            };

            let old_status = task.status;
            task.mark_cancelled();
            (DownloadEvent::for_transition(old_status, task), cleanup)
        };

        info!("取消下载任务: {}", task_id);
        if let Some(partial) = cleanup {
            self.inner.remove_staging(&partial).await;
        }
        self.inner.broadcaster.notify(event);
        self.inner.persist().await;
        true
    }

    /// 从活动集合中移除已结束的任务
    pub async fn remove(&self, task_id: &str) -> bool {
        {
            let mut state = self.inner.state.lock();
            let removable = state
                .tasks
                .get(task_id)
                .map(|t| t.status.is_terminal())
                .unwrap_or(false);
            if !removable {
                return false;
            }
            state.tasks.remove(task_id);
        }

        info!("移除下载任务: {}", task_id);
        self.inner.broadcaster.notify(DownloadEvent::Removed {
            task_id: task_id.to_string(),
        });
        self.inner.persist().await;
        true
    }

    /// 清除所有已结束的任务（完成、失败、取消）
    ///
    /// # Returns
    /// 清除的任务数量
    pub async fn clear_completed(&self) -> usize {
        let removed: Vec<String> = {
            let mut state = self.inner.state.lock();
            let ids: Vec<String> = state
                .tasks
                .values()
                .filter(|t| t.status.is_terminal())
                .map(|t| t.id.clone())
                .collect();
            for id in &ids {
                state.tasks.remove(id);
            }
            ids
        };

        if removed.is_empty() {
            return 0;
        }

        for task_id in &removed {
            self.inner.broadcaster.notify(DownloadEvent::Removed {
                task_id: task_id.clone(),
            });
        }
        info!("已清除 {} 个已结束任务", removed.len());
        self.inner.persist().await;
        removed.len()
    }

    /// 调整最大并发数
    ///
    /// 扩容后立即派发排队任务；缩容不会打断正在运行的任务
    pub fn set_max_parallel(&self, max_parallel: usize) {
        {
            let mut state = self.inner.state.lock();
            state.slots.resize(max_parallel);
        }
        info!("最大并发下载数调整为: {}", max_parallel);
        self.inner.dispatch();
    }

    /// 当前最大并发数（0 表示不限）
    pub fn max_parallel(&self) -> usize {
        self.inner.state.lock().slots.max_slots()
    }

    /// 获取任务
    pub fn get_task(&self, task_id: &str) -> Option<DownloadTask> {
        self.inner.state.lock().tasks.get(task_id).cloned()
    }

    /// 所有任务（按创建顺序）
    pub fn get_all_tasks(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<_> = self.inner.state.lock().tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    /// 下载中的任务
    pub fn get_active_tasks(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<_> = self
            .inner
            .state
            .lock()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Downloading)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    /// 排队中的任务（按派发顺序）
    pub fn get_queued_tasks(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<_> = self
            .inner
            .state
            .lock()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.priority, t.seq));
        tasks
    }

    /// 下载中的任务数
    pub fn active_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Downloading)
            .count()
    }

    /// 最近的完成记录
    pub async fn history(&self, limit: usize) -> Result<Vec<CompletionRecord>> {
        let Some(db) = self.inner.history.clone() else {
            return Ok(Vec::new());
        };
        tokio::task::spawn_blocking(move || db.recent(limit))
            .await
            .context("查询下载历史失败")?
    }

    /// 优雅关闭：所有 worker 在下一个 chunk 边界停止，状态和临时文件保持原样
    pub async fn shutdown(&self) {
        let running = {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            for worker in state.workers.values_mut() {
                if worker.stop.is_none() {
                    worker.stop = Some(StopReason::Shutdown);
                }
                worker.token.cancel();
            }
            state.workers.len()
        };

        info!("正在关闭下载管理器，等待 {} 个下载任务停止", running);

        let wait = async {
            while !self.inner.state.lock().workers.is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, wait).await.is_err() {
            warn!("⚠️ 等待下载任务停止超时，仍有任务未退出");
        }

        self.inner.persist().await;
        info!("✓ 下载管理器已关闭");
    }
}

impl Inner {
    /// 派发排队任务，直到任务位用完
    fn dispatch(self: &Arc<Self>) {
        let mut started = Vec::new();
        let mut events = Vec::new();

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.shutting_down {
                return;
            }

            let mut candidates: Vec<(i32, u64, String)> = state
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Queued && !state.workers.contains_key(&t.id))
                .map(|t| (t.priority, t.seq, t.id.clone()))
                .collect();
            candidates.sort();

            for (_, _, task_id) in candidates {
                let Some(slot_id) = state.slots.allocate(&task_id) else {
                    break;
                };
                let Some(task) = state.tasks.get_mut(&task_id) else {
                    state.slots.release(slot_id, &task_id);
                    continue;
                };
                let final_path = resolve_target(&self.models_root, &task.directory, &task.filename)
                    .ok()
                    .map(|target| target.final_path);

                state.next_attempt += 1;
                let attempt = state.next_attempt;
                let token = CancellationToken::new();
                state.workers.insert(
                    task_id.clone(),
                    WorkerHandle {
                        token: token.clone(),
                        slot_id,
                        attempt,
                        stop: None,
                        finalizing: false,
                        final_path,
                    },
                );

                let old_status = task.status;
                task.mark_downloading();
                events.push(DownloadEvent::for_transition(old_status, task));
                started.push((task_id, attempt, token));
            }
        }

        if started.is_empty() {
            return;
        }

        for event in events {
            self.broadcaster.notify(event);
        }

        for (task_id, attempt, token) in started {
            info!("⚡ 启动下载任务: {} (attempt={})", task_id, attempt);
            let inner = self.clone();
            tokio::spawn(async move {
                inner.run_worker(task_id, attempt, token).await;
            });
        }

        self.persist_in_background();
    }

    /// 单个任务的完整生命周期：传输 -> 校验落盘 -> 收尾
    async fn run_worker(self: Arc<Self>, task_id: String, attempt: u64, token: CancellationToken) {
        let task = self.state.lock().tasks.get(&task_id).cloned();
        let Some(task) = task else {
            self.finish(&task_id, attempt, None, WorkerOutcome::Interrupted)
                .await;
            return;
        };

        let target = match resolve_target(&self.models_root, &task.directory, &task.filename) {
            Ok(target) => target,
            Err(e) => {
                self.finish(&task_id, attempt, None, WorkerOutcome::Failed(format!("{:#}", e)))
                    .await;
                return;
            }
        };
        let partial = target.partial_path.clone();

        let outcome = self.transfer_and_finalize(&task, &target.final_path, &partial, attempt, &token).await;
        self.finish(&task_id, attempt, Some(partial), outcome).await;
    }

    async fn transfer_and_finalize(
        self: &Arc<Self>,
        task: &DownloadTask,
        final_path: &Path,
        partial: &Path,
        attempt: u64,
        token: &CancellationToken,
    ) -> WorkerOutcome {
        if let Some(parent) = final_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return WorkerOutcome::Failed(format!("创建目标目录失败 {:?}: {}", parent, e));
            }
        }

        let authorized = match self.auth.authorize(&task.url, task.source) {
            Ok(authorized) => authorized,
            Err(e) => return WorkerOutcome::Failed(format!("{:#}", e)),
        };
        if authorized.url != task.url {
            if let Some(t) = self.state.lock().tasks.get_mut(&task.id) {
                t.url = authorized.url.clone();
            }
        }

        let request = TransferRequest {
            task_id: task.id.clone(),
            url: authorized.url,
            headers: authorized.headers,
            partial_path: partial.to_path_buf(),
        };
        let progress = TaskProgressHandle {
            inner: self.clone(),
            task_id: task.id.clone(),
            attempt,
            sampler: SpeedSampler::new(self.progress_interval, 0),
        };

        let result = self.transfer.run(&request, &progress, token).await;

        let total_bytes = match result {
            Ok(TransferOutcome::Finished { bytes, total_bytes }) => {
                debug!("[{}] 传输结束: {} bytes", task.id, bytes);
                total_bytes
            }
            Ok(TransferOutcome::Interrupted) => return WorkerOutcome::Interrupted,
            Err(e) => {
                if token.is_cancelled() {
                    return WorkerOutcome::Interrupted;
                }
                warn!("[{}] 下载失败: {:#}", task.id, e);
                return WorkerOutcome::Failed(format!("{:#}", e));
            }
        };

        // 进入落盘阶段前最后一次确认没有停止请求
        {
            let mut state = self.state.lock();
            match state.workers.get_mut(&task.id) {
                Some(worker) if worker.attempt == attempt && worker.stop.is_none() => {
                    worker.finalizing = true;
                }
                _ => return WorkerOutcome::Interrupted,
            }
        }

        let spec = FinalizeSpec {
            expected_size: (total_bytes > 0).then_some(total_bytes),
            expected_hash: task.expected_hash.as_deref(),
        };
        match finalize(partial, final_path, spec).await {
            Ok(size) => WorkerOutcome::Completed(size),
            Err(e) => WorkerOutcome::Failed(e.to_string()),
        }
    }

    /// worker 退出：释放任务位、按停止原因收尾、继续派发
    async fn finish(
        self: &Arc<Self>,
        task_id: &str,
        attempt: u64,
        partial: Option<PathBuf>,
        outcome: WorkerOutcome,
    ) {
        let mut event = None;
        let mut record = None;

        let stop = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let handle = match state.workers.get(task_id) {
                Some(worker) if worker.attempt == attempt => state.workers.remove(task_id),
                _ => None,
            };
            let Some(handle) = handle else {
                warn!("任务 {} 的 worker 句柄不存在 (attempt={})", task_id, attempt);
                return;
            };
            state.slots.release(handle.slot_id, task_id);

            // 落盘阶段开始后结果总是生效
            let stop = if handle.finalizing { None } else { handle.stop };

            if let Some(task) = state.tasks.get_mut(task_id) {
                let old_status = task.status;
                match (stop, outcome) {
                    (Some(_), _) => {}
                    (None, WorkerOutcome::Completed(size)) => {
                        task.mark_completed(size);
                        record = Some(CompletionRecord::from_task(task));
                    }
                    (None, WorkerOutcome::Failed(message)) => {
                        task.mark_failed(message);
                    }
                    (None, WorkerOutcome::Interrupted) => {
                        task.mark_failed("传输被意外中断".to_string());
                    }
                }
                if task.status != old_status {
                    event = Some(DownloadEvent::for_transition(old_status, task));
                }
            }
            stop
        };

        match stop {
            Some(StopReason::Cancel) => {
                if let Some(partial) = &partial {
                    self.remove_staging(partial).await;
                }
                info!("任务 {} 已取消，临时文件已清理", task_id);
            }
            Some(StopReason::Pause) => info!("任务 {} 已暂停，临时文件保留", task_id),
            Some(StopReason::Shutdown) => debug!("任务 {} 随进程关闭停止", task_id),
            None => {}
        }

        if let Some(event) = event {
            match &event {
                DownloadEvent::Completed { .. } => info!("✅ 下载完成: {}", task_id),
                DownloadEvent::Failed { task } => error!(
                    "❌ 下载失败: {}, 原因: {}",
                    task_id,
                    task.error.as_deref().unwrap_or_default()
                ),
                _ => {}
            }
            self.broadcaster.notify(event);
        }

        if let (Some(record), Some(db)) = (record, self.history.clone()) {
            let result = tokio::task::spawn_blocking(move || db.add_completion(&record)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("写入下载历史失败: {:#}", e),
                Err(e) => warn!("写入下载历史任务失败: {}", e),
            }
        }

        self.persist().await;
        self.dispatch();
    }

    /// 保存队列快照
    async fn persist(&self) {
        let (generation, tasks) = {
            let mut state = self.state.lock();
            state.generation += 1;
            let mut tasks: Vec<DownloadTask> = state
                .tasks
                .values()
                .filter(|t| !t.status.is_terminal())
                .cloned()
                .collect();
            tasks.sort_by_key(|t| t.seq);
            (state.generation, tasks)
        };

        if let Err(e) = self.snapshot.save(generation, tasks).await {
            warn!("保存队列快照失败: {:#}", e);
        }
    }

    fn persist_in_background(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move {
            inner.persist().await;
        });
    }

    /// 删除当前传输策略为该任务留下的中间文件
    async fn remove_staging(&self, partial: &Path) {
        for path in self.transfer.staging_files(partial) {
            discard_partial(&path).await;
        }
    }
}

/// 把传输层的回调写回任务
struct TaskProgressHandle {
    inner: Arc<Inner>,
    task_id: String,
    attempt: u64,
    sampler: SpeedSampler,
}

impl TransferProgress for TaskProgressHandle {
    fn on_start(&self, resume_from: u64, total_bytes: u64, supports_resume: bool) {
        self.sampler.restart(resume_from);

        let event = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if !state.is_current_worker(&self.task_id, self.attempt) {
                return;
            }
            let Some(task) = state.tasks.get_mut(&self.task_id) else {
                return;
            };
            task.record_start(resume_from, total_bytes, supports_resume);
            DownloadEvent::Progress {
                task: ProgressEvent::from(&*task),
            }
        };

        if resume_from > 0 {
            info!(
                "[{}] 从 {} bytes 处续传 (总大小 {})",
                self.task_id, resume_from, total_bytes
            );
        }
        self.inner.broadcaster.notify(event);
        self.inner.persist_in_background();
    }

    fn on_bytes(&self, downloaded: u64) {
        let sample = self.sampler.sample(downloaded);

        let event = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if !state.is_current_worker(&self.task_id, self.attempt) {
                return;
            }
            let Some(task) = state.tasks.get_mut(&self.task_id) else {
                return;
            };
            task.record_bytes(downloaded);

            // 只在采样点推送进度，避免每个 chunk 都通知观察者
            let Some(sample) = sample else {
                return;
            };
            task.record_speed(sample.speed_bps);
            DownloadEvent::Progress {
                task: ProgressEvent::from(&*task),
            }
        };

        self.inner.broadcaster.notify(event);
        self.inner.persist_in_background();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::transfer::{NativeTransfer, TransferSettings};
    use async_trait::async_trait;
    use axum::body::{Body, Bytes};
    use axum::extract::{Path as UrlPath, State};
    use axum::http::{header, HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;
    use futures::StreamExt;
    use sha2::{Digest, Sha256};
    use std::time::Instant;
    use tempfile::TempDir;

    /// 测试文件服务器
    ///
    /// - `/range/<name>`: 支持 Range
    /// - `/norange/<name>`: 忽略 Range，总是 200
    /// - `/slow/<name>`: 支持 Range，每个数据块之间停顿
    #[derive(Clone)]
    struct FileServer {
        files: Arc<HashMap<String, Bytes>>,
        range_log: Arc<Mutex<Vec<Option<String>>>>,
    }

    const SERVER_CHUNK: usize = 64 * 1024;

    async fn serve_file(
        State(server): State<FileServer>,
        UrlPath((mode, name)): UrlPath<(String, String)>,
        headers: HeaderMap,
    ) -> Response {
        let range = headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        server.range_log.lock().push(range.clone());

        let Some(data) = server.files.get(&name).cloned() else {
            return StatusCode::NOT_FOUND.into_response();
        };
        let total = data.len();

        let start = if mode == "norange" {
            None
        } else {
            range
                .as_deref()
                .and_then(|r| r.strip_prefix("bytes="))
                .and_then(|r| r.strip_suffix('-'))
                .and_then(|r| r.parse::<usize>().ok())
        };

        if let Some(start) = start {
            if start >= total {
                return (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    [(header::CONTENT_RANGE, format!("bytes */{}", total))],
                )
                    .into_response();
            }
        }

        let offset = start.unwrap_or(0);
        let body = data.slice(offset..);
        let chunks: Vec<Bytes> = (0..body.len())
            .step_by(SERVER_CHUNK)
            .map(|i| body.slice(i..(i + SERVER_CHUNK).min(body.len())))
            .collect();
        let delay = (mode == "slow").then(|| Duration::from_millis(10));
        let stream = futures::stream::iter(chunks).then(move |chunk| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok::<Bytes, std::io::Error>(chunk)
        });

        let mut builder = Response::builder()
            .header(header::CONTENT_LENGTH, body.len())
            .header(header::CONTENT_TYPE, "application/octet-stream");
        if mode != "norange" {
            builder = builder.header(header::ACCEPT_RANGES, "bytes");
        }
        builder = match start {
            Some(start) => builder.status(StatusCode::PARTIAL_CONTENT).header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, total - 1, total),
            ),
            None => builder.status(StatusCode::OK),
        };
        builder.body(Body::from_stream(stream)).unwrap()
    }

    async fn start_server(files: Vec<(&str, Bytes)>) -> (String, FileServer) {
        let server = FileServer {
            files: Arc::new(
                files
                    .into_iter()
                    .map(|(name, data)| (name.to_string(), data))
                    .collect(),
            ),
            range_log: Arc::new(Mutex::new(Vec::new())),
        };
        let app = Router::new()
            .route("/:mode/:name", get(serve_file))
            .with_state(server.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), server)
    }

    fn test_bytes(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn test_manager(dir: &TempDir, max_parallel: usize) -> DownloadManager {
        let transfer = NativeTransfer::new(TransferSettings {
            read_timeout: Duration::from_secs(10),
            ..TransferSettings::default()
        })
        .unwrap();
        test_manager_with(dir, max_parallel, Arc::new(transfer))
    }

    fn test_manager_with(
        dir: &TempDir,
        max_parallel: usize,
        transfer: Arc<dyn Transfer>,
    ) -> DownloadManager {
        let options = ManagerOptions {
            models_root: dir.path().join("models"),
            max_parallel,
            queue_file: dir.path().join("data").join("queue.json"),
            history_db: Some(dir.path().join("data").join("history.db")),
            progress_interval: Duration::from_millis(100),
            auth: HostAuth::default(),
        };
        DownloadManager::new(options, transfer, Arc::new(ProgressBroadcaster::new())).unwrap()
    }

    /// 每 30ms 写一个 1KB 的块；收到停止信号后还要过 `stop_delay` 才退出，
    /// 模拟需要等子进程结束的传输
    struct LingeringTransfer {
        chunks: usize,
        stop_delay: Duration,
    }

    #[async_trait]
    impl Transfer for LingeringTransfer {
        fn name(&self) -> &'static str {
            "lingering"
        }

        async fn run(
            &self,
            request: &TransferRequest,
            progress: &dyn TransferProgress,
            cancel: &CancellationToken,
        ) -> Result<TransferOutcome> {
            use tokio::io::AsyncWriteExt;

            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&request.partial_path)
                .await?;
            let mut written = file.metadata().await?.len();
            progress.on_start(written, 0, true);

            for _ in 0..self.chunks {
                if cancel.is_cancelled() {
                    tokio::time::sleep(self.stop_delay).await;
                    return Ok(TransferOutcome::Interrupted);
                }
                file.write_all(&[7u8; 1024]).await?;
                written += 1024;
                progress.on_bytes(written);
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
            file.flush().await?;
            Ok(TransferOutcome::Finished {
                bytes: written,
                total_bytes: 0,
            })
        }
    }

    async fn wait_until<F>(timeout: Duration, mut condition: F)
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        while !condition() {
            assert!(Instant::now() < deadline, "等待条件超时");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_for_status(
        manager: &DownloadManager,
        task_id: &str,
        status: TaskStatus,
    ) -> DownloadTask {
        wait_until(Duration::from_secs(20), || {
            manager
                .get_task(task_id)
                .map(|t| t.status == status)
                .unwrap_or(false)
        })
        .await;
        manager.get_task(task_id).unwrap()
    }

    async fn wait_for_idle(manager: &DownloadManager) {
        let inner = manager.inner.clone();
        wait_until(Duration::from_secs(20), move || {
            inner.state.lock().workers.is_empty()
        })
        .await;
    }

    #[tokio::test]
    async fn test_download_completes_with_hash() {
        let data = test_bytes(300 * 1024);
        let (base, _) = start_server(vec![("model.bin", data.clone())]).await;
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, 2);

        let id = manager
            .enqueue(
                DownloadRequest::new(format!("{}/range/model.bin", base), "model.bin", "checkpoints")
                    .with_hash(sha256_hex(&data).to_uppercase()),
            )
            .await
            .unwrap();

        let task = wait_for_status(&manager, &id, TaskStatus::Completed).await;
        assert_eq!(task.total_bytes, data.len() as u64);
        assert_eq!(task.downloaded_bytes, data.len() as u64);
        assert_eq!(task.progress_percent(), Some(100.0));

        let final_path = dir.path().join("models/checkpoints/model.bin");
        assert_eq!(std::fs::read(&final_path).unwrap(), data.to_vec());
        assert!(!dir.path().join("models/checkpoints/model.bin.partial").exists());

        // 历史记录在状态变更之后写入
        let deadline = Instant::now() + Duration::from_secs(5);
        let history = loop {
            let history = manager.history(10).await.unwrap();
            if !history.is_empty() || Instant::now() > deadline {
                break history;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, id);
        assert_eq!(history[0].status, "completed");
        assert_eq!(history[0].total_size, data.len() as u64);
    }

    #[tokio::test]
    async fn test_priority_order_with_single_slot() {
        let (base, _) = start_server(vec![
            ("blocker.bin", test_bytes(1024 * 1024)),
            ("a.bin", test_bytes(1024)),
            ("b.bin", test_bytes(1024)),
        ])
        .await;
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, 1);
        let (_, mut rx) = manager.subscribe_channel();

        let blocker = manager
            .enqueue(DownloadRequest::new(format!("{}/slow/blocker.bin", base), "blocker.bin", "x"))
            .await
            .unwrap();
        let a = manager
            .enqueue(
                DownloadRequest::new(format!("{}/range/a.bin", base), "a.bin", "x").with_priority(10),
            )
            .await
            .unwrap();
        let b = manager
            .enqueue(
                DownloadRequest::new(format!("{}/range/b.bin", base), "b.bin", "x").with_priority(5),
            )
            .await
            .unwrap();

        let queued: Vec<_> = manager.get_queued_tasks().into_iter().map(|t| t.id).collect();
        assert_eq!(queued, vec![b.clone(), a.clone()]);

        wait_for_status(&manager, &a, TaskStatus::Completed).await;
        wait_for_status(&manager, &b, TaskStatus::Completed).await;
        wait_for_status(&manager, &blocker, TaskStatus::Completed).await;

        let mut started = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let DownloadEvent::StatusChanged { task, .. } = &event.event {
                if task.status == TaskStatus::Downloading {
                    started.push(task.id.clone());
                }
            }
        }
        assert_eq!(started, vec![blocker, b, a]);
    }

    #[tokio::test]
    async fn test_pause_and_resume_continues_with_range() {
        let data = test_bytes(10 * 1024 * 1024);
        let (base, server) = start_server(vec![("big.bin", data.clone())]).await;
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, 1);
        let (_, mut rx) = manager.subscribe_channel();

        let id = manager
            .enqueue(
                DownloadRequest::new(format!("{}/slow/big.bin", base), "big.bin", "loras")
                    .with_hash(sha256_hex(&data)),
            )
            .await
            .unwrap();

        wait_until(Duration::from_secs(20), || {
            manager
                .get_task(&id)
                .map(|t| t.downloaded_bytes >= 4 * 1024 * 1024)
                .unwrap_or(false)
        })
        .await;

        assert!(manager.pause(&id).await);
        assert!(!manager.pause(&id).await);
        wait_for_idle(&manager).await;

        let task = manager.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Paused);
        let partial = dir.path().join("models/loras/big.bin.partial");
        let paused_size = std::fs::metadata(&partial).unwrap().len();
        assert!(paused_size >= 4 * 1024 * 1024);
        assert!(paused_size < data.len() as u64);
        assert!(!dir.path().join("models/loras/big.bin").exists());

        assert!(manager.resume(&id).await);
        let task = wait_for_status(&manager, &id, TaskStatus::Completed).await;
        assert!(task.supports_resume);

        let final_path = dir.path().join("models/loras/big.bin");
        assert_eq!(std::fs::metadata(&final_path).unwrap().len(), data.len() as u64);
        assert_eq!(std::fs::read(&final_path).unwrap(), data.to_vec());

        let expected = format!("bytes={}-", paused_size);
        assert!(server
            .range_log
            .lock()
            .iter()
            .any(|r| r.as_deref() == Some(expected.as_str())));

        // 跨越暂停和续传，推送的已下载字节数从不回退
        let mut reported = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Some(snapshot) = event.event.snapshot() {
                if snapshot.id == id {
                    reported.push(snapshot.downloaded_bytes);
                }
            }
        }
        assert!(reported.len() > 2);
        assert!(reported.windows(2).all(|w| w[0] <= w[1]), "{:?}", reported);
        assert_eq!(reported.last(), Some(&(data.len() as u64)));
    }

    #[tokio::test]
    async fn test_server_ignoring_range_restarts_from_zero() {
        let data = test_bytes(200 * 1024);
        let (base, server) = start_server(vec![("full.bin", data.clone())]).await;
        let dir = TempDir::new().unwrap();

        let target_dir = dir.path().join("models/vae");
        std::fs::create_dir_all(&target_dir).unwrap();
        std::fs::write(target_dir.join("full.bin.partial"), vec![0xFFu8; 1000]).unwrap();

        let manager = test_manager(&dir, 1);
        let id = manager
            .enqueue(
                DownloadRequest::new(format!("{}/norange/full.bin", base), "full.bin", "vae")
                    .with_hash(sha256_hex(&data)),
            )
            .await
            .unwrap();

        let task = wait_for_status(&manager, &id, TaskStatus::Completed).await;
        assert_eq!(task.resume_from, 0);
        assert_eq!(std::fs::read(target_dir.join("full.bin")).unwrap(), data.to_vec());
        assert!(server
            .range_log
            .lock()
            .iter()
            .any(|r| r.as_deref() == Some("bytes=1000-")));
    }

    #[tokio::test]
    async fn test_hash_mismatch_fails_without_final_file() {
        let data = test_bytes(64 * 1024);
        let (base, _) = start_server(vec![("bad.bin", data)]).await;
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, 1);

        let id = manager
            .enqueue(
                DownloadRequest::new(format!("{}/range/bad.bin", base), "bad.bin", "x")
                    .with_hash("0".repeat(64)),
            )
            .await
            .unwrap();

        let task = wait_for_status(&manager, &id, TaskStatus::Failed).await;
        assert!(task.error.unwrap().contains("哈希校验失败"));
        assert!(!dir.path().join("models/x/bad.bin").exists());
        assert!(!dir.path().join("models/x/bad.bin.partial").exists());
    }

    #[tokio::test]
    async fn test_cancel_downloading_removes_partial() {
        let (base, _) = start_server(vec![("big.bin", test_bytes(8 * 1024 * 1024))]).await;
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, 1);

        let id = manager
            .enqueue(DownloadRequest::new(format!("{}/slow/big.bin", base), "big.bin", "x"))
            .await
            .unwrap();
        wait_until(Duration::from_secs(20), || {
            manager
                .get_task(&id)
                .map(|t| t.downloaded_bytes > 0)
                .unwrap_or(false)
        })
        .await;

        assert!(manager.cancel(&id).await);
        assert_eq!(manager.get_task(&id).unwrap().status, TaskStatus::Cancelled);

        let partial = dir.path().join("models/x/big.bin.partial");
        wait_for_idle(&manager).await;
        wait_until(Duration::from_secs(5), || !partial.exists()).await;
        assert!(!dir.path().join("models/x/big.bin").exists());
        assert_eq!(manager.get_task(&id).unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_active_count_never_exceeds_limit() {
        let files: Vec<(String, Bytes)> = (0..6)
            .map(|i| (format!("f{}.bin", i), test_bytes(512 * 1024)))
            .collect();
        let (base, _) = start_server(
            files
                .iter()
                .map(|(name, data)| (name.as_str(), data.clone()))
                .collect(),
        )
        .await;
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, 2);

        let enqueues = files.iter().map(|(name, _)| {
            manager.enqueue(DownloadRequest::new(
                format!("{}/slow/{}", base, name),
                name.as_str(),
                "batch",
            ))
        });
        let ids: Vec<String> = futures::future::join_all(enqueues)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let mut max_seen = 0;
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            max_seen = max_seen.max(manager.active_count());
            let done = ids.iter().all(|id| {
                manager.get_task(id).map(|t| t.status) == Some(TaskStatus::Completed)
            });
            if done {
                break;
            }
            assert!(Instant::now() < deadline, "批量下载超时");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(max_seen <= 2, "active={} 超过上限", max_seen);
        assert!(max_seen >= 1);
    }

    #[tokio::test]
    async fn test_restore_demotes_and_resumes() {
        let data = test_bytes(128 * 1024);
        let (base, _) = start_server(vec![("r.bin", data.clone()), ("p.bin", data.clone())]).await;
        let dir = TempDir::new().unwrap();

        let store = QueueSnapshotStore::new(dir.path().join("data").join("queue.json"));
        let mut running = DownloadTask::new(
            "running".to_string(),
            DownloadRequest::new(format!("{}/range/r.bin", base), "r.bin", "x"),
            3,
        );
        running.status = TaskStatus::Downloading;
        let mut paused = DownloadTask::new(
            "paused".to_string(),
            DownloadRequest::new(format!("{}/range/p.bin", base), "p.bin", "x"),
            4,
        );
        paused.status = TaskStatus::Paused;
        store.save(1, vec![running, paused]).await.unwrap();

        let manager = test_manager(&dir, 1);
        assert_eq!(manager.restore().await.unwrap(), 2);

        wait_for_status(&manager, "running", TaskStatus::Completed).await;
        assert_eq!(manager.get_task("paused").unwrap().status, TaskStatus::Paused);

        // 新任务的序号接在恢复的任务之后
        let id = manager
            .enqueue(DownloadRequest::new(format!("{}/range/p.bin", base), "new.bin", "x"))
            .await
            .unwrap();
        assert!(manager.get_task(&id).unwrap().seq > 4);
    }

    #[tokio::test]
    async fn test_shutdown_keeps_downloading_in_snapshot() {
        let (base, _) = start_server(vec![("big.bin", test_bytes(8 * 1024 * 1024))]).await;
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, 1);

        let id = manager
            .enqueue(DownloadRequest::new(format!("{}/slow/big.bin", base), "big.bin", "x"))
            .await
            .unwrap();
        wait_until(Duration::from_secs(20), || {
            manager
                .get_task(&id)
                .map(|t| t.downloaded_bytes > 0)
                .unwrap_or(false)
        })
        .await;

        manager.shutdown().await;
        assert_eq!(manager.get_task(&id).unwrap().status, TaskStatus::Downloading);
        assert!(dir.path().join("models/x/big.bin.partial").exists());

        let reloaded = QueueSnapshotStore::new(dir.path().join("data").join("queue.json"))
            .load()
            .await
            .unwrap();
        assert_eq!(reloaded.demoted, 1);
        assert_eq!(reloaded.tasks[0].status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_state_transition_guards() {
        let (base, _) = start_server(vec![
            ("blocker.bin", test_bytes(8 * 1024 * 1024)),
            ("q.bin", test_bytes(1024)),
        ])
        .await;
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, 1);

        let blocker = manager
            .enqueue(DownloadRequest::new(format!("{}/slow/blocker.bin", base), "blocker.bin", "x"))
            .await
            .unwrap();
        let queued = manager
            .enqueue(DownloadRequest::new(format!("{}/range/q.bin", base), "q.bin", "x"))
            .await
            .unwrap();

        assert_eq!(manager.get_task(&queued).unwrap().status, TaskStatus::Queued);
        assert!(!manager.pause(&queued).await);
        assert!(!manager.resume(&queued).await);
        assert!(!manager.retry(&queued).await);
        assert!(!manager.remove(&queued).await);
        assert!(!manager.pause("missing").await);

        assert!(manager.cancel(&queued).await);
        assert_eq!(manager.get_task(&queued).unwrap().status, TaskStatus::Cancelled);
        assert!(!manager.cancel(&queued).await);
        assert!(manager.remove(&queued).await);
        assert!(manager.get_task(&queued).is_none());

        assert!(manager.cancel(&blocker).await);
        wait_for_idle(&manager).await;
        assert_eq!(manager.clear_completed().await, 1);
        assert!(manager.get_all_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_validation() {
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, 0);

        assert!(manager
            .enqueue(DownloadRequest::new("ftp://example.com/a.bin", "a.bin", "x"))
            .await
            .is_err());
        assert!(manager
            .enqueue(DownloadRequest::new("not a url", "a.bin", "x"))
            .await
            .is_err());
        assert!(manager
            .enqueue(DownloadRequest::new("https://example.com/a", "a.bin.partial", "x"))
            .await
            .is_err());
        assert!(manager
            .enqueue(DownloadRequest::new("https://example.com/a", "a.bin.partial.aria2", "x"))
            .await
            .is_err());
        assert!(manager.get_all_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_queued_keeps_unrelated_files() {
        let (base, _) = start_server(vec![("blocker.bin", test_bytes(8 * 1024 * 1024))]).await;
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, 1);

        let target_dir = dir.path().join("models/x");
        std::fs::create_dir_all(&target_dir).unwrap();
        let neighbour = target_dir.join("a.bin.partial.aria2");
        std::fs::write(&neighbour, b"someone else's file").unwrap();

        let blocker = manager
            .enqueue(DownloadRequest::new(format!("{}/slow/blocker.bin", base), "blocker.bin", "x"))
            .await
            .unwrap();
        let queued = manager
            .enqueue(DownloadRequest::new(format!("{}/range/a.bin", base), "a.bin", "x"))
            .await
            .unwrap();
        std::fs::write(target_dir.join("a.bin.partial"), b"stale").unwrap();

        assert!(manager.cancel(&queued).await);
        assert!(!target_dir.join("a.bin.partial").exists());
        assert_eq!(std::fs::read(&neighbour).unwrap(), b"someone else's file");

        assert!(manager.cancel(&blocker).await);
        wait_for_idle(&manager).await;
        assert!(neighbour.exists());
    }

    #[tokio::test]
    async fn test_target_held_until_cancelled_worker_exits() {
        let dir = TempDir::new().unwrap();
        let manager = test_manager_with(
            &dir,
            2,
            Arc::new(LingeringTransfer {
                chunks: 20,
                stop_delay: Duration::from_millis(300),
            }),
        );
        let request = || DownloadRequest::new("https://example.com/m.bin", "m.bin", "x");

        let first = manager.enqueue(request()).await.unwrap();
        wait_until(Duration::from_secs(5), || {
            manager
                .get_task(&first)
                .map(|t| t.downloaded_bytes > 0)
                .unwrap_or(false)
        })
        .await;

        assert!(manager.cancel(&first).await);
        assert!(manager.remove(&first).await);

        // 旧 worker 还在退出途中，会删除它的临时文件
        let err = manager.enqueue(request()).await.unwrap_err();
        assert!(err.to_string().contains(&first));

        wait_for_idle(&manager).await;
        let partial = dir.path().join("models/x/m.bin.partial");
        assert!(!partial.exists());

        let second = manager.enqueue(request()).await.unwrap();
        let task = wait_for_status(&manager, &second, TaskStatus::Completed).await;
        assert_eq!(task.downloaded_bytes, 20 * 1024);
        assert_eq!(
            std::fs::metadata(dir.path().join("models/x/m.bin")).unwrap().len(),
            20 * 1024
        );
    }

    #[tokio::test]
    async fn test_retry_refused_while_target_in_use() {
        let (base, _) = start_server(vec![("big.bin", test_bytes(8 * 1024 * 1024))]).await;
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, 2);

        let failed = manager
            .enqueue(DownloadRequest::new(format!("{}/range/missing.bin", base), "big.bin", "x"))
            .await
            .unwrap();
        wait_for_status(&manager, &failed, TaskStatus::Failed).await;
        wait_for_idle(&manager).await;

        let active = manager
            .enqueue(DownloadRequest::new(format!("{}/slow/big.bin", base), "big.bin", "x"))
            .await
            .unwrap();
        assert!(!manager.retry(&failed).await);
        assert_eq!(manager.get_task(&failed).unwrap().status, TaskStatus::Failed);

        assert!(manager.cancel(&active).await);
        wait_for_idle(&manager).await;
        assert!(manager.retry(&failed).await);
    }

    #[tokio::test]
    async fn test_duplicate_target_rejected() {
        let (base, _) = start_server(vec![("big.bin", test_bytes(4 * 1024 * 1024))]).await;
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, 1);

        let first = manager
            .enqueue(DownloadRequest::new(format!("{}/slow/big.bin", base), "big.bin", "x"))
            .await
            .unwrap();
        let err = manager
            .enqueue(DownloadRequest::new(format!("{}/range/big.bin", base), "big.bin", "x/"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains(&first));

        assert!(manager.cancel(&first).await);
        wait_for_idle(&manager).await;
        assert!(manager
            .enqueue(DownloadRequest::new(format!("{}/range/big.bin", base), "big.bin", "x"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_failed_task_can_retry() {
        let (base, _) = start_server(vec![]).await;
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, 1);

        let id = manager
            .enqueue(DownloadRequest::new(format!("{}/range/missing.bin", base), "missing.bin", "x"))
            .await
            .unwrap();
        let task = wait_for_status(&manager, &id, TaskStatus::Failed).await;
        assert!(task.error.unwrap().contains("404"));
        wait_for_idle(&manager).await;

        assert!(manager.retry(&id).await);
        assert!(!manager.retry(&id).await);
        wait_for_status(&manager, &id, TaskStatus::Failed).await;
    }

    #[tokio::test]
    async fn test_set_max_parallel_dispatches_waiting() {
        let (base, _) = start_server(vec![
            ("a.bin", test_bytes(2 * 1024 * 1024)),
            ("b.bin", test_bytes(2 * 1024 * 1024)),
        ])
        .await;
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, 1);

        manager
            .enqueue(DownloadRequest::new(format!("{}/slow/a.bin", base), "a.bin", "x"))
            .await
            .unwrap();
        let b = manager
            .enqueue(DownloadRequest::new(format!("{}/slow/b.bin", base), "b.bin", "x"))
            .await
            .unwrap();
        assert_eq!(manager.get_task(&b).unwrap().status, TaskStatus::Queued);

        manager.set_max_parallel(2);
        assert_eq!(manager.max_parallel(), 2);
        assert_ne!(manager.get_task(&b).unwrap().status, TaskStatus::Queued);

        wait_for_status(&manager, &b, TaskStatus::Completed).await;
    }
}

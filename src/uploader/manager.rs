// 上传管理器
//
// 负责管理多个上传任务：
// - 任务登记与生命周期（创建/启动/取消/重试/删除/重命名）
// - 文件级并发控制与等待队列
// - 聚合进度与事件广播
//
// 任务之间相互隔离：单个任务的失败或取消不会波及其他任务

use crate::common::format_size;
use crate::config::UploadConfig;
use crate::events::{EventBus, TimestampedEvent, UploadEvent};
use crate::storage::{StorageApi, TransportKind};
use crate::uploader::{
    run_pool, transport_for, EngineOptions, PartTransport, ProgressState, UploadEngine,
    UploadTask, UploadTaskStatus,
};
use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 默认文件级并发数
pub const DEFAULT_FILE_CONCURRENCY: usize = 3;

/// 并发参数下限
const MIN_CONCURRENCY: usize = 1;

/// 并发参数上限
const MAX_CONCURRENCY: usize = 10;

/// 等待队列巡检间隔（秒）
const QUEUE_MONITOR_INTERVAL_SECS: u64 = 3;

/// 并发参数统一限制在 1-10
fn clamp_concurrency(value: usize) -> usize {
    value.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
}

/// 根据扩展名推断内容类型，未知时回退为二进制流
fn guess_content_type(file_name: &str) -> String {
    let ext = file_name
        .rsplit('.')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    let mime = match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "json" => "application/json",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    };
    mime.to_string()
}

/// 上传任务信息（管理器内部登记项）
#[derive(Clone)]
pub struct UploadTaskInfo {
    /// 任务
    pub task: Arc<Mutex<UploadTask>>,
    /// 分片级字节进度
    pub progress: Arc<ProgressState>,
    /// 取消令牌（用户重试时换新）
    pub cancel_token: CancellationToken,
}

/// 上传管理器
pub struct UploadManager {
    /// 存储 API
    api: Arc<dyn StorageApi>,
    /// 分片传输策略（每个管理器实例创建一次）
    transport: Arc<dyn PartTransport>,
    /// 所有任务（task_id -> TaskInfo）
    tasks: Arc<DashMap<String, UploadTaskInfo>>,
    /// 等待队列（task_id 列表，FIFO）
    waiting_queue: Arc<RwLock<VecDeque<String>>>,
    /// 已派发未结束的任务数
    running: Arc<AtomicUsize>,
    /// 最大同时上传文件数（动态可调整）
    file_concurrency: Arc<AtomicUsize>,
    /// 单文件分片级并发上限（动态可调整）
    chunk_concurrency: Arc<AtomicUsize>,
    /// 单分片最大重试次数（动态可调整）
    max_retries: Arc<AtomicUsize>,
    /// 简单上传阈值
    simple_upload_threshold: u64,
    /// 进度事件节流间隔（毫秒）
    progress_interval_ms: u64,
    /// 事件总线
    events: Arc<EventBus>,
    /// 自引用，供后台任务回调管理器方法
    self_weak: Weak<UploadManager>,
}

impl UploadManager {
    /// 创建新的上传管理器（使用默认配置）
    pub fn new(api: Arc<dyn StorageApi>, transport_kind: TransportKind) -> Arc<Self> {
        Self::with_config(api, transport_kind, &UploadConfig::default())
    }

    /// 创建上传管理器（从配置读取参数）
    ///
    /// # 参数
    /// * `api` - 存储 API
    /// * `transport_kind` - 分片传输策略
    /// * `config` - 上传配置
    pub fn with_config(
        api: Arc<dyn StorageApi>,
        transport_kind: TransportKind,
        config: &UploadConfig,
    ) -> Arc<Self> {
        let file_concurrency = clamp_concurrency(config.file_concurrency);
        let chunk_concurrency = clamp_concurrency(config.chunk_concurrency);

        info!(
            "上传管理器就绪: 传输策略={:?}, 文件并发={}, 分片并发={}, 最大重试={}",
            transport_kind, file_concurrency, chunk_concurrency, config.max_retries
        );

        let transport = transport_for(transport_kind, api.clone());

        let manager = Arc::new_cyclic(|weak| Self {
            api,
            transport,
            tasks: Arc::new(DashMap::new()),
            waiting_queue: Arc::new(RwLock::new(VecDeque::new())),
            running: Arc::new(AtomicUsize::new(0)),
            file_concurrency: Arc::new(AtomicUsize::new(file_concurrency)),
            chunk_concurrency: Arc::new(AtomicUsize::new(chunk_concurrency)),
            max_retries: Arc::new(AtomicUsize::new(config.max_retries as usize)),
            simple_upload_threshold: config.simple_upload_threshold,
            progress_interval_ms: config.progress_interval_ms,
            events: Arc::new(EventBus::default()),
            self_weak: weak.clone(),
        });

        // 后台巡检：活跃任务自然结束后接续等待队列
        Self::start_waiting_queue_monitor(&manager);

        manager
    }

    /// 动态调整文件级并发数（限制在 1-10）
    pub fn update_file_concurrency(&self, new_max: usize) {
        let clamped = clamp_concurrency(new_max);
        self.file_concurrency.store(clamped, Ordering::SeqCst);
        info!("上传管理器: 动态调整文件级并发数为 {}", clamped);
    }

    /// 动态调整分片级并发数（限制在 1-10），对已在上传的任务不生效
    pub fn update_chunk_concurrency(&self, new_max: usize) {
        let clamped = clamp_concurrency(new_max);
        self.chunk_concurrency.store(clamped, Ordering::SeqCst);
        info!("上传管理器: 动态调整分片级并发数为 {}", clamped);
    }

    /// 动态调整最大重试次数
    pub fn update_max_retries(&self, new_max: u32) {
        self.max_retries.store(new_max as usize, Ordering::SeqCst);
        info!("上传管理器: 动态调整最大重试次数为 {}", new_max);
    }

    /// 当前文件级并发数
    pub fn file_concurrency(&self) -> usize {
        self.file_concurrency.load(Ordering::SeqCst)
    }

    /// 当前分片级并发数
    pub fn chunk_concurrency(&self) -> usize {
        self.chunk_concurrency.load(Ordering::SeqCst)
    }

    /// 当前最大重试次数
    pub fn max_retries(&self) -> u32 {
        self.max_retries.load(Ordering::SeqCst) as u32
    }

    /// 当前活跃（已派发未结束）的任务数
    pub fn active_task_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// 等待队列长度
    pub async fn waiting_count(&self) -> usize {
        self.waiting_queue.read().await.len()
    }

    /// 订阅上传事件
    pub fn subscribe(&self) -> broadcast::Receiver<TimestampedEvent> {
        self.events.subscribe()
    }

    /// 事件总线引用
    pub fn event_bus(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// 创建上传任务
    ///
    /// # 参数
    /// * `local_path` - 本地文件路径
    /// * `file_name` - 远端文件名，缺省时取本地文件名
    ///
    /// # 返回
    /// 任务ID（UUID，创建后不随改名变化）
    pub async fn create_task(
        &self,
        local_path: PathBuf,
        file_name: Option<String>,
    ) -> Result<String> {
        let metadata = tokio::fs::metadata(&local_path)
            .await
            .context(format!("无法获取文件元数据: {:?}", local_path))?;

        if metadata.is_dir() {
            return Err(anyhow::anyhow!("不支持上传目录"));
        }

        let file_size = metadata.len();

        let file_name = match file_name {
            Some(name) => name,
            None => local_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "unnamed".to_string()),
        };

        let content_type = guess_content_type(&file_name);

        let task = UploadTask::new(
            local_path.clone(),
            file_name.clone(),
            file_size,
            content_type,
        );
        let task_id = task.id.clone();

        info!(
            "创建上传任务: id={}, local={:?}, name={}, size={}",
            task_id,
            local_path,
            file_name,
            format_size(file_size)
        );

        let task_info = UploadTaskInfo {
            task: Arc::new(Mutex::new(task)),
            progress: Arc::new(ProgressState::new(file_size)),
            cancel_token: CancellationToken::new(),
        };

        self.tasks.insert(task_id.clone(), task_info);

        self.events.publish(UploadEvent::Created {
            task_id: task_id.clone(),
            file_name,
            total_size: file_size,
        });

        Ok(task_id)
    }

    /// 批量创建上传任务
    pub async fn create_batch_tasks(
        &self,
        files: Vec<(PathBuf, Option<String>)>,
    ) -> Result<Vec<String>> {
        let mut task_ids = Vec::with_capacity(files.len());

        for (local_path, file_name) in files {
            match self.create_task(local_path.clone(), file_name).await {
                Ok(task_id) => task_ids.push(task_id),
                Err(e) => {
                    warn!("创建任务失败: {:?}, 错误: {}", local_path, e);
                }
            }
        }

        Ok(task_ids)
    }

    /// 开始上传任务
    ///
    /// 文件级并发已满时进入等待队列，有空位后自动启动
    pub async fn start_task(&self, task_id: &str) -> Result<()> {
        let task_info = self.task_info(task_id)?;

        // 状态检查与派发标记在同一把任务锁内完成，杜绝双重派发
        {
            let mut task = task_info.task.lock().await;
            match task.status {
                UploadTaskStatus::Pending => {}
                UploadTaskStatus::Uploading => {
                    return Err(anyhow::anyhow!("任务已在上传中"));
                }
                UploadTaskStatus::Completed => {
                    return Err(anyhow::anyhow!("任务已完成"));
                }
                UploadTaskStatus::Failed | UploadTaskStatus::Cancelled => {
                    return Err(anyhow::anyhow!("任务已结束，重新上传请调用 retry_task"));
                }
            }

            // 文件级并发已满则排队
            if !self.try_acquire_slot() {
                drop(task);
                self.enqueue_waiting(task_id).await;
                return Ok(());
            }

            let old = task.status;
            task.mark_uploading();
            self.events.publish(UploadEvent::StatusChanged {
                task_id: task_id.to_string(),
                old_status: old.as_str().to_string(),
                new_status: task.status.as_str().to_string(),
            });
        }

        // 排队中的任务此刻真正派发，移出队列
        {
            let mut queue = self.waiting_queue.write().await;
            queue.retain(|id| id != task_id);
        }

        self.spawn_engine(task_id, &task_info);

        Ok(())
    }

    /// 开始所有待处理的任务
    ///
    /// 待处理集合按创建顺序经任务池以文件级并发上限派发，全部结束后返回；
    /// 单个文件的失败折叠进其任务状态，不会中断其余文件的派发
    pub async fn start_all_pending(&self) -> Result<usize> {
        let handles: Vec<(String, Arc<Mutex<UploadTask>>)> = self
            .tasks
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().task.clone()))
            .collect();

        let mut pending: Vec<(i64, String)> = Vec::new();
        for (task_id, handle) in handles {
            let task = handle.lock().await;
            if matches!(task.status, UploadTaskStatus::Pending) {
                pending.push((task.created_at, task_id));
            }
        }
        pending.sort_by_key(|(created_at, _)| *created_at);

        if pending.is_empty() {
            return Ok(0);
        }

        let manager = self
            .self_weak
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("上传管理器已销毁"))?;

        let total = pending.len();
        let thunks: Vec<BoxFuture<'static, Result<()>>> = pending
            .into_iter()
            .map(|(_, task_id)| {
                let manager = manager.clone();
                async move {
                    manager.dispatch_pending(&task_id).await;
                    Ok(())
                }
                .boxed()
            })
            .collect();

        info!("批量派发 {} 个待处理任务", total);
        run_pool(thunks, self.file_concurrency()).await?;
        Ok(total)
    }

    /// 取消上传任务
    ///
    /// 取消是独立终态：不会标记为失败，在途分片不再重试
    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        // 从等待队列移除（如果存在）
        {
            let mut queue = self.waiting_queue.write().await;
            queue.retain(|id| id != task_id);
        }

        let task_info = self.task_info(task_id)?;

        // 发送取消信号，在途的引擎会自行收尾并尽力通知远端中止
        task_info.cancel_token.cancel();

        // 未派发的任务不会经过引擎，这里直接落取消态
        {
            let mut task = task_info.task.lock().await;
            if task.status == UploadTaskStatus::Pending {
                let old = task.status;
                task.mark_cancelled();
                self.events.publish(UploadEvent::StatusChanged {
                    task_id: task_id.to_string(),
                    old_status: old.as_str().to_string(),
                    new_status: task.status.as_str().to_string(),
                });
                self.events.publish(UploadEvent::Cancelled {
                    task_id: task_id.to_string(),
                });
            }
        }

        info!("取消上传任务: {}", task_id);
        Ok(())
    }

    /// 重试已失败或已取消的任务
    ///
    /// 重置任务与进度，换发新的取消令牌，重新进入排队流程
    pub async fn retry_task(&self, task_id: &str) -> Result<()> {
        let task_info = self.task_info(task_id)?;

        {
            let mut task = task_info.task.lock().await;
            match task.status {
                UploadTaskStatus::Failed | UploadTaskStatus::Cancelled => {}
                _ => return Err(anyhow::anyhow!("只有失败或已取消的任务可以重试")),
            }
            task.reset_for_retry();
        }

        task_info.progress.clear();

        // 旧令牌可能已触发，重试必须换新
        if let Some(mut entry) = self.tasks.get_mut(task_id) {
            entry.cancel_token = CancellationToken::new();
        }

        info!("重试上传任务: {}", task_id);
        self.start_task(task_id).await
    }

    /// 重命名任务的远端文件名，返回旧名
    ///
    /// 终态任务不可重命名；已进入上传的任务远端名称已定格，改名只影响展示
    pub async fn rename_task(&self, task_id: &str, new_name: String) -> Result<String> {
        if new_name.trim().is_empty() {
            return Err(anyhow::anyhow!("文件名不能为空"));
        }

        let task_info = self.task_info(task_id)?;

        let old_name = {
            let mut task = task_info.task.lock().await;
            if task.is_terminal() {
                return Err(anyhow::anyhow!("任务已结束，无法重命名"));
            }
            task.rename(new_name.clone())
        };

        info!(
            "重命名上传任务: {} ({} -> {})",
            task_id, old_name, new_name
        );

        self.events.publish(UploadEvent::Renamed {
            task_id: task_id.to_string(),
            old_name: old_name.clone(),
            new_name,
        });

        Ok(old_name)
    }

    /// 删除上传任务（在途任务先取消）
    pub async fn remove_task(&self, task_id: &str) -> Result<()> {
        {
            let mut queue = self.waiting_queue.write().await;
            queue.retain(|id| id != task_id);
        }

        if let Some(entry) = self.tasks.get(task_id) {
            entry.cancel_token.cancel();
        }

        self.tasks
            .remove(task_id)
            .ok_or_else(|| anyhow::anyhow!("任务不存在: {}", task_id))?;

        info!("删除上传任务: {}", task_id);

        self.events.publish(UploadEvent::Deleted {
            task_id: task_id.to_string(),
        });

        Ok(())
    }

    /// 获取任务快照
    pub async fn get_task(&self, task_id: &str) -> Option<UploadTask> {
        let handle = {
            let entry = self.tasks.get(task_id)?;
            entry.value().task.clone()
        };
        let task = handle.lock().await;
        Some(task.clone())
    }

    /// 获取所有任务快照（按创建时间倒序）
    pub async fn get_all_tasks(&self) -> Vec<UploadTask> {
        let handles: Vec<Arc<Mutex<UploadTask>>> = self
            .tasks
            .iter()
            .map(|entry| entry.value().task.clone())
            .collect();

        let mut tasks = Vec::with_capacity(handles.len());
        for handle in handles {
            let task = handle.lock().await;
            tasks.push(task.clone());
        }

        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    /// 清除已完成的任务
    pub async fn clear_completed(&self) -> usize {
        let removed = self
            .remove_tasks_by(|status| status == UploadTaskStatus::Completed)
            .await;
        info!("清除了 {} 个已完成的上传任务", removed);
        removed
    }

    /// 清除失败与已取消的任务
    pub async fn clear_failed(&self) -> usize {
        let removed = self
            .remove_tasks_by(|status| {
                matches!(status, UploadTaskStatus::Failed | UploadTaskStatus::Cancelled)
            })
            .await;
        info!("清除了 {} 个失败或已取消的上传任务", removed);
        removed
    }

    async fn remove_tasks_by(&self, should_remove: impl Fn(UploadTaskStatus) -> bool) -> usize {
        let handles: Vec<(String, Arc<Mutex<UploadTask>>)> = self
            .tasks
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().task.clone()))
            .collect();

        let mut to_remove = Vec::new();
        for (task_id, handle) in handles {
            let task = handle.lock().await;
            if should_remove(task.status) {
                to_remove.push(task_id);
            }
        }

        for task_id in &to_remove {
            self.tasks.remove(task_id);
            self.events.publish(UploadEvent::Deleted {
                task_id: task_id.clone(),
            });
        }

        to_remove.len()
    }

    fn task_info(&self, task_id: &str) -> Result<UploadTaskInfo> {
        self.tasks
            .get(task_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow::anyhow!("任务不存在: {}", task_id))
    }

    /// 抢占一个文件级并发名额
    fn try_acquire_slot(&self) -> bool {
        let limit = self.file_concurrency();
        let mut current = self.running.load(Ordering::SeqCst);
        loop {
            if current >= limit {
                return false;
            }
            match self.running.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// 任务进入等待队列（去重入队并广播事件）
    async fn enqueue_waiting(&self, task_id: &str) {
        {
            let mut queue = self.waiting_queue.write().await;
            if !queue.iter().any(|id| id == task_id) {
                queue.push_back(task_id.to_string());
            }
        }

        info!(
            "上传任务 {} 加入等待队列 (活跃任务数已达上限: {})",
            task_id,
            self.file_concurrency()
        );
        self.events.publish(UploadEvent::Waiting {
            task_id: task_id.to_string(),
        });
    }

    /// 批量派发路径：当场获得名额则就地运行引擎，否则进入等待队列
    ///
    /// 引擎的结果只折叠进任务状态，本函数从不失败，
    /// 因此批量任务池不会因单个文件出错而停止派发
    async fn dispatch_pending(&self, task_id: &str) {
        // 快照期间任务可能已被删除、单独启动或取消
        let task_info = match self.task_info(task_id) {
            Ok(info) => info,
            Err(_) => return,
        };

        {
            let mut task = task_info.task.lock().await;
            if task.status != UploadTaskStatus::Pending {
                return;
            }

            if !self.try_acquire_slot() {
                drop(task);
                self.enqueue_waiting(task_id).await;
                return;
            }

            let old = task.status;
            task.mark_uploading();
            self.events.publish(UploadEvent::StatusChanged {
                task_id: task_id.to_string(),
                old_status: old.as_str().to_string(),
                new_status: task.status.as_str().to_string(),
            });
        }

        {
            let mut queue = self.waiting_queue.write().await;
            queue.retain(|id| id != task_id);
        }

        self.engine_future(task_id.to_string(), task_info).await;
    }

    /// 派发一个已获得并发名额的任务（后台运行）
    fn spawn_engine(&self, task_id: &str, task_info: &UploadTaskInfo) {
        tokio::spawn(self.engine_future(task_id.to_string(), task_info.clone()));
    }

    /// 构造引擎运行过程：跑完整个上传、释放名额、接续等待队列
    ///
    /// 调用方必须已通过 `try_acquire_slot` 获得名额
    fn engine_future(
        &self,
        task_id: String,
        task_info: UploadTaskInfo,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let api = self.api.clone();
        let transport = self.transport.clone();
        let events = self.events.clone();
        let running = self.running.clone();
        let manager = self.self_weak.clone();

        let options = EngineOptions {
            chunk_concurrency: self.chunk_concurrency(),
            max_retries: self.max_retries(),
            simple_upload_threshold: self.simple_upload_threshold,
            progress_interval_ms: self.progress_interval_ms,
        };

        async move {
            info!("开始上传任务: {}", task_id);

            let engine = UploadEngine::with_options(
                api,
                transport,
                task_info.task,
                task_info.progress,
                events,
                task_info.cancel_token,
                options,
            );

            // 单个任务的结果只影响自身
            match engine.run().await {
                Ok(()) => info!("上传任务完成: {}", task_id),
                Err(e) if e.is_cancelled() => info!("上传任务已取消: {}", task_id),
                Err(e) => error!("上传任务失败: {}, 错误: {}", task_id, e),
            }

            running.fetch_sub(1, Ordering::SeqCst);

            // 名额释放后立即接续等待中的任务
            if let Some(manager) = manager.upgrade() {
                manager.try_start_waiting_tasks().await;
            }
        }
    }

    /// 尝试从等待队列启动任务（有空位时依次出队）
    async fn try_start_waiting_tasks(&self) {
        loop {
            if self.active_task_count() >= self.file_concurrency() {
                break;
            }

            let task_id = {
                let mut queue = self.waiting_queue.write().await;
                queue.pop_front()
            };

            match task_id {
                Some(id) => {
                    info!("从等待队列启动上传任务: {}", id);
                    if let Err(e) = self.start_task(&id).await {
                        error!("启动等待上传任务失败: {}, 错误: {}", id, e);
                    }
                }
                None => break,
            }
        }
    }

    /// 启动后台监控任务：定期检查并启动等待队列中的任务
    fn start_waiting_queue_monitor(manager: &Arc<Self>) {
        let weak = Arc::downgrade(manager);

        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(QUEUE_MONITOR_INTERVAL_SECS));

            loop {
                interval.tick().await;

                let manager = match weak.upgrade() {
                    Some(m) => m,
                    None => break,
                };

                let has_waiting = {
                    let queue = manager.waiting_queue.read().await;
                    !queue.is_empty()
                };

                if has_waiting {
                    manager.try_start_waiting_tasks().await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CompletedPart, ProgressFn};
    use parking_lot::Mutex as SyncMutex;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use tempfile::{NamedTempFile, TempDir};

    /// 记录调用并可编排失败的远端桩
    struct StubApi {
        initiate_names: SyncMutex<Vec<String>>,
        complete_names: SyncMutex<Vec<String>>,
        fail_keys: SyncMutex<Vec<String>>,
        chunk_delay_ms: u64,
        abort_count: AtomicUsize,
        in_flight: AtomicUsize,
        high_water: AtomicUsize,
    }

    impl StubApi {
        fn new() -> Self {
            Self {
                initiate_names: SyncMutex::new(Vec::new()),
                complete_names: SyncMutex::new(Vec::new()),
                fail_keys: SyncMutex::new(Vec::new()),
                chunk_delay_ms: 0,
                abort_count: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl StorageApi for StubApi {
        async fn initiate(&self, filename: &str, _content_type: &str) -> Result<(String, String)> {
            self.initiate_names.lock().push(filename.to_string());
            // initiate 到 complete/abort 之间算一个在途文件
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.high_water.fetch_max(current, Ordering::SeqCst);
            Ok((
                format!("upload-{}", filename),
                format!("objects/{}", filename),
            ))
        }

        async fn presign(&self, _upload_id: &str, _key: &str, part_number: u32) -> Result<String> {
            Ok(format!("https://signed.example/{}", part_number))
        }

        async fn put_part(
            &self,
            _url: &str,
            part_number: u32,
            _data: Vec<u8>,
            _progress: Option<ProgressFn>,
        ) -> Result<String> {
            Ok(format!("etag-{}", part_number))
        }

        async fn upload_chunk(
            &self,
            _upload_id: &str,
            key: &str,
            part_number: u32,
            data: Vec<u8>,
            progress: Option<ProgressFn>,
        ) -> Result<String> {
            if self.chunk_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.chunk_delay_ms)).await;
            }
            if self.fail_keys.lock().iter().any(|k| key.contains(k.as_str())) {
                anyhow::bail!("服务器拒绝分片");
            }
            if let Some(cb) = progress {
                cb(data.len() as u64);
            }
            Ok(format!("etag-{}", part_number))
        }

        async fn complete(
            &self,
            _upload_id: &str,
            _key: &str,
            _parts: Vec<CompletedPart>,
            filename: &str,
            _size: u64,
            _content_type: &str,
        ) -> Result<()> {
            self.complete_names.lock().push(filename.to_string());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        async fn abort(&self, _upload_id: &str) -> Result<()> {
            self.abort_count.fetch_add(1, Ordering::SeqCst);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        async fn simple_upload(
            &self,
            _filename: &str,
            _content_type: &str,
            _data: Vec<u8>,
            _progress: Option<ProgressFn>,
        ) -> Result<()> {
            Ok(())
        }

        async fn wake_worker(&self) -> Result<()> {
            Ok(())
        }
    }

    fn test_config(file_concurrency: usize) -> UploadConfig {
        UploadConfig {
            file_concurrency,
            chunk_concurrency: 3,
            // 阈值压到 1KB，让小测试文件也走多分片接口
            simple_upload_threshold: 1024,
            max_retries: 0,
            progress_interval_ms: 10,
        }
    }

    fn build_manager(api: Arc<StubApi>, file_concurrency: usize) -> Arc<UploadManager> {
        UploadManager::with_config(
            api,
            TransportKind::ServerProxied,
            &test_config(file_concurrency),
        )
    }

    fn write_temp_file(size: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![7u8; size]).unwrap();
        file.flush().unwrap();
        file
    }

    async fn wait_for_status(
        manager: &Arc<UploadManager>,
        task_id: &str,
        status: UploadTaskStatus,
        timeout_ms: u64,
    ) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        while Instant::now() < deadline {
            if let Some(task) = manager.get_task(task_id).await {
                if task.status == status {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[test]
    fn test_guess_content_type() {
        assert_eq!(guess_content_type("photo.JPG"), "image/jpeg");
        assert_eq!(guess_content_type("notes.md"), "text/markdown");
        assert_eq!(guess_content_type("archive"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_create_task() {
        let manager = build_manager(Arc::new(StubApi::new()), 3);
        let file = write_temp_file(64 * 1024);

        let task_id = manager
            .create_task(file.path().to_path_buf(), Some("demo.txt".to_string()))
            .await
            .unwrap();

        let task = manager.get_task(&task_id).await.unwrap();
        assert_eq!(task.status, UploadTaskStatus::Pending);
        assert_eq!(task.total_size, 64 * 1024);
        assert_eq!(task.file_name, "demo.txt");
        assert_eq!(task.content_type, "text/plain");
    }

    #[tokio::test]
    async fn test_create_task_rejects_directory() {
        let manager = build_manager(Arc::new(StubApi::new()), 3);
        let dir = TempDir::new().unwrap();

        let result = manager.create_task(dir.path().to_path_buf(), None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_create_batch_tasks() {
        let manager = build_manager(Arc::new(StubApi::new()), 3);
        let files: Vec<NamedTempFile> = (0..3).map(|_| write_temp_file(1024)).collect();
        let entries: Vec<(PathBuf, Option<String>)> = files
            .iter()
            .enumerate()
            .map(|(i, f)| (f.path().to_path_buf(), Some(format!("file{}.txt", i))))
            .collect();

        let ids = manager.create_batch_tasks(entries).await.unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(manager.get_all_tasks().await.len(), 3);
    }

    #[tokio::test]
    async fn test_start_task_runs_to_completion() {
        let api = Arc::new(StubApi::new());
        let manager = build_manager(api.clone(), 3);
        let file = write_temp_file(64 * 1024);

        let task_id = manager
            .create_task(file.path().to_path_buf(), Some("photo.png".to_string()))
            .await
            .unwrap();
        manager.start_task(&task_id).await.unwrap();

        assert!(wait_for_status(&manager, &task_id, UploadTaskStatus::Completed, 3000).await);
        assert_eq!(api.initiate_names.lock().clone(), vec!["photo.png".to_string()]);
        assert_eq!(api.complete_names.lock().clone(), vec!["photo.png".to_string()]);
    }

    #[tokio::test]
    async fn test_file_concurrency_queueing() {
        let api = Arc::new(StubApi {
            chunk_delay_ms: 200,
            ..StubApi::new()
        });
        let manager = build_manager(api, 1);

        let file_a = write_temp_file(64 * 1024);
        let file_b = write_temp_file(64 * 1024);
        let id_a = manager
            .create_task(file_a.path().to_path_buf(), Some("a.bin".to_string()))
            .await
            .unwrap();
        let id_b = manager
            .create_task(file_b.path().to_path_buf(), Some("b.bin".to_string()))
            .await
            .unwrap();

        let mut rx = manager.subscribe();

        manager.start_task(&id_a).await.unwrap();
        manager.start_task(&id_b).await.unwrap();

        // 第二个任务进入等待队列
        assert_eq!(manager.active_task_count(), 1);
        assert_eq!(manager.waiting_count().await, 1);

        // 第一个完成后，等待中的任务自动接续
        assert!(wait_for_status(&manager, &id_a, UploadTaskStatus::Completed, 3000).await);
        assert!(wait_for_status(&manager, &id_b, UploadTaskStatus::Completed, 3000).await);

        let mut saw_waiting = false;
        while let Ok(event) = rx.try_recv() {
            if event.event.event_type_name() == "waiting" {
                saw_waiting = true;
            }
        }
        assert!(saw_waiting);
    }

    #[tokio::test]
    async fn test_start_all_pending_bounded_batch() {
        let api = Arc::new(StubApi {
            chunk_delay_ms: 80,
            ..StubApi::new()
        });
        let manager = build_manager(api.clone(), 2);

        let files: Vec<NamedTempFile> = (0..5).map(|_| write_temp_file(64 * 1024)).collect();
        for (i, f) in files.iter().enumerate() {
            manager
                .create_task(f.path().to_path_buf(), Some(format!("batch{}.bin", i)))
                .await
                .unwrap();
        }

        // 全部结束后才返回
        let dispatched = manager.start_all_pending().await.unwrap();
        assert_eq!(dispatched, 5);

        for task in manager.get_all_tasks().await {
            assert_eq!(task.status, UploadTaskStatus::Completed);
        }
        assert_eq!(api.complete_names.lock().len(), 5);
        // 文件级在途数不超过并发上限
        assert!(api.high_water.load(Ordering::SeqCst) <= 2);
        assert_eq!(manager.active_task_count(), 0);
    }

    #[tokio::test]
    async fn test_start_all_pending_isolates_failures() {
        let api = Arc::new(StubApi::new());
        api.fail_keys.lock().push("doomed".to_string());
        let manager = build_manager(api.clone(), 2);

        let ok_a = write_temp_file(64 * 1024);
        let bad = write_temp_file(64 * 1024);
        let ok_b = write_temp_file(64 * 1024);
        let id_a = manager
            .create_task(ok_a.path().to_path_buf(), Some("ok-a.bin".to_string()))
            .await
            .unwrap();
        let id_bad = manager
            .create_task(bad.path().to_path_buf(), Some("doomed.bin".to_string()))
            .await
            .unwrap();
        let id_b = manager
            .create_task(ok_b.path().to_path_buf(), Some("ok-b.bin".to_string()))
            .await
            .unwrap();

        // 单个文件失败折叠进任务状态，批量派发本身不报错
        let dispatched = manager.start_all_pending().await.unwrap();
        assert_eq!(dispatched, 3);

        let failed = manager.get_task(&id_bad).await.unwrap();
        assert_eq!(failed.status, UploadTaskStatus::Failed);
        assert!(failed.error.is_some());

        for id in [&id_a, &id_b] {
            let task = manager.get_task(id).await.unwrap();
            assert_eq!(task.status, UploadTaskStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_cancel_pending_task_direct() {
        let manager = build_manager(Arc::new(StubApi::new()), 3);
        let file = write_temp_file(2048);
        let task_id = manager
            .create_task(file.path().to_path_buf(), None)
            .await
            .unwrap();

        manager.cancel_task(&task_id).await.unwrap();

        let task = manager.get_task(&task_id).await.unwrap();
        assert_eq!(task.status, UploadTaskStatus::Cancelled);
        assert!(task.error.is_none());
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let api = Arc::new(StubApi {
            chunk_delay_ms: 300,
            ..StubApi::new()
        });
        let manager = build_manager(api.clone(), 3);
        let file = write_temp_file(64 * 1024);
        let task_id = manager
            .create_task(file.path().to_path_buf(), Some("big.bin".to_string()))
            .await
            .unwrap();

        manager.start_task(&task_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.cancel_task(&task_id).await.unwrap();

        assert!(wait_for_status(&manager, &task_id, UploadTaskStatus::Cancelled, 3000).await);
        // 已建立的会话尽力中止，绝不合并
        assert_eq!(api.abort_count.load(Ordering::SeqCst), 1);
        assert!(api.complete_names.lock().is_empty());
    }

    #[tokio::test]
    async fn test_retry_after_failure() {
        let api = Arc::new(StubApi::new());
        api.fail_keys.lock().push("flaky.bin".to_string());
        let manager = build_manager(api.clone(), 3);

        let file = write_temp_file(64 * 1024);
        let task_id = manager
            .create_task(file.path().to_path_buf(), Some("flaky.bin".to_string()))
            .await
            .unwrap();
        manager.start_task(&task_id).await.unwrap();
        assert!(wait_for_status(&manager, &task_id, UploadTaskStatus::Failed, 3000).await);

        // 故障排除后，用户重试从头再来
        api.fail_keys.lock().clear();
        manager.retry_task(&task_id).await.unwrap();
        assert!(wait_for_status(&manager, &task_id, UploadTaskStatus::Completed, 3000).await);

        let task = manager.get_task(&task_id).await.unwrap();
        assert!(task.error.is_none());
        assert_eq!(task.uploaded_size, 64 * 1024);
    }

    #[tokio::test]
    async fn test_sibling_failure_isolated() {
        let api = Arc::new(StubApi::new());
        api.fail_keys.lock().push("doomed.bin".to_string());
        let manager = build_manager(api.clone(), 3);

        let good = write_temp_file(64 * 1024);
        let bad = write_temp_file(64 * 1024);
        let good_id = manager
            .create_task(good.path().to_path_buf(), Some("fine.bin".to_string()))
            .await
            .unwrap();
        let bad_id = manager
            .create_task(bad.path().to_path_buf(), Some("doomed.bin".to_string()))
            .await
            .unwrap();

        manager.start_task(&good_id).await.unwrap();
        manager.start_task(&bad_id).await.unwrap();

        // 一个任务失败不影响其他任务
        assert!(wait_for_status(&manager, &bad_id, UploadTaskStatus::Failed, 3000).await);
        assert!(wait_for_status(&manager, &good_id, UploadTaskStatus::Completed, 3000).await);
    }

    #[tokio::test]
    async fn test_rename_before_start_changes_remote_name() {
        let api = Arc::new(StubApi::new());
        let manager = build_manager(api.clone(), 3);
        let file = write_temp_file(64 * 1024);

        let task_id = manager
            .create_task(file.path().to_path_buf(), Some("draft.bin".to_string()))
            .await
            .unwrap();
        let old = manager
            .rename_task(&task_id, "final.bin".to_string())
            .await
            .unwrap();
        assert_eq!(old, "draft.bin");

        // 任务 ID 不因重命名变化
        let task = manager.get_task(&task_id).await.unwrap();
        assert_eq!(task.id, task_id);
        assert_eq!(task.file_name, "final.bin");

        manager.start_task(&task_id).await.unwrap();
        assert!(wait_for_status(&manager, &task_id, UploadTaskStatus::Completed, 3000).await);
        assert_eq!(api.initiate_names.lock().clone(), vec!["final.bin".to_string()]);
    }

    #[tokio::test]
    async fn test_rename_after_start_keeps_remote_name() {
        let api = Arc::new(StubApi {
            chunk_delay_ms: 250,
            ..StubApi::new()
        });
        let manager = build_manager(api.clone(), 3);
        let file = write_temp_file(64 * 1024);

        let task_id = manager
            .create_task(file.path().to_path_buf(), Some("before.bin".to_string()))
            .await
            .unwrap();
        manager.start_task(&task_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // 上传期间改名只影响展示，远端沿用开始时的名字
        manager
            .rename_task(&task_id, "after.bin".to_string())
            .await
            .unwrap();

        assert!(wait_for_status(&manager, &task_id, UploadTaskStatus::Completed, 3000).await);
        assert_eq!(
            api.initiate_names.lock().clone(),
            vec!["before.bin".to_string()]
        );
        assert_eq!(
            api.complete_names.lock().clone(),
            vec!["before.bin".to_string()]
        );
        assert_eq!(
            manager.get_task(&task_id).await.unwrap().file_name,
            "after.bin"
        );
    }

    #[tokio::test]
    async fn test_remove_task() {
        let manager = build_manager(Arc::new(StubApi::new()), 3);
        let file = write_temp_file(2048);
        let task_id = manager
            .create_task(file.path().to_path_buf(), None)
            .await
            .unwrap();

        assert!(manager.get_task(&task_id).await.is_some());
        manager.remove_task(&task_id).await.unwrap();
        assert!(manager.get_task(&task_id).await.is_none());
    }

    #[tokio::test]
    async fn test_clear_completed() {
        let api = Arc::new(StubApi::new());
        let manager = build_manager(api, 3);
        let file = write_temp_file(64 * 1024);
        let task_id = manager
            .create_task(file.path().to_path_buf(), Some("done.bin".to_string()))
            .await
            .unwrap();
        manager.start_task(&task_id).await.unwrap();
        assert!(wait_for_status(&manager, &task_id, UploadTaskStatus::Completed, 3000).await);

        assert_eq!(manager.clear_completed().await, 1);
        assert!(manager.get_task(&task_id).await.is_none());
    }

    #[tokio::test]
    async fn test_concurrency_bounds_clamped() {
        let manager = build_manager(Arc::new(StubApi::new()), 3);

        manager.update_file_concurrency(0);
        assert_eq!(manager.file_concurrency(), 1);

        manager.update_file_concurrency(99);
        assert_eq!(manager.file_concurrency(), 10);

        manager.update_chunk_concurrency(4);
        assert_eq!(manager.chunk_concurrency(), 4);
    }
}

// 上传引擎
//
// 核心功能：
// 1. 驱动单个文件的多分片上传状态机
// 2. 经任务池并发上传分片并收集完整性标签
// 3. 实现错误分类和指数退避重试
// 4. 小文件走单请求直传路径
//
// 状态机：
// Idle → Initiating → UploadingParts → Completing → Completed
// 任一非终态都可进入 Cancelled；Initiating/UploadingParts/Completing 失败进入 Failed

use crate::common::{format_size, format_speed};
use crate::events::{EventBus, ProgressThrottler, UploadEvent, DEFAULT_THROTTLE_INTERVAL_MS};
use crate::storage::{classify_part_error, CompletedPart, PartErrorKind, ProgressFn, StorageApi};
use crate::uploader::{
    run_pool, PartManager, PartTransport, ProgressState, UploadPart, UploadTask, UploadTaskStatus,
};
use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =====================================================
// 重试配置
// =====================================================

/// 默认分片级并发上限
pub const DEFAULT_CHUNK_CONCURRENCY: usize = 3;

/// 默认最大重试次数（不含首次尝试）
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 简单上传阈值：不超过该大小的文件走单请求直传
pub const SIMPLE_UPLOAD_THRESHOLD: u64 = 5 * 1024 * 1024;

/// 初始退避延迟（毫秒）
const INITIAL_BACKOFF_MS: u64 = 100;

/// 最大退避延迟（毫秒）
const MAX_BACKOFF_MS: u64 = 5000;

/// 限流时的额外等待时间（毫秒）
const RATE_LIMIT_BACKOFF_MS: u64 = 10000;

/// 退避抖动上限（毫秒），避免多个分片同步重试
const BACKOFF_JITTER_MS: u64 = 250;

/// 计算指数退避延迟
///
/// # 延迟序列
/// - retry_count=0: 100ms
/// - retry_count=1: 200ms
/// - retry_count=2: 400ms
/// - retry_count=3: 800ms
/// - 最大: 5000ms
fn calculate_backoff_delay(retry_count: u32, error_kind: &PartErrorKind) -> u64 {
    let base_delay = INITIAL_BACKOFF_MS * 2u64.pow(retry_count.min(16));
    let delay = base_delay.min(MAX_BACKOFF_MS);

    // 限流时使用更长的等待时间
    if matches!(error_kind, PartErrorKind::RateLimited) {
        delay.max(RATE_LIMIT_BACKOFF_MS)
    } else {
        delay
    }
}

// =====================================================
// 错误类型
// =====================================================

/// 上传错误
///
/// 取消是独立信号，不算作失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    /// 创建多分片会话失败
    Initiate(String),
    /// 单个分片在尝试耗尽后仍失败
    Part {
        part_number: u32,
        attempts: u32,
        message: String,
    },
    /// 合并前完整性校验未通过
    IntegrityCheck(String),
    /// 合并提交失败
    Complete(String),
    /// 小文件直传失败
    SimpleUpload(String),
    /// 内部调度错误
    Internal(String),
    /// 已取消
    Cancelled,
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadError::Initiate(msg) => write!(f, "创建上传会话失败: {}", msg),
            UploadError::Part {
                part_number,
                attempts,
                message,
            } => write!(
                f,
                "分片 {} 上传失败（已尝试 {} 次）: {}",
                part_number, attempts, message
            ),
            UploadError::IntegrityCheck(msg) => write!(f, "完整性校验失败: {}", msg),
            UploadError::Complete(msg) => write!(f, "合并提交失败: {}", msg),
            UploadError::SimpleUpload(msg) => write!(f, "直传失败: {}", msg),
            UploadError::Internal(msg) => write!(f, "上传内部错误: {}", msg),
            UploadError::Cancelled => write!(f, "上传已取消"),
        }
    }
}

impl std::error::Error for UploadError {}

impl UploadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Cancelled)
    }
}

// =====================================================
// 状态机
// =====================================================

/// 多分片上传状态机阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Idle,
    Initiating,
    UploadingParts,
    Completing,
    Completed,
    Failed,
    Cancelled,
}

/// 一次在途的多分片会话
#[derive(Debug, Clone)]
pub struct MultipartSession {
    /// 远端签发的上传 ID
    pub upload_id: String,
    /// 远端签发的对象路径
    pub key: String,
    /// 分片大小
    pub chunk_size: u64,
    /// 分片总数
    pub total_parts: u32,
}

/// 上传引擎可调参数
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// 分片级并发上限
    pub chunk_concurrency: usize,
    /// 单分片最大重试次数（不含首次尝试）
    pub max_retries: u32,
    /// 简单上传阈值（字节）
    pub simple_upload_threshold: u64,
    /// 进度事件节流间隔（毫秒）
    pub progress_interval_ms: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            chunk_concurrency: DEFAULT_CHUNK_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            simple_upload_threshold: SIMPLE_UPLOAD_THRESHOLD,
            progress_interval_ms: DEFAULT_THROTTLE_INTERVAL_MS,
        }
    }
}

// =====================================================
// 上传引擎
// =====================================================

/// 上传引擎
///
/// 负责协调单个文件的上传过程，包括：
/// - 路径选择（直传 / 多分片）
/// - 分片并发上传与重试
/// - 完整性校验与合并提交
/// - 失败与取消时的远端清理
pub struct UploadEngine {
    /// 存储 API
    api: Arc<dyn StorageApi>,
    /// 分片传输策略
    transport: Arc<dyn PartTransport>,
    /// 上传任务
    task: Arc<Mutex<UploadTask>>,
    /// 分片级字节进度
    progress: Arc<ProgressState>,
    /// 事件总线
    events: Arc<EventBus>,
    /// 取消令牌
    cancel_token: CancellationToken,
    /// 状态机阶段
    phase: Arc<parking_lot::Mutex<UploadPhase>>,
    /// 在途多分片会话
    session: Arc<parking_lot::Mutex<Option<MultipartSession>>>,
    /// 进度事件节流器
    throttler: Arc<ProgressThrottler>,
    /// 已完成分片计数（供进度回调读取）
    completed_parts: Arc<AtomicU32>,
    /// 最近一次计算的速度 (bytes/s)
    current_speed: Arc<AtomicU64>,
    /// 上次速度计算时间
    last_speed_time: Arc<Mutex<Instant>>,
    /// 上次速度计算时的已上传字节数
    last_speed_bytes: Arc<AtomicU64>,
    /// 可调参数
    options: EngineOptions,
}

impl UploadEngine {
    /// 创建新的上传引擎（使用默认参数）
    pub fn new(
        api: Arc<dyn StorageApi>,
        transport: Arc<dyn PartTransport>,
        task: Arc<Mutex<UploadTask>>,
        progress: Arc<ProgressState>,
        events: Arc<EventBus>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self::with_options(
            api,
            transport,
            task,
            progress,
            events,
            cancel_token,
            EngineOptions::default(),
        )
    }

    /// 创建新的上传引擎（指定参数）
    pub fn with_options(
        api: Arc<dyn StorageApi>,
        transport: Arc<dyn PartTransport>,
        task: Arc<Mutex<UploadTask>>,
        progress: Arc<ProgressState>,
        events: Arc<EventBus>,
        cancel_token: CancellationToken,
        options: EngineOptions,
    ) -> Self {
        Self {
            api,
            transport,
            task,
            progress,
            events,
            cancel_token,
            phase: Arc::new(parking_lot::Mutex::new(UploadPhase::Idle)),
            session: Arc::new(parking_lot::Mutex::new(None)),
            throttler: Arc::new(ProgressThrottler::with_millis(options.progress_interval_ms)),
            completed_parts: Arc::new(AtomicU32::new(0)),
            current_speed: Arc::new(AtomicU64::new(0)),
            last_speed_time: Arc::new(Mutex::new(Instant::now())),
            last_speed_bytes: Arc::new(AtomicU64::new(0)),
            options,
        }
    }

    /// 当前状态机阶段
    pub fn phase(&self) -> UploadPhase {
        *self.phase.lock()
    }

    /// 当前多分片会话信息（未创建时为 None）
    pub fn session(&self) -> Option<MultipartSession> {
        self.session.lock().clone()
    }

    /// 执行上传
    ///
    /// 按大小阈值选择直传或多分片路径；
    /// 返回错误时任务已被置为 Failed 或 Cancelled，远端清理已尽力完成
    pub async fn run(&self) -> Result<(), UploadError> {
        let total_size = self.task.lock().await.total_size;

        let result = if total_size <= self.options.simple_upload_threshold {
            self.execute_simple().await
        } else {
            self.execute_multipart().await
        };

        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.finish_with_error(&err).await;
                Err(err)
            }
        }
    }

    /// 多分片上传流程
    async fn execute_multipart(&self) -> Result<(), UploadError> {
        let (local_path, file_name, total_size, content_type, task_id) = {
            let task = self.task.lock().await;
            (
                task.local_path.clone(),
                task.file_name.clone(),
                task.total_size,
                task.content_type.clone(),
                task.id.clone(),
            )
        };

        info!(
            "开始分片上传: name={}, size={}",
            file_name,
            format_size(total_size)
        );

        if self.cancel_token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        // ---- Initiating ----
        self.set_phase(UploadPhase::Initiating);
        {
            let mut task = self.task.lock().await;
            let old = task.status;
            task.mark_uploading();
            self.emit_status(&task_id, old, task.status);
        }

        // 远端文件名在此定格，之后的重命名只影响展示
        let remote_name = file_name;

        self.transport
            .prepare()
            .await
            .map_err(|e| UploadError::Initiate(format!("传输准备失败: {}", e)))?;

        let initiate = self.api.initiate(&remote_name, &content_type);
        let (upload_id, key) = tokio::select! {
            _ = self.cancel_token.cancelled() => return Err(UploadError::Cancelled),
            r = initiate => r.map_err(|e| UploadError::Initiate(e.to_string()))?,
        };

        // ---- UploadingParts ----
        let part_manager = Arc::new(Mutex::new(PartManager::with_selected_chunk_size(total_size)));
        let (parts, total_parts, chunk_size) = {
            let pm = part_manager.lock().await;
            (pm.parts().to_vec(), pm.total_parts(), pm.chunk_size())
        };

        *self.session.lock() = Some(MultipartSession {
            upload_id: upload_id.clone(),
            key: key.clone(),
            chunk_size,
            total_parts,
        });

        info!(
            "多分片会话已创建: upload_id={}, key={}, 分片数={}",
            &upload_id[..8.min(upload_id.len())],
            key,
            total_parts
        );

        {
            let mut task = self.task.lock().await;
            task.total_parts = total_parts;
        }

        self.set_phase(UploadPhase::UploadingParts);

        let ctx = PartContext {
            task_id: task_id.clone(),
            local_path,
            upload_id: upload_id.clone(),
            key: key.clone(),
            total_parts,
            transport: self.transport.clone(),
            progress: self.progress.clone(),
            part_manager,
            task: self.task.clone(),
            events: self.events.clone(),
            throttler: self.throttler.clone(),
            cancel_token: self.cancel_token.clone(),
            completed_parts: self.completed_parts.clone(),
            current_speed: self.current_speed.clone(),
            last_speed_time: self.last_speed_time.clone(),
            last_speed_bytes: self.last_speed_bytes.clone(),
            max_retries: self.options.max_retries,
        };

        // 每个分片一个延迟任务，由任务池按并发上限执行
        let thunks: Vec<BoxFuture<'static, Result<CompletedPart>>> = parts
            .into_iter()
            .map(|part| {
                let ctx = ctx.clone();
                upload_single_part(ctx, part).boxed()
            })
            .collect();

        let mut completed = run_pool(thunks, self.options.chunk_concurrency)
            .await
            .map_err(|e| self.map_pool_error(e))?;

        // ---- 完整性门 ----
        // 任务池按入参顺序返回，这里再按序号排序一次，合并接口依赖分片顺序
        completed.sort_by_key(|p| p.part_number);
        verify_parts(&completed, total_parts)
            .map_err(|e| UploadError::IntegrityCheck(e.to_string()))?;

        // 取消后不得再发起合并
        if self.cancel_token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        // ---- Completing ----
        self.set_phase(UploadPhase::Completing);
        info!("全部分片完成，提交合并: key={}", key);

        let complete = self.api.complete(
            &upload_id,
            &key,
            completed,
            &remote_name,
            total_size,
            &content_type,
        );
        tokio::select! {
            _ = self.cancel_token.cancelled() => return Err(UploadError::Cancelled),
            r = complete => r.map_err(|e| UploadError::Complete(e.to_string()))?,
        }

        // ---- Completed ----
        self.set_phase(UploadPhase::Completed);
        {
            let mut task = self.task.lock().await;
            let old = task.status;
            task.mark_completed();
            self.emit_status(&task_id, old, task.status);
        }
        self.events.publish(UploadEvent::Progress {
            task_id: task_id.clone(),
            uploaded_size: total_size,
            total_size,
            speed: self.current_speed.load(Ordering::SeqCst),
            progress: 100.0,
            completed_parts: total_parts,
            total_parts,
        });
        self.events.publish(UploadEvent::Completed {
            task_id,
            file_name: remote_name.clone(),
            total_size,
            completed_at: chrono::Utc::now().timestamp(),
        });
        info!("上传完成: {} ({} 个分片)", remote_name, total_parts);

        Ok(())
    }

    /// 小文件直传流程：单请求，无分片，失败不重试
    async fn execute_simple(&self) -> Result<(), UploadError> {
        let (local_path, file_name, total_size, content_type, task_id) = {
            let task = self.task.lock().await;
            (
                task.local_path.clone(),
                task.file_name.clone(),
                task.total_size,
                task.content_type.clone(),
                task.id.clone(),
            )
        };

        info!(
            "小文件直传: name={}, size={}",
            file_name,
            format_size(total_size)
        );

        if self.cancel_token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        self.set_phase(UploadPhase::Initiating);
        {
            let mut task = self.task.lock().await;
            let old = task.status;
            task.mark_uploading();
            self.emit_status(&task_id, old, task.status);
        }

        self.transport
            .prepare()
            .await
            .map_err(|e| UploadError::SimpleUpload(format!("传输准备失败: {}", e)))?;

        let data = tokio::fs::read(&local_path)
            .await
            .map_err(|e| UploadError::SimpleUpload(format!("读取文件失败: {}", e)))?;

        self.set_phase(UploadPhase::UploadingParts);

        let progress_cb: ProgressFn = {
            let progress = self.progress.clone();
            let throttler = self.throttler.clone();
            let events = self.events.clone();
            let task_id = task_id.clone();
            Arc::new(move |bytes| {
                progress.set(1, bytes);
                if throttler.should_emit() {
                    events.publish(UploadEvent::Progress {
                        task_id: task_id.clone(),
                        uploaded_size: progress.uploaded_bytes(),
                        total_size,
                        speed: 0,
                        progress: progress.progress(),
                        completed_parts: 0,
                        total_parts: 0,
                    });
                }
            })
        };

        let send = self
            .api
            .simple_upload(&file_name, &content_type, data, Some(progress_cb));
        tokio::select! {
            _ = self.cancel_token.cancelled() => return Err(UploadError::Cancelled),
            r = send => r.map_err(|e| UploadError::SimpleUpload(e.to_string()))?,
        }

        self.set_phase(UploadPhase::Completed);
        {
            let mut task = self.task.lock().await;
            let old = task.status;
            task.mark_completed();
            self.emit_status(&task_id, old, task.status);
        }
        self.events.publish(UploadEvent::Completed {
            task_id,
            file_name: file_name.clone(),
            total_size,
            completed_at: chrono::Utc::now().timestamp(),
        });
        info!("直传完成: {}", file_name);

        Ok(())
    }

    /// 失败或取消的统一收尾：更新任务状态、发布事件、尽力中止远端会话
    async fn finish_with_error(&self, err: &UploadError) {
        {
            let mut task = self.task.lock().await;
            let old = task.status;
            if err.is_cancelled() {
                self.set_phase(UploadPhase::Cancelled);
                task.mark_cancelled();
                self.emit_status(&task.id, old, task.status);
                self.events.publish(UploadEvent::Cancelled {
                    task_id: task.id.clone(),
                });
                info!("上传已取消: task={}", task.id);
            } else {
                self.set_phase(UploadPhase::Failed);
                task.mark_failed(err.to_string());
                self.emit_status(&task.id, old, task.status);
                self.events.publish(UploadEvent::Failed {
                    task_id: task.id.clone(),
                    error: err.to_string(),
                });
                error!("上传失败: task={}, 错误: {}", task.id, err);
            }
        }

        self.abort_best_effort().await;
    }

    /// 尽力通知远端中止在途会话，清理失败只记录不升级
    async fn abort_best_effort(&self) {
        let session = self.session.lock().clone();
        if let Some(session) = session {
            let upload_id = session.upload_id;
            debug!(
                "通知远端中止: upload_id={}",
                &upload_id[..8.min(upload_id.len())]
            );
            if let Err(e) = self.api.abort(&upload_id).await {
                warn!("中止通知失败: {}", e);
            }
        }
    }

    fn map_pool_error(&self, err: anyhow::Error) -> UploadError {
        match err.downcast::<UploadError>() {
            Ok(upload_err) => upload_err,
            Err(other) => {
                if self.cancel_token.is_cancelled() {
                    UploadError::Cancelled
                } else {
                    UploadError::Internal(other.to_string())
                }
            }
        }
    }

    fn set_phase(&self, next: UploadPhase) {
        let mut phase = self.phase.lock();
        debug!("[状态机] {:?} -> {:?}", *phase, next);
        *phase = next;
    }

    fn emit_status(&self, task_id: &str, old: UploadTaskStatus, new: UploadTaskStatus) {
        // 管理器可能在派发时已标记 Uploading，重复迁移不发事件
        if old == new {
            return;
        }
        self.events.publish(UploadEvent::StatusChanged {
            task_id: task_id.to_string(),
            old_status: old.as_str().to_string(),
            new_status: new.as_str().to_string(),
        });
    }
}

/// 合并前的完整性门
///
/// 分片数量必须恰好等于 total_parts，序号连续无重复，标签非空；
/// 入参须已按序号升序排列
fn verify_parts(parts: &[CompletedPart], total_parts: u32) -> Result<()> {
    if parts.len() != total_parts as usize {
        anyhow::bail!(
            "分片数量不符: 期望 {} 个，实到 {} 个",
            total_parts,
            parts.len()
        );
    }
    for (idx, part) in parts.iter().enumerate() {
        let expected = idx as u32 + 1;
        if part.part_number != expected {
            anyhow::bail!(
                "分片序号缺失或重复: 位置 {} 应为分片 {}，实为分片 {}",
                idx,
                expected,
                part.part_number
            );
        }
        if part.etag.trim().is_empty() {
            anyhow::bail!("分片 {} 的完整性标签为空", part.part_number);
        }
    }
    Ok(())
}

// =====================================================
// 独立的分片上传函数（用于并发调度）
// =====================================================

/// 分片上传共享上下文（同一文件的所有分片任务共用）
#[derive(Clone)]
struct PartContext {
    task_id: String,
    local_path: PathBuf,
    upload_id: String,
    key: String,
    total_parts: u32,
    transport: Arc<dyn PartTransport>,
    progress: Arc<ProgressState>,
    part_manager: Arc<Mutex<PartManager>>,
    task: Arc<Mutex<UploadTask>>,
    events: Arc<EventBus>,
    throttler: Arc<ProgressThrottler>,
    cancel_token: CancellationToken,
    completed_parts: Arc<AtomicU32>,
    current_speed: Arc<AtomicU64>,
    last_speed_time: Arc<Mutex<Instant>>,
    last_speed_bytes: Arc<AtomicU64>,
    max_retries: u32,
}

/// 上传单个分片（带重试），返回分片序号与完整性标签
///
/// 重试策略：除取消外的任何失败都按指数退避加抖动重试，
/// 每次重试前只清零本分片的进度，兄弟分片不受影响
async fn upload_single_part(ctx: PartContext, part: UploadPart) -> Result<CompletedPart> {
    let part_number = part.part_number;
    let part_size = part.size();
    let total_size = ctx.progress.total_size();

    debug!(
        "[分片#{}] 开始上传 (范围: {}-{}, 大小: {} bytes)",
        part_number,
        part.range.start,
        part.range.end.saturating_sub(1),
        part_size
    );

    {
        let mut pm = ctx.part_manager.lock().await;
        pm.mark_uploading(part_number);
    }

    // 分片数据只读一次，重试时复用
    let data = match part.read_data(&ctx.local_path).await {
        Ok(data) => data,
        Err(e) => {
            ctx.part_manager.lock().await.unmark_uploading(part_number);
            return Err(anyhow::Error::new(UploadError::Part {
                part_number,
                attempts: 0,
                message: format!("读取分片数据失败: {}", e),
            }));
        }
    };

    let mut last_error: Option<anyhow::Error> = None;

    for attempt in 0..=ctx.max_retries {
        if ctx.cancel_token.is_cancelled() {
            ctx.part_manager.lock().await.unmark_uploading(part_number);
            return Err(anyhow::Error::new(UploadError::Cancelled));
        }

        // 本分片进度清零后重新上报
        ctx.progress.reset_part(part_number);

        let progress_cb: ProgressFn = {
            let progress = ctx.progress.clone();
            let throttler = ctx.throttler.clone();
            let events = ctx.events.clone();
            let task_id = ctx.task_id.clone();
            let completed_parts = ctx.completed_parts.clone();
            let current_speed = ctx.current_speed.clone();
            let total_parts = ctx.total_parts;
            Arc::new(move |bytes| {
                progress.set(part_number, bytes);
                if throttler.should_emit() {
                    events.publish(UploadEvent::Progress {
                        task_id: task_id.clone(),
                        uploaded_size: progress.uploaded_bytes(),
                        total_size,
                        speed: current_speed.load(Ordering::SeqCst),
                        progress: progress.progress(),
                        completed_parts: completed_parts.load(Ordering::SeqCst),
                        total_parts,
                    });
                }
            })
        };

        let send = ctx.transport.send_part(
            &ctx.upload_id,
            &ctx.key,
            part_number,
            data.clone(),
            Some(progress_cb),
        );

        let result = tokio::select! {
            _ = ctx.cancel_token.cancelled() => {
                ctx.part_manager.lock().await.unmark_uploading(part_number);
                return Err(anyhow::Error::new(UploadError::Cancelled));
            }
            r = send => r,
        };

        // 远端收下字节但未确认身份时按失败处理
        let result = result.and_then(|etag| {
            if etag.trim().is_empty() {
                Err(anyhow::anyhow!("分片 {} 响应缺少完整性标签", part_number))
            } else {
                Ok(etag)
            }
        });

        match result {
            Ok(etag) => {
                ctx.progress.set(part_number, part_size);

                let (completed, total) = {
                    let mut pm = ctx.part_manager.lock().await;
                    pm.mark_completed(part_number, Some(etag.clone()));
                    (pm.completed_count(), pm.total_parts())
                };
                ctx.completed_parts.store(completed, Ordering::SeqCst);

                // 计算上传速度（至少 0.5 秒更新一次）
                let new_uploaded = ctx.progress.uploaded_bytes();
                let speed = {
                    let mut last_time = ctx.last_speed_time.lock().await;
                    let elapsed_secs = last_time.elapsed().as_secs_f64();
                    if elapsed_secs >= 0.5 {
                        let last_bytes = ctx.last_speed_bytes.swap(new_uploaded, Ordering::SeqCst);
                        let bytes_diff = new_uploaded.saturating_sub(last_bytes);
                        *last_time = Instant::now();
                        (bytes_diff as f64 / elapsed_secs) as u64
                    } else {
                        0
                    }
                };
                if speed > 0 {
                    ctx.current_speed.store(speed, Ordering::SeqCst);
                }

                // 更新任务快照（调用方通过这些字段获取进度）
                {
                    let mut task = ctx.task.lock().await;
                    task.uploaded_size = new_uploaded;
                    task.completed_parts = completed;
                    if speed > 0 {
                        task.speed = speed;
                    }
                }

                info!(
                    "[分片#{}] ✓ 上传成功 ({}/{} 完成, 速度: {})",
                    part_number,
                    completed,
                    total,
                    format_speed(ctx.current_speed.load(Ordering::SeqCst))
                );

                return Ok(CompletedPart {
                    part_number,
                    etag,
                });
            }
            Err(e) => {
                ctx.part_manager.lock().await.increment_retry(part_number);
                let error_kind = classify_part_error(&e);

                if attempt < ctx.max_retries {
                    let backoff_ms = calculate_backoff_delay(attempt, &error_kind)
                        + rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS);
                    warn!(
                        "[分片#{}] 上传失败（{}），等待 {}ms 后重试 ({}/{}): {}",
                        part_number,
                        error_kind.label(),
                        backoff_ms,
                        attempt + 1,
                        ctx.max_retries,
                        e
                    );
                    // 退避等待期间同样响应取消
                    tokio::select! {
                        _ = ctx.cancel_token.cancelled() => {
                            ctx.part_manager.lock().await.unmark_uploading(part_number);
                            return Err(anyhow::Error::new(UploadError::Cancelled));
                        }
                        _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                    }
                }

                last_error = Some(e);
            }
        }
    }

    {
        let mut pm = ctx.part_manager.lock().await;
        pm.unmark_uploading(part_number);
    }

    let attempts = ctx.max_retries + 1;
    error!(
        "[分片#{}] 上传失败，已达最大尝试次数 ({})",
        part_number, attempts
    );

    let message = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "上传失败".to_string());

    Err(anyhow::Error::new(UploadError::Part {
        part_number,
        attempts,
        message,
    }))
}

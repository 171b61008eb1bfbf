// 上传模块
//
// 分层结构：
// - chunk: 分片大小选择与分片级进度
// - pool: 有界并发任务池（按入参顺序返回结果）
// - transport: 分片传输策略（预签名直传 / 服务端代理 / 远端工作节点）
// - engine: 单文件上传引擎（状态机 + 重试 + 完整性门槛）
// - manager: 多任务管理（文件级并发 + 等待队列 + 事件广播）

pub mod chunk;
pub mod engine;
pub mod manager;
pub mod pool;
pub mod task;
pub mod transport;

pub use chunk::{
    select_chunk_size, PartManager, ProgressState, UploadPart, CHUNK_SIZE_HUGE, CHUNK_SIZE_LARGE,
    CHUNK_SIZE_MEDIUM, CHUNK_SIZE_SMALL,
};
pub use engine::{
    EngineOptions, MultipartSession, UploadEngine, UploadError, UploadPhase,
    DEFAULT_CHUNK_CONCURRENCY, DEFAULT_MAX_RETRIES, SIMPLE_UPLOAD_THRESHOLD,
};
pub use manager::{UploadManager, UploadTaskInfo, DEFAULT_FILE_CONCURRENCY};
pub use pool::run_pool;
pub use task::{UploadTask, UploadTaskStatus};
pub use transport::{
    transport_for, DirectPresignedTransport, PartTransport, RemoteWorkerTransport,
    ServerProxiedTransport,
};

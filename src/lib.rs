// Drive Upload Rust Library
// 浏览器网盘直传的 Rust 上传核心库

// 配置管理模块
pub mod config;

// 日志系统模块
pub mod logging;

// 存储后端模块（上传 API 客户端与传输类型）
pub mod storage;

// 上传模块（分片、任务池、引擎与多任务管理）
pub mod uploader;

// 事件模块（任务生命周期与进度广播）
pub mod events;

// 公共模块（格式化工具等）
pub mod common;

// 导出常用类型
pub use config::{AppConfig, LogConfig, StorageConfig, UploadConfig};
pub use events::{EventBus, TimestampedEvent, UploadEvent};
pub use logging::{init_logging, LogGuard};
pub use storage::{CompletedPart, StorageApi, StorageClient, TransportKind};
pub use uploader::{
    select_chunk_size, EngineOptions, UploadEngine, UploadError, UploadManager, UploadTask,
    UploadTaskStatus,
};

//! 上传事件类型定义
//!
//! 定义任务相关的事件类型，通过广播通道推送给上层应用

use serde::{Deserialize, Serialize};

/// 事件优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    /// 低优先级：进度更新
    Low = 0,
    /// 中优先级：状态变更
    Medium = 1,
    /// 高优先级：完成、失败、删除等关键事件
    High = 2,
}

/// 上传任务事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 任务创建
    Created {
        task_id: String,
        file_name: String,
        total_size: u64,
    },
    /// 进度更新
    Progress {
        task_id: String,
        uploaded_size: u64,
        total_size: u64,
        speed: u64,
        progress: f64,
        completed_parts: u32,
        total_parts: u32,
    },
    /// 状态变更
    StatusChanged {
        task_id: String,
        old_status: String,
        new_status: String,
    },
    /// 进入等待队列
    Waiting { task_id: String },
    /// 任务重命名
    Renamed {
        task_id: String,
        old_name: String,
        new_name: String,
    },
    /// 任务完成
    Completed {
        task_id: String,
        file_name: String,
        total_size: u64,
        completed_at: i64,
    },
    /// 任务失败
    Failed { task_id: String, error: String },
    /// 任务取消
    Cancelled { task_id: String },
    /// 任务删除
    Deleted { task_id: String },
}

impl UploadEvent {
    /// 获取任务 ID
    pub fn task_id(&self) -> &str {
        match self {
            UploadEvent::Created { task_id, .. } => task_id,
            UploadEvent::Progress { task_id, .. } => task_id,
            UploadEvent::StatusChanged { task_id, .. } => task_id,
            UploadEvent::Waiting { task_id } => task_id,
            UploadEvent::Renamed { task_id, .. } => task_id,
            UploadEvent::Completed { task_id, .. } => task_id,
            UploadEvent::Failed { task_id, .. } => task_id,
            UploadEvent::Cancelled { task_id } => task_id,
            UploadEvent::Deleted { task_id } => task_id,
        }
    }

    /// 获取事件优先级
    pub fn priority(&self) -> EventPriority {
        match self {
            UploadEvent::Progress { .. } => EventPriority::Low,
            UploadEvent::Created { .. } => EventPriority::Medium,
            UploadEvent::StatusChanged { .. } => EventPriority::Medium,
            UploadEvent::Waiting { .. } => EventPriority::Medium,
            UploadEvent::Renamed { .. } => EventPriority::Medium,
            UploadEvent::Completed { .. } => EventPriority::High,
            UploadEvent::Failed { .. } => EventPriority::High,
            UploadEvent::Cancelled { .. } => EventPriority::High,
            UploadEvent::Deleted { .. } => EventPriority::High,
        }
    }

    /// 获取事件类型名称
    pub fn event_type_name(&self) -> &'static str {
        match self {
            UploadEvent::Created { .. } => "created",
            UploadEvent::Progress { .. } => "progress",
            UploadEvent::StatusChanged { .. } => "status_changed",
            UploadEvent::Waiting { .. } => "waiting",
            UploadEvent::Renamed { .. } => "renamed",
            UploadEvent::Completed { .. } => "completed",
            UploadEvent::Failed { .. } => "failed",
            UploadEvent::Cancelled { .. } => "cancelled",
            UploadEvent::Deleted { .. } => "deleted",
        }
    }
}

/// 带时间戳的事件（广播通道的载荷）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    /// 事件 ID（全局唯一递增）
    pub event_id: u64,
    /// 时间戳（Unix 毫秒）
    pub timestamp: i64,
    /// 事件内容
    #[serde(flatten)]
    pub event: UploadEvent,
}

impl TimestampedEvent {
    /// 创建新的带时间戳事件
    pub fn new(event_id: u64, event: UploadEvent) -> Self {
        Self {
            event_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
            event,
        }
    }
}

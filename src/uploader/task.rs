// 上传任务定义

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// 上传任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadTaskStatus {
    /// 等待中
    Pending,
    /// 上传中
    Uploading,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl UploadTaskStatus {
    /// 状态的字符串形式，与序列化格式一致
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadTaskStatus::Pending => "pending",
            UploadTaskStatus::Uploading => "uploading",
            UploadTaskStatus::Completed => "completed",
            UploadTaskStatus::Failed => "failed",
            UploadTaskStatus::Cancelled => "cancelled",
        }
    }
}

/// 上传任务
///
/// 任务 ID 与文件名解耦，重命名不影响任务身份与已产生的进度
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    /// 任务ID（UUID v4，创建后不变）
    pub id: String,
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 显示名（上传到远端使用的文件名，可在开始前重命名）
    pub file_name: String,
    /// 文件大小
    pub total_size: u64,
    /// 内容类型
    pub content_type: String,
    /// 任务状态
    pub status: UploadTaskStatus,
    /// 已上传大小
    pub uploaded_size: u64,
    /// 上传速度 (bytes/s)
    pub speed: u64,
    /// 总分片数（简单上传为 0）
    #[serde(default)]
    pub total_parts: u32,
    /// 已完成分片数
    #[serde(default)]
    pub completed_parts: u32,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
    /// 错误信息
    pub error: Option<String>,
}

impl UploadTask {
    /// 创建新的上传任务
    pub fn new(
        local_path: PathBuf,
        file_name: String,
        total_size: u64,
        content_type: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            local_path,
            file_name,
            total_size,
            content_type,
            status: UploadTaskStatus::Pending,
            uploaded_size: 0,
            speed: 0,
            total_parts: 0,
            completed_parts: 0,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// 计算进度百分比，钳制在 [0, 100]
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        let ratio = self.uploaded_size as f64 / self.total_size as f64;
        (ratio * 100.0).clamp(0.0, 100.0)
    }

    /// 估算剩余时间 (秒)
    pub fn eta(&self) -> Option<u64> {
        if self.speed == 0 || self.uploaded_size >= self.total_size {
            return None;
        }
        let remaining = self.total_size - self.uploaded_size;
        Some(remaining / self.speed)
    }

    /// 是否处于终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            UploadTaskStatus::Completed | UploadTaskStatus::Failed | UploadTaskStatus::Cancelled
        )
    }

    /// 重命名显示名，返回旧名
    pub fn rename(&mut self, new_name: String) -> String {
        std::mem::replace(&mut self.file_name, new_name)
    }

    /// 标记为上传中
    pub fn mark_uploading(&mut self) {
        self.status = UploadTaskStatus::Uploading;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self) {
        self.status = UploadTaskStatus::Completed;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        self.uploaded_size = self.total_size;
        self.completed_parts = self.total_parts;
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) {
        self.status = UploadTaskStatus::Failed;
        self.error = Some(error);
    }

    /// 标记为已取消
    ///
    /// 取消不是失败，不写入错误信息
    pub fn mark_cancelled(&mut self) {
        self.status = UploadTaskStatus::Cancelled;
    }

    /// 用户重试前重置任务状态
    pub fn reset_for_retry(&mut self) {
        self.status = UploadTaskStatus::Pending;
        self.uploaded_size = 0;
        self.speed = 0;
        self.completed_parts = 0;
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
    }
}

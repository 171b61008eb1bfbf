// 对象存储API数据类型

use serde::{Deserialize, Serialize};

/// 分片传输策略（按存储桶配置选择，对整个会话生效）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// 预签名直传：客户端直接 PUT 到存储
    DirectPresigned,
    /// 服务端中转：分片经应用服务器转发
    ServerProxied,
    /// 远程工作节点：冷启动唤醒后分片经 worker 转发
    RemoteWorker,
}

impl Default for TransportKind {
    fn default() -> Self {
        TransportKind::DirectPresigned
    }
}

/// initiate 请求体
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    /// 目标文件名
    pub filename: String,

    /// 内容类型
    pub content_type: String,
}

/// initiate 响应
#[derive(Debug, Clone, Deserialize)]
pub struct InitiateResponse {
    /// 是否成功
    #[serde(default)]
    pub success: bool,

    /// 远端分配的上传会话 ID
    #[serde(default, rename = "uploadId")]
    pub upload_id: String,

    /// 远端分配的对象路径
    #[serde(default)]
    pub key: String,

    /// 错误信息
    #[serde(default)]
    pub error: String,
}

impl InitiateResponse {
    /// 是否成功（uploadId 和 key 必须同时存在）
    pub fn is_success(&self) -> bool {
        self.success && !self.upload_id.is_empty() && !self.key.is_empty()
    }
}

/// presign 请求体
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignRequest {
    pub upload_id: String,
    pub key: String,
    pub part_number: u32,
}

/// presign 响应
#[derive(Debug, Clone, Deserialize)]
pub struct PresignResponse {
    #[serde(default)]
    pub success: bool,

    /// 预签名上传 URL
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub error: String,
}

impl PresignResponse {
    pub fn is_success(&self) -> bool {
        self.success && !self.url.is_empty()
    }
}

/// chunk（服务端中转）响应
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkResponse {
    #[serde(default)]
    pub success: bool,

    /// 分片完整性标签
    #[serde(default, alias = "ETag")]
    pub etag: String,

    #[serde(default)]
    pub error: String,
}

impl ChunkResponse {
    /// 是否成功（标签为空视为失败，远端收了字节但没有确认身份）
    pub fn is_success(&self) -> bool {
        self.success && !self.etag.is_empty()
    }
}

/// 已完成分片（complete 请求中的条目）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    /// 分片序号（1 起始）
    #[serde(rename = "PartNumber")]
    pub part_number: u32,

    /// 完整性标签
    #[serde(rename = "ETag")]
    pub etag: String,
}

/// complete 请求体
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub upload_id: String,
    pub key: String,

    /// 分片列表，必须按 PartNumber 升序
    pub parts: Vec<CompletedPart>,

    /// 最终文件名
    pub filename: String,

    /// 文件大小（字节）
    pub size: u64,

    /// 内容类型
    #[serde(rename = "type")]
    pub content_type: String,
}

/// complete 响应
#[derive(Debug, Clone, Deserialize)]
pub struct CompleteResponse {
    #[serde(default)]
    pub success: bool,

    #[serde(default)]
    pub error: String,
}

impl CompleteResponse {
    pub fn is_success(&self) -> bool {
        self.success
    }
}

/// abort 请求体
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest {
    pub upload_id: String,
}

/// simple-upload 响应
#[derive(Debug, Clone, Deserialize)]
pub struct SimpleUploadResponse {
    #[serde(default)]
    pub success: bool,

    #[serde(default)]
    pub error: String,
}

impl SimpleUploadResponse {
    pub fn is_success(&self) -> bool {
        self.success
    }
}

/// 分片上传错误分类
///
/// 用于退避策略和日志标注；除取消外所有失败都会按策略重试
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartErrorKind {
    /// 网络错误
    Network,
    /// 超时
    Timeout,
    /// 服务器错误（5xx）
    ServerError,
    /// 限流（需要更长等待时间）
    RateLimited,
    /// 完整性标签缺失（远端收了字节但没有确认身份）
    MissingTag,
    /// 资源不存在（404）
    NotFound,
    /// 权限不足（403）
    Forbidden,
    /// 参数错误（400）
    BadRequest,
    /// 未知错误
    Unknown,
}

impl PartErrorKind {
    /// 日志标签
    pub fn label(&self) -> &'static str {
        match self {
            PartErrorKind::Network => "网络错误",
            PartErrorKind::Timeout => "超时",
            PartErrorKind::ServerError => "服务器错误",
            PartErrorKind::RateLimited => "限流",
            PartErrorKind::MissingTag => "标签缺失",
            PartErrorKind::NotFound => "资源不存在",
            PartErrorKind::Forbidden => "权限不足",
            PartErrorKind::BadRequest => "参数错误",
            PartErrorKind::Unknown => "未知错误",
        }
    }
}

/// 根据错误信息分类
pub fn classify_part_error(error: &anyhow::Error) -> PartErrorKind {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("timeout") || error_str.contains("timed out") {
        PartErrorKind::Timeout
    } else if error_str.contains("connection")
        || error_str.contains("network")
        || error_str.contains("dns")
    {
        PartErrorKind::Network
    } else if error_str.contains("429") || error_str.contains("rate limit") {
        PartErrorKind::RateLimited
    } else if error_str.contains("etag") || error_str.contains("标签") {
        PartErrorKind::MissingTag
    } else if error_str.contains("404") || error_str.contains("not found") {
        PartErrorKind::NotFound
    } else if error_str.contains("403") || error_str.contains("forbidden") {
        PartErrorKind::Forbidden
    } else if error_str.contains("400") || error_str.contains("bad request") {
        PartErrorKind::BadRequest
    } else if error_str.contains("500")
        || error_str.contains("502")
        || error_str.contains("503")
        || error_str.contains("internal server")
    {
        PartErrorKind::ServerError
    } else {
        PartErrorKind::Unknown
    }
}

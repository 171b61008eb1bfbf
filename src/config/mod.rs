// 配置管理模块

use crate::storage::TransportKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 存储后端配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 存储后端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 上传 API 基础地址
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// 分片传输策略（按存储桶配置选择）
    #[serde(default)]
    pub transport: TransportKind,
    /// 远程工作节点唤醒地址（缺省时使用 api_base_url 下的 wake 路由）
    #[serde(default)]
    pub wake_url: Option<String>,
    /// 普通请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 唤醒请求超时（秒），覆盖远端冷启动耗时
    #[serde(default = "default_wake_timeout_secs")]
    pub wake_timeout_secs: u64,
}

fn default_api_base_url() -> String {
    "http://127.0.0.1:8787/api/upload".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_wake_timeout_secs() -> u64 {
    60
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            transport: TransportKind::default(),
            wake_url: None,
            request_timeout_secs: default_request_timeout_secs(),
            wake_timeout_secs: default_wake_timeout_secs(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 最大同时上传文件数（1-10）
    #[serde(default = "default_file_concurrency")]
    pub file_concurrency: usize,
    /// 单文件分片级并发上限（1-10）
    #[serde(default = "default_chunk_concurrency")]
    pub chunk_concurrency: usize,
    /// 简单上传阈值（字节），不超过该大小的文件单请求直传
    #[serde(default = "default_simple_upload_threshold")]
    pub simple_upload_threshold: u64,
    /// 单分片最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 进度事件节流间隔（毫秒）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_file_concurrency() -> usize {
    3
}

fn default_chunk_concurrency() -> usize {
    3
}

fn default_simple_upload_threshold() -> u64 {
    5 * 1024 * 1024
}

fn default_max_retries() -> u32 {
    3
}

fn default_progress_interval_ms() -> u64 {
    200
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            file_concurrency: default_file_concurrency(),
            chunk_concurrency: default_chunk_concurrency(),
            simple_upload_threshold: default_simple_upload_threshold(),
            max_retries: default_max_retries(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            upload: UploadConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("读取配置文件失败")?;

        let mut config: AppConfig = toml::from_str(&content).context("解析配置文件失败")?;
        config.normalize();

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("序列化配置失败")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("创建配置目录失败")?;
            }
        }

        fs::write(path, content).await.context("写入配置文件失败")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {}", e);
                let default_config = Self::default();

                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }

    /// 将越界参数拉回合法范围
    pub fn normalize(&mut self) {
        let file_concurrency = self.upload.file_concurrency.clamp(1, 10);
        if file_concurrency != self.upload.file_concurrency {
            tracing::warn!(
                "文件级并发数 {} 超出范围，已调整为 {}",
                self.upload.file_concurrency,
                file_concurrency
            );
            self.upload.file_concurrency = file_concurrency;
        }

        let chunk_concurrency = self.upload.chunk_concurrency.clamp(1, 10);
        if chunk_concurrency != self.upload.chunk_concurrency {
            tracing::warn!(
                "分片级并发数 {} 超出范围，已调整为 {}",
                self.upload.chunk_concurrency,
                chunk_concurrency
            );
            self.upload.chunk_concurrency = chunk_concurrency;
        }
    }
}

// 对象存储客户端实现

use crate::config::StorageConfig;
use crate::storage::types::{
    AbortRequest, ChunkResponse, CompleteRequest, CompletedPart, InitiateRequest,
    InitiateResponse, PresignRequest, PresignResponse, SimpleUploadResponse,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::Stream;
use reqwest::header::{CONTENT_LENGTH, ETAG};
use reqwest::multipart;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 进度回调：参数为该请求已发送的累计字节数
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// 进度流的切片大小
const PROGRESS_PIECE_SIZE: usize = 64 * 1024;

/// 远端多分片上传接口
///
/// 覆盖 initiate/presign/chunk/complete/abort/simple-upload/wake 七个端点，
/// 引擎和传输策略只依赖该接口，便于替换与测试
#[async_trait]
pub trait StorageApi: Send + Sync {
    /// 发起多分片会话，返回 (upload_id, key)
    async fn initiate(&self, filename: &str, content_type: &str) -> Result<(String, String)>;

    /// 获取指定分片的预签名 URL
    async fn presign(&self, upload_id: &str, key: &str, part_number: u32) -> Result<String>;

    /// 直传分片到预签名 URL，返回完整性标签
    async fn put_part(
        &self,
        url: &str,
        part_number: u32,
        data: Vec<u8>,
        progress: Option<ProgressFn>,
    ) -> Result<String>;

    /// 经服务端中转上传分片，返回完整性标签
    async fn upload_chunk(
        &self,
        upload_id: &str,
        key: &str,
        part_number: u32,
        data: Vec<u8>,
        progress: Option<ProgressFn>,
    ) -> Result<String>;

    /// 完成多分片会话（分片列表须按序号升序）
    async fn complete(
        &self,
        upload_id: &str,
        key: &str,
        parts: Vec<CompletedPart>,
        filename: &str,
        size: u64,
        content_type: &str,
    ) -> Result<()>;

    /// 中止多分片会话（尽力而为，响应内容被忽略）
    async fn abort(&self, upload_id: &str) -> Result<()>;

    /// 小文件单请求上传
    async fn simple_upload(
        &self,
        filename: &str,
        content_type: &str,
        data: Vec<u8>,
        progress: Option<ProgressFn>,
    ) -> Result<()>;

    /// 唤醒远程工作节点（冷启动 ping）
    async fn wake_worker(&self) -> Result<()>;
}

/// 对象存储客户端
#[derive(Debug, Clone)]
pub struct StorageClient {
    /// HTTP客户端
    client: Client,
    /// 存储配置
    config: StorageConfig,
}

impl StorageClient {
    /// 创建新的存储客户端
    pub fn new(config: StorageConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("构建 HTTP 客户端失败")?;

        Ok(Self { client, config })
    }

    /// API 端点 URL
    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base_url.trim_end_matches('/'), path)
    }

    /// 中转分片 URL（元数据走查询参数，文件体走 multipart）
    fn chunk_url(&self, upload_id: &str, key: &str, part_number: u32) -> String {
        format!(
            "{}?uploadId={}&key={}&partNumber={}",
            self.endpoint("chunk"),
            urlencoding::encode(upload_id),
            urlencoding::encode(key),
            part_number
        )
    }
}

/// 把分片数据包装成带进度回调的流
///
/// 每次被拉取一个切片就回调一次累计字节数，字节在写入套接字前后被计数，
/// 精度对进度条足够
fn piece_stream(
    data: Vec<u8>,
    progress: Option<ProgressFn>,
) -> impl Stream<Item = std::result::Result<Vec<u8>, std::io::Error>> + Send {
    futures::stream::unfold((data, 0usize), move |(data, offset)| {
        let progress = progress.clone();
        async move {
            if offset >= data.len() {
                return None;
            }
            let end = (offset + PROGRESS_PIECE_SIZE).min(data.len());
            let piece = data[offset..end].to_vec();
            if let Some(cb) = &progress {
                cb(end as u64);
            }
            Some((Ok(piece), (data, end)))
        }
    })
}

/// 构建带进度回调的请求体
fn progress_body(data: Vec<u8>, progress: Option<ProgressFn>) -> reqwest::Body {
    reqwest::Body::wrap_stream(piece_stream(data, progress))
}

/// 计算 Content-MD5 头的值（原始摘要的 base64）
fn content_md5(data: &[u8]) -> String {
    let digest = md5::compute(data);
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, digest.0)
}

#[async_trait]
impl StorageApi for StorageClient {
    async fn initiate(&self, filename: &str, content_type: &str) -> Result<(String, String)> {
        info!("发起多分片会话: filename={}, type={}", filename, content_type);

        let request = InitiateRequest {
            filename: filename.to_string(),
            content_type: content_type.to_string(),
        };

        let response = self
            .client
            .post(self.endpoint("initiate"))
            .json(&request)
            .send()
            .await
            .context("initiate 请求发送失败")?;

        let status = response.status();
        let response_text = response.text().await.context("读取 initiate 响应失败")?;

        debug!("initiate 响应: status={}, body={}", status, response_text);

        let initiate_response: InitiateResponse = serde_json::from_str(&response_text)
            .with_context(|| {
                format!("解析 initiate 响应失败: status={}, body={}", status, response_text)
            })?;

        if !initiate_response.is_success() {
            error!(
                "initiate 失败: status={}, error={}",
                status, initiate_response.error
            );
            anyhow::bail!("initiate 失败: {}", initiate_response.error);
        }

        info!(
            "会话已建立: uploadId={}..., key={}",
            &initiate_response.upload_id[..8.min(initiate_response.upload_id.len())],
            initiate_response.key
        );

        Ok((initiate_response.upload_id, initiate_response.key))
    }

    async fn presign(&self, upload_id: &str, key: &str, part_number: u32) -> Result<String> {
        let request = PresignRequest {
            upload_id: upload_id.to_string(),
            key: key.to_string(),
            part_number,
        };

        let response = self
            .client
            .post(self.endpoint("presign"))
            .json(&request)
            .send()
            .await
            .context("presign 请求发送失败")?;

        let status = response.status();
        let response_text = response.text().await.context("读取 presign 响应失败")?;

        let presign_response: PresignResponse = serde_json::from_str(&response_text)
            .with_context(|| {
                format!("解析 presign 响应失败: status={}, body={}", status, response_text)
            })?;

        if !presign_response.is_success() {
            anyhow::bail!(
                "presign 失败: part={}, error={}",
                part_number,
                presign_response.error
            );
        }

        Ok(presign_response.url)
    }

    async fn put_part(
        &self,
        url: &str,
        part_number: u32,
        data: Vec<u8>,
        progress: Option<ProgressFn>,
    ) -> Result<String> {
        let part_size = data.len();
        let md5_header = content_md5(&data);

        debug!(
            "直传分片: part={}, size={}, md5={}",
            part_number,
            part_size,
            hex::encode(md5::compute(&data).0)
        );

        let response = self
            .client
            .put(url)
            .header(CONTENT_LENGTH, part_size)
            .header("Content-MD5", md5_header)
            .body(progress_body(data, progress))
            .send()
            .await
            .with_context(|| format!("分片 {} PUT 请求发送失败", part_number))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("分片 {} PUT 失败: HTTP {}", part_number, status);
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if etag.is_empty() {
            anyhow::bail!("分片 {} 响应缺少 ETag", part_number);
        }

        Ok(etag)
    }

    async fn upload_chunk(
        &self,
        upload_id: &str,
        key: &str,
        part_number: u32,
        data: Vec<u8>,
        progress: Option<ProgressFn>,
    ) -> Result<String> {
        let part_size = data.len();

        info!(
            "中转分片: uploadId={}..., part={}, size={}",
            &upload_id[..8.min(upload_id.len())],
            part_number,
            part_size
        );

        let url = self.chunk_url(upload_id, key, part_number);

        let part = multipart::Part::stream_with_length(
            progress_body(data, progress),
            part_size as u64,
        )
        .file_name("chunk")
        .mime_str("application/octet-stream")?;

        let form = multipart::Form::new().part("chunk", part);

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("分片 {} 中转请求发送失败", part_number))?;

        let status = response.status();
        let response_text = response.text().await.context("读取分片响应失败")?;

        debug!(
            "中转分片响应: part={}, status={}, body={}",
            part_number, status, response_text
        );

        let chunk_response: ChunkResponse =
            serde_json::from_str(&response_text).with_context(|| {
                format!("解析分片响应失败: status={}, body={}", status, response_text)
            })?;

        if !chunk_response.is_success() {
            if chunk_response.etag.is_empty() && chunk_response.error.is_empty() {
                anyhow::bail!("分片 {} 响应缺少 ETag", part_number);
            }
            anyhow::bail!(
                "分片 {} 中转失败: status={}, error={}",
                part_number,
                status,
                chunk_response.error
            );
        }

        Ok(chunk_response.etag)
    }

    async fn complete(
        &self,
        upload_id: &str,
        key: &str,
        parts: Vec<CompletedPart>,
        filename: &str,
        size: u64,
        content_type: &str,
    ) -> Result<()> {
        info!(
            "完成多分片会话: uploadId={}..., parts={}, filename={}",
            &upload_id[..8.min(upload_id.len())],
            parts.len(),
            filename
        );

        let request = CompleteRequest {
            upload_id: upload_id.to_string(),
            key: key.to_string(),
            parts,
            filename: filename.to_string(),
            size,
            content_type: content_type.to_string(),
        };

        let response = self
            .client
            .post(self.endpoint("complete"))
            .json(&request)
            .send()
            .await
            .context("complete 请求发送失败")?;

        let status = response.status();
        let response_text = response.text().await.context("读取 complete 响应失败")?;

        debug!("complete 响应: status={}, body={}", status, response_text);

        let complete_response: crate::storage::types::CompleteResponse =
            serde_json::from_str(&response_text).with_context(|| {
                format!("解析 complete 响应失败: status={}, body={}", status, response_text)
            })?;

        if !complete_response.is_success() {
            error!(
                "complete 失败: status={}, error={}",
                status, complete_response.error
            );
            anyhow::bail!("complete 失败: {}", complete_response.error);
        }

        Ok(())
    }

    async fn abort(&self, upload_id: &str) -> Result<()> {
        let request = AbortRequest {
            upload_id: upload_id.to_string(),
        };

        let response = self
            .client
            .post(self.endpoint("abort"))
            .json(&request)
            .send()
            .await
            .context("abort 请求发送失败")?;

        // 尽力而为：只记录状态，不解析响应体
        debug!(
            "abort 响应: uploadId={}..., status={}",
            &upload_id[..8.min(upload_id.len())],
            response.status()
        );

        Ok(())
    }

    async fn simple_upload(
        &self,
        filename: &str,
        content_type: &str,
        data: Vec<u8>,
        progress: Option<ProgressFn>,
    ) -> Result<()> {
        let total_size = data.len();

        info!("单请求上传: filename={}, size={}", filename, total_size);

        let part = multipart::Part::stream_with_length(
            progress_body(data, progress),
            total_size as u64,
        )
        .file_name(filename.to_string())
        .mime_str(content_type)?;

        let form = multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(self.endpoint("simple-upload"))
            .multipart(form)
            .send()
            .await
            .context("simple-upload 请求发送失败")?;

        let status = response.status();
        let response_text = response.text().await.context("读取 simple-upload 响应失败")?;

        let upload_response: SimpleUploadResponse = serde_json::from_str(&response_text)
            .with_context(|| {
                format!(
                    "解析 simple-upload 响应失败: status={}, body={}",
                    status, response_text
                )
            })?;

        if !upload_response.is_success() {
            anyhow::bail!("simple-upload 失败: {}", upload_response.error);
        }

        Ok(())
    }

    async fn wake_worker(&self) -> Result<()> {
        let url = self
            .config
            .wake_url
            .clone()
            .unwrap_or_else(|| self.endpoint("wake"));

        info!(
            "唤醒远程工作节点: url={}, timeout={}s",
            url, self.config.wake_timeout_secs
        );

        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(self.config.wake_timeout_secs))
            .send()
            .await
            .context("唤醒请求发送失败")?;

        let status = response.status();
        if !status.is_success() {
            warn!("唤醒响应异常: HTTP {}", status);
            anyhow::bail!("唤醒远程工作节点失败: HTTP {}", status);
        }

        debug!("远程工作节点已就绪");
        Ok(())
    }
}

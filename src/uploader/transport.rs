// 分片传输策略
//
// 同一套编排逻辑按桶配置注入不同的分片传输实现：
// - DirectPresigned: 客户端直传对象存储（presign + PUT）
// - ServerProxied: 经服务端代理转发（multipart/form-data）
// - RemoteWorker: 经远端 worker 代理，首次使用前发送冷启动唤醒
//
// 策略按会话选定一次，不按分片切换

use crate::storage::{ProgressFn, StorageApi, TransportKind};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

/// 分片传输接口
#[async_trait]
pub trait PartTransport: Send + Sync {
    /// 策略名（用于日志）
    fn name(&self) -> &'static str;

    /// 上传开始前的一次性准备动作
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// 发送单个分片，返回完整性标签
    async fn send_part(
        &self,
        upload_id: &str,
        key: &str,
        part_number: u32,
        data: Vec<u8>,
        progress: Option<ProgressFn>,
    ) -> Result<String>;
}

/// 按桶配置选择传输策略
pub fn transport_for(kind: TransportKind, api: Arc<dyn StorageApi>) -> Arc<dyn PartTransport> {
    match kind {
        TransportKind::DirectPresigned => Arc::new(DirectPresignedTransport::new(api)),
        TransportKind::ServerProxied => Arc::new(ServerProxiedTransport::new(api)),
        TransportKind::RemoteWorker => Arc::new(RemoteWorkerTransport::new(api)),
    }
}

/// 直传策略：每个分片先取预签名 URL，再 PUT 到对象存储
pub struct DirectPresignedTransport {
    api: Arc<dyn StorageApi>,
}

impl DirectPresignedTransport {
    pub fn new(api: Arc<dyn StorageApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl PartTransport for DirectPresignedTransport {
    fn name(&self) -> &'static str {
        "direct_presigned"
    }

    async fn send_part(
        &self,
        upload_id: &str,
        key: &str,
        part_number: u32,
        data: Vec<u8>,
        progress: Option<ProgressFn>,
    ) -> Result<String> {
        let url = self.api.presign(upload_id, key, part_number).await?;
        self.api.put_part(&url, part_number, data, progress).await
    }
}

/// 代理策略：分片经服务端 chunk 接口转发（存储后端不支持预签名时使用）
pub struct ServerProxiedTransport {
    api: Arc<dyn StorageApi>,
}

impl ServerProxiedTransport {
    pub fn new(api: Arc<dyn StorageApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl PartTransport for ServerProxiedTransport {
    fn name(&self) -> &'static str {
        "server_proxied"
    }

    async fn send_part(
        &self,
        upload_id: &str,
        key: &str,
        part_number: u32,
        data: Vec<u8>,
        progress: Option<ProgressFn>,
    ) -> Result<String> {
        self.api
            .upload_chunk(upload_id, key, part_number, data, progress)
            .await
    }
}

/// worker 策略：分片经远端 worker 代理转发
///
/// worker 可能处于休眠，首次使用前发送一次唤醒请求（60 秒级超时），
/// 同一实例内只唤醒一次，并发调用也只发一个请求
pub struct RemoteWorkerTransport {
    api: Arc<dyn StorageApi>,
    woken: OnceCell<()>,
}

impl RemoteWorkerTransport {
    pub fn new(api: Arc<dyn StorageApi>) -> Self {
        Self {
            api,
            woken: OnceCell::new(),
        }
    }
}

#[async_trait]
impl PartTransport for RemoteWorkerTransport {
    fn name(&self) -> &'static str {
        "remote_worker"
    }

    async fn prepare(&self) -> Result<()> {
        self.woken
            .get_or_try_init(|| async {
                info!("[分片传输] worker 冷启动唤醒");
                self.api.wake_worker().await
            })
            .await?;
        Ok(())
    }

    async fn send_part(
        &self,
        upload_id: &str,
        key: &str,
        part_number: u32,
        data: Vec<u8>,
        progress: Option<ProgressFn>,
    ) -> Result<String> {
        self.api
            .upload_chunk(upload_id, key, part_number, data, progress)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CompletedPart;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 记录调用轨迹的存储 API 桩
    struct RecordingApi {
        calls: Mutex<Vec<String>>,
        wake_count: AtomicUsize,
    }

    impl RecordingApi {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                wake_count: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl StorageApi for RecordingApi {
        async fn initiate(&self, _filename: &str, _content_type: &str) -> Result<(String, String)> {
            Ok(("uid".to_string(), "key".to_string()))
        }

        async fn presign(&self, _upload_id: &str, _key: &str, part_number: u32) -> Result<String> {
            self.calls.lock().push(format!("presign:{}", part_number));
            Ok(format!("https://signed.example/{}", part_number))
        }

        async fn put_part(
            &self,
            url: &str,
            part_number: u32,
            _data: Vec<u8>,
            _progress: Option<ProgressFn>,
        ) -> Result<String> {
            self.calls.lock().push(format!("put:{}:{}", part_number, url));
            Ok(format!("etag-{}", part_number))
        }

        async fn upload_chunk(
            &self,
            _upload_id: &str,
            _key: &str,
            part_number: u32,
            _data: Vec<u8>,
            _progress: Option<ProgressFn>,
        ) -> Result<String> {
            self.calls.lock().push(format!("chunk:{}", part_number));
            Ok(format!("etag-{}", part_number))
        }

        async fn complete(
            &self,
            _upload_id: &str,
            _key: &str,
            _parts: Vec<CompletedPart>,
            _filename: &str,
            _size: u64,
            _content_type: &str,
        ) -> Result<()> {
            Ok(())
        }

        async fn abort(&self, _upload_id: &str) -> Result<()> {
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
            self.wake_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_direct_presigned_routes_presign_then_put() {
        let api = Arc::new(RecordingApi::new());
        let transport = DirectPresignedTransport::new(api.clone());

        transport.prepare().await.unwrap();
        let etag = transport
            .send_part("uid", "key", 3, vec![1, 2, 3], None)
            .await
            .unwrap();

        assert_eq!(etag, "etag-3");
        assert_eq!(
            api.calls(),
            vec![
                "presign:3".to_string(),
                "put:3:https://signed.example/3".to_string()
            ]
        );
        // 直传策略不需要唤醒
        assert_eq!(api.wake_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_server_proxied_routes_chunk() {
        let api = Arc::new(RecordingApi::new());
        let transport = ServerProxiedTransport::new(api.clone());

        let etag = transport
            .send_part("uid", "key", 2, vec![0u8; 8], None)
            .await
            .unwrap();

        assert_eq!(etag, "etag-2");
        assert_eq!(api.calls(), vec!["chunk:2".to_string()]);
    }

    #[tokio::test]
    async fn test_remote_worker_wakes_once() {
        let api = Arc::new(RecordingApi::new());
        let transport = RemoteWorkerTransport::new(api.clone());

        transport.prepare().await.unwrap();
        transport.prepare().await.unwrap();
        assert_eq!(api.wake_count.load(Ordering::SeqCst), 1);

        let etag = transport
            .send_part("uid", "key", 1, vec![9u8; 4], None)
            .await
            .unwrap();
        assert_eq!(etag, "etag-1");
        assert_eq!(api.calls(), vec!["chunk:1".to_string()]);
    }

    #[tokio::test]
    async fn test_remote_worker_concurrent_prepare_dedup() {
        let api = Arc::new(RecordingApi::new());
        let transport = Arc::new(RemoteWorkerTransport::new(api.clone()));

        let (a, b) = tokio::join!(transport.prepare(), transport.prepare());
        a.unwrap();
        b.unwrap();

        assert_eq!(api.wake_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_for_mapping() {
        let api: Arc<dyn StorageApi> = Arc::new(RecordingApi::new());

        let t = transport_for(TransportKind::DirectPresigned, api.clone());
        assert_eq!(t.name(), "direct_presigned");

        let t = transport_for(TransportKind::ServerProxied, api.clone());
        assert_eq!(t.name(), "server_proxied");

        let t = transport_for(TransportKind::RemoteWorker, api);
        assert_eq!(t.name(), "remote_worker");
    }
}

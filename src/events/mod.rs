//! 事件模块
//!
//! 定义上传事件类型和相关工具
//! - `types.rs`: 任务事件类型与带时间戳的信封
//! - `throttle.rs`: 事件节流工具，控制进度事件的发布频率

mod throttle;
mod types;

pub use throttle::*;
pub use types::*;

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// 默认广播通道容量
const DEFAULT_BUS_CAPACITY: usize = 1024;

/// 事件总线
///
/// 基于 tokio broadcast 通道的发布订阅封装，上层应用通过 `subscribe()`
/// 接收任务事件；没有订阅者时发布操作静默丢弃
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<TimestampedEvent>,
    next_event_id: AtomicU64,
}

impl EventBus {
    /// 创建指定容量的事件总线
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            next_event_id: AtomicU64::new(1),
        }
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> broadcast::Receiver<TimestampedEvent> {
        self.sender.subscribe()
    }

    /// 发布事件
    ///
    /// 自动分配递增的事件 ID；通道无接收者时返回错误会被忽略
    pub fn publish(&self, event: UploadEvent) {
        let event_id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.sender.send(TimestampedEvent::new(event_id, event));
    }

    /// 当前订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

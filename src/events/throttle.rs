//! 进度事件节流器
//!
//! 控制进度事件的发布频率，避免事件风暴
//! 上传分片并发回调密集，建议间隔 200-250ms

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 进度事件节流器
///
/// 线程安全的时间节流器，使用原子 CAS 避免锁竞争
/// 典型用法：每次进度回调时调用 `should_emit()`，返回 true 时才发布事件；
/// 任务完成时调用 `force_emit()` 保证最终进度不被吞掉
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 上次发布事件的时间戳（纳秒，0 表示从未发布）
    last_emit_nanos: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
}

impl ProgressThrottler {
    /// 创建新的节流器
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit_nanos: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    /// 使用指定毫秒间隔创建节流器
    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 检查是否应该发布事件
    ///
    /// 首次调用总是返回 true；之后距上次发布超过节流间隔才返回 true，
    /// 并用 CAS 更新时间戳，被其他线程抢先更新时本次不发布
    pub fn should_emit(&self) -> bool {
        let now_nanos = Self::current_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        // last == 0 表示从未发布过，首个进度事件直接放行
        if last != 0 && now_nanos.saturating_sub(last) < self.interval_nanos {
            return false;
        }

        self.last_emit_nanos
            .compare_exchange_weak(last, now_nanos, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制发布（用于最后一次更新或完成时）
    ///
    /// 不检查时间间隔，直接更新时间戳并返回 true
    pub fn force_emit(&self) -> bool {
        self.last_emit_nanos
            .store(Self::current_nanos(), Ordering::Relaxed);
        true
    }

    /// 重置节流器状态（任务重试后从头计时）
    pub fn reset(&self) {
        self.last_emit_nanos.store(0, Ordering::Relaxed);
    }

    /// 获取当前时间的纳秒表示
    ///
    /// 使用进程内单调时钟，避免系统时钟跳变影响；+1 确保返回值不为 0
    fn current_nanos() -> u64 {
        use std::sync::OnceLock;
        static START: OnceLock<Instant> = OnceLock::new();
        START
            .get_or_init(Instant::now)
            .elapsed()
            .as_nanos() as u64
            + 1
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}

impl Clone for ProgressThrottler {
    fn clone(&self) -> Self {
        Self {
            last_emit_nanos: AtomicU64::new(self.last_emit_nanos.load(Ordering::Relaxed)),
            interval_nanos: self.interval_nanos,
        }
    }
}

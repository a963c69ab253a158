//! 进度事件节流器
//!
//! 控制单个下载任务进度事件的发布频率，状态变更事件不经过节流。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 进度事件节流器
///
/// 多个分片线程共享同一个节流器，时间戳用原子量维护。
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 计时起点
    origin: Instant,
    /// 上次发布事件的时间（相对起点的纳秒，0 表示从未发布）
    last_emit_nanos: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
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
    /// 距离上次发布超过节流间隔时返回 true 并更新时间戳
    pub fn should_emit(&self) -> bool {
        // +1 保证第一次调用时 now 不为 0
        let now = self.origin.elapsed().as_nanos() as u64 + 1;
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last != 0 && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }
        // 被其他线程抢先更新时本次不发布
        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制发布（完成或暂停时的最后一次更新）
    pub fn force_emit(&self) -> bool {
        let now = self.origin.elapsed().as_nanos() as u64 + 1;
        self.last_emit_nanos.store(now, Ordering::Relaxed);
        true
    }

    /// 重置节流器状态
    pub fn reset(&self) {
        self.last_emit_nanos.store(0, Ordering::Relaxed);
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}

use rand::Rng;
use std::time::Duration;

/// 自动重试策略
///
/// 退避时间随 `retry_count` 指数增长并封顶，附带少量随机抖动避免多个任务同时重试。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 首次重试的基础延迟
    pub base_delay: Duration,
    /// 最大延迟
    pub max_delay: Duration,
    /// 抖动比例（0.0 - 1.0）
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter_ratio: 0.1,
        }
    }

    /// 关闭抖动
    pub fn without_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }

    /// 是否还能自动重试
    pub fn should_retry(retry_count: u32, max_retries: u32) -> bool {
        retry_count < max_retries
    }

    /// 第 `retry_count` 次重试（从 1 开始）前的等待时间
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(20);
        let base_ms = self.base_delay.as_millis() as u64;
        let delay_ms = base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay.as_millis() as u64);

        let jitter_range = (delay_ms as f64 * self.jitter_ratio.clamp(0.0, 1.0)) as u64;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..=jitter_range)
        } else {
            0
        };

        Duration::from_millis(delay_ms + jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_with_cap() {
        let policy =
            RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(1000)).without_jitter();

        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff_delay(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(Duration::from_millis(1000), Duration::from_secs(60));
        for _ in 0..100 {
            let delay = policy.backoff_delay(1);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1100));
        }
    }

    #[test]
    fn test_should_retry() {
        assert!(RetryPolicy::should_retry(0, 3));
        assert!(RetryPolicy::should_retry(2, 3));
        assert!(!RetryPolicy::should_retry(3, 3));
        assert!(!RetryPolicy::should_retry(0, 0));
    }
}

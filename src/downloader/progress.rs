use std::collections::VecDeque;
use std::time::Instant;

/// 默认滑动窗口: 5 秒
pub const DEFAULT_WINDOW_SECS: u64 = 5;

/// 速度计算器
///
/// 按 1 秒分桶统计字节数，取最近若干秒的平均值。只用于展示，不参与限速。
#[derive(Debug, Clone)]
pub struct SpeedCalculator {
    /// (秒序号, 字节数)
    buckets: VecDeque<(u64, u64)>,
    /// 窗口长度（秒）
    window_secs: u64,
    /// 计时起点
    origin: Instant,
}

impl SpeedCalculator {
    pub fn new(window_secs: u64) -> Self {
        Self::with_origin(window_secs, Instant::now())
    }

    pub fn with_origin(window_secs: u64, origin: Instant) -> Self {
        Self {
            buckets: VecDeque::new(),
            window_secs: window_secs.max(1),
            origin,
        }
    }

    /// 记录新下载的字节
    pub fn add_sample(&mut self, bytes: u64) {
        self.add_sample_at(bytes, Instant::now());
    }

    pub fn add_sample_at(&mut self, bytes: u64, at: Instant) {
        let second = self.second_of(at);
        match self.buckets.back_mut() {
            Some((last, total)) if *last == second => *total += bytes,
            _ => self.buckets.push_back((second, bytes)),
        }
        self.prune(second);
    }

    /// 当前速度 (bytes/s)
    pub fn speed(&mut self) -> u64 {
        self.speed_at(Instant::now())
    }

    pub fn speed_at(&mut self, now: Instant) -> u64 {
        let second = self.second_of(now);
        self.prune(second);
        let total: u64 = self.buckets.iter().map(|(_, bytes)| bytes).sum();
        // 刚启动时按实际经过的秒数平均
        let span = self.window_secs.min(second + 1);
        total / span
    }

    /// 清空统计
    pub fn reset(&mut self) {
        self.buckets.clear();
        self.origin = Instant::now();
    }

    fn second_of(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.origin).as_secs()
    }

    fn prune(&mut self, current_second: u64) {
        let oldest = current_second.saturating_sub(self.window_secs - 1);
        while matches!(self.buckets.front(), Some((s, _)) if *s < oldest) {
            self.buckets.pop_front();
        }
    }
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_speed_averages_over_window() {
        let origin = Instant::now();
        let mut calc = SpeedCalculator::with_origin(5, origin);

        for i in 0..5 {
            calc.add_sample_at(1000, origin + secs(i));
        }
        assert_eq!(calc.speed_at(origin + secs(4)), 1000);
    }

    #[test]
    fn test_speed_during_warmup() {
        let origin = Instant::now();
        let mut calc = SpeedCalculator::with_origin(5, origin);

        calc.add_sample_at(600, origin);
        calc.add_sample_at(600, origin + Duration::from_millis(500));
        // 只经过 1 秒，不应被 5 秒窗口稀释
        assert_eq!(calc.speed_at(origin + Duration::from_millis(900)), 1200);
    }

    #[test]
    fn test_old_buckets_expire() {
        let origin = Instant::now();
        let mut calc = SpeedCalculator::with_origin(2, origin);

        calc.add_sample_at(5000, origin);
        assert_eq!(calc.speed_at(origin + secs(10)), 0);
    }
}

//! 带宽分配器
//!
//! 全局带宽预算只有一个持有者：每个调度 tick 串行地重新计算一次分配，
//! 然后把本 tick 的字节配额写入各任务的配额桶，分片线程只从桶里取配额。
//! 下载 / 上传两个方向独立计算，0 表示不限速。

use crate::error::{EngineError, EngineResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::task::{BandwidthLimit, Priority};

/// 参与分配的活跃任务
#[derive(Debug, Clone)]
pub struct ActiveTransfer {
    pub id: String,
    pub priority: Priority,
    pub limit: BandwidthLimit,
    /// 下载方向是否有在途分片
    pub downloading: bool,
    /// 上传方向是否在做种
    pub uploading: bool,
}

/// 单个任务的速率分配 (bytes/s)，None 表示不限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Allocation {
    pub download: Option<u64>,
    pub upload: Option<u64>,
}

/// 分配请求
#[derive(Debug, Clone, Copy)]
pub struct ShareRequest {
    pub weight: u64,
    pub cap: Option<u64>,
    /// 空闲任务不占份额，其份额在本 tick 内重新分配
    pub busy: bool,
}

/// 按优先级加权的注水分配
///
/// 高优先级权重更大；某任务的份额超过自身上限时，只给上限，余量在其余任务中重新分配。
/// 保证：分配之和不超过 `ceiling`（`ceiling > 0` 时），每个任务不超过自身上限。
pub fn weighted_shares(ceiling: u64, requests: &[ShareRequest]) -> Vec<Option<u64>> {
    if ceiling == 0 {
        return requests.iter().map(|r| r.cap).collect();
    }

    let mut shares: Vec<Option<u64>> = vec![Some(0); requests.len()];
    let mut open: Vec<usize> = (0..requests.len()).filter(|&i| requests[i].busy).collect();
    let mut remaining = ceiling;

    loop {
        if open.is_empty() || remaining == 0 {
            break;
        }
        let total_weight: u128 = open.iter().map(|&i| requests[i].weight.max(1) as u128).sum();
        let fair = |i: usize| -> u64 {
            (remaining as u128 * requests[i].weight.max(1) as u128 / total_weight) as u64
        };

        // 先固定那些上限低于公平份额的任务
        let saturated: Vec<usize> = open
            .iter()
            .copied()
            .filter(|&i| matches!(requests[i].cap, Some(cap) if cap <= fair(i)))
            .collect();

        if saturated.is_empty() {
            let mut handed_out = 0u64;
            for &i in &open {
                let share = fair(i);
                shares[i] = Some(share);
                handed_out += share;
            }
            // 整数除法的余数按顺序补给仍有余量的任务
            let mut leftover = remaining - handed_out;
            for &i in &open {
                if leftover == 0 {
                    break;
                }
                let current = shares[i].unwrap_or(0);
                let room = requests[i].cap.map_or(u64::MAX, |cap| cap - current);
                let extra = leftover.min(room).min(1);
                shares[i] = Some(current + extra);
                leftover -= extra;
            }
            break;
        }

        for &i in &saturated {
            let cap = requests[i].cap.unwrap_or(0);
            shares[i] = Some(cap);
            remaining -= cap;
        }
        open.retain(|i| !saturated.contains(i));
    }

    shares
}

/// 单方向配额桶
#[derive(Debug)]
pub struct QuotaBucket {
    remaining: AtomicU64,
    unlimited: AtomicBool,
    /// 上次重算以来是否有分片线程来取过配额
    demanded: AtomicBool,
    notify: Notify,
}

impl QuotaBucket {
    fn new() -> Self {
        Self {
            remaining: AtomicU64::new(0),
            unlimited: AtomicBool::new(false),
            demanded: AtomicBool::new(true),
            notify: Notify::new(),
        }
    }

    /// 读取并清除取用标记
    fn take_demand(&self) -> bool {
        self.demanded.swap(false, Ordering::SeqCst)
    }

    /// 写入本 tick 的配额（不累积上一 tick 的剩余）
    fn refill(&self, per_tick: Option<u64>) {
        match per_tick {
            None => self.unlimited.store(true, Ordering::SeqCst),
            Some(bytes) => {
                self.remaining.store(bytes, Ordering::SeqCst);
                self.unlimited.store(false, Ordering::SeqCst);
            }
        }
        self.notify.notify_waiters();
    }

    fn try_take(&self, want: u64) -> Option<u64> {
        if self.unlimited.load(Ordering::SeqCst) {
            return Some(want);
        }
        let mut current = self.remaining.load(Ordering::SeqCst);
        while current > 0 {
            let grant = current.min(want);
            match self.remaining.compare_exchange_weak(
                current,
                current - grant,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(grant),
                Err(actual) => current = actual,
            }
        }
        None
    }

    /// 取得至多 `want` 字节的配额，配额耗尽时等待下一个 tick
    pub async fn acquire(&self, want: u64, cancel: &CancellationToken) -> EngineResult<u64> {
        if want == 0 {
            return Ok(0);
        }
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.demanded.store(true, Ordering::SeqCst);
            if let Some(granted) = self.try_take(want) {
                return Ok(granted);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        }
    }

    /// 唤醒所有等待者（取消时调用）
    fn wake(&self) {
        self.notify.notify_waiters();
    }
}

/// 单个任务的配额（下载 / 上传）
#[derive(Debug)]
pub struct TransferQuota {
    pub download: QuotaBucket,
    pub upload: QuotaBucket,
}

impl TransferQuota {
    fn new() -> Self {
        Self {
            download: QuotaBucket::new(),
            upload: QuotaBucket::new(),
        }
    }
}

/// 按 tick 取整后留到下一 tick 的零头（单位: 千分之一字节）
#[derive(Debug, Clone, Copy, Default)]
struct TickCarry {
    download: u128,
    upload: u128,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Download,
    Upload,
}

/// 带宽分配器
#[derive(Debug)]
pub struct BandwidthAllocator {
    /// 全局下载上限 (bytes/s)
    download_ceiling: u64,
    /// 全局上传上限 (bytes/s)
    upload_ceiling: u64,
    /// tick 间隔
    tick: Duration,
    /// 各任务配额桶
    quotas: HashMap<String, Arc<TransferQuota>>,
    /// 上一次的分配结果
    last: HashMap<String, Allocation>,
    /// 各任务的取整零头
    carries: HashMap<String, TickCarry>,
    /// 全局上限的取整零头
    ceiling_carry: TickCarry,
}

impl BandwidthAllocator {
    pub fn new(download_ceiling: u64, upload_ceiling: u64, tick: Duration) -> Self {
        Self {
            download_ceiling,
            upload_ceiling,
            tick,
            quotas: HashMap::new(),
            last: HashMap::new(),
            carries: HashMap::new(),
            ceiling_carry: TickCarry::default(),
        }
    }

    pub fn set_ceilings(&mut self, download: u64, upload: u64) {
        self.download_ceiling = download;
        self.upload_ceiling = upload;
    }

    pub fn ceilings(&self) -> (u64, u64) {
        (self.download_ceiling, self.upload_ceiling)
    }

    /// 获取（或创建）任务的配额桶
    pub fn quota_for(&mut self, id: &str) -> Arc<TransferQuota> {
        self.quotas
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(TransferQuota::new()))
            .clone()
    }

    /// 任务离开活跃集合时释放配额
    pub fn release(&mut self, id: &str) {
        if let Some(quota) = self.quotas.remove(id) {
            quota.download.wake();
            quota.upload.wake();
        }
        self.last.remove(id);
        self.carries.remove(id);
    }

    /// 上一次的分配结果
    pub fn allocation(&self, id: &str) -> Option<Allocation> {
        self.last.get(id).copied()
    }

    /// 重新计算分配并写入配额桶
    ///
    /// 上一 tick 没有来取配额的方向（例如卡在网络上的任务）视为空闲，其份额让给其他任务。
    pub fn recompute(&mut self, active: &[ActiveTransfer]) -> HashMap<String, Allocation> {
        let mut download_requests = Vec::with_capacity(active.len());
        let mut upload_requests = Vec::with_capacity(active.len());
        for t in active {
            let quota = self.quota_for(&t.id);
            let (download_demand, upload_demand) =
                (quota.download.take_demand(), quota.upload.take_demand());
            download_requests.push(ShareRequest {
                weight: t.priority.weight(),
                cap: t.limit.download_cap(),
                busy: t.downloading && download_demand,
            });
            upload_requests.push(ShareRequest {
                weight: t.priority.weight(),
                cap: t.limit.upload_cap(),
                busy: t.uploading && upload_demand,
            });
        }

        let downloads = weighted_shares(self.download_ceiling, &download_requests);
        let uploads = weighted_shares(self.upload_ceiling, &upload_requests);
        let download_ticks = self.tick_quotas(active, &downloads, Direction::Download);
        let upload_ticks = self.tick_quotas(active, &uploads, Direction::Upload);

        let mut result = HashMap::with_capacity(active.len());
        for (i, transfer) in active.iter().enumerate() {
            let allocation = Allocation {
                download: downloads[i],
                upload: uploads[i],
            };
            let quota = self.quota_for(&transfer.id);
            quota.download.refill(download_ticks[i]);
            quota.upload.refill(upload_ticks[i]);
            result.insert(transfer.id.clone(), allocation);
        }

        // 不再活跃的任务
        let stale: Vec<String> = self
            .quotas
            .keys()
            .filter(|id| !result.contains_key(*id))
            .cloned()
            .collect();
        for id in stale {
            self.release(&id);
        }

        debug!(
            "带宽重新分配: 活跃任务={}, 下载上限={}, 上传上限={}",
            active.len(),
            self.download_ceiling,
            self.upload_ceiling
        );
        self.last = result.clone();
        result
    }

    /// 速率换算为本 tick 的字节配额
    ///
    /// 向下取整，零头留到下一 tick；有全局上限时各任务配额之和不超过本 tick 的全局预算，
    /// 超出的部分同样记为零头顺延。
    fn tick_quotas(
        &mut self,
        active: &[ActiveTransfer],
        rates: &[Option<u64>],
        direction: Direction,
    ) -> Vec<Option<u64>> {
        let tick_ms = self.tick.as_millis();
        let mut quotas = Vec::with_capacity(active.len());
        let mut granted: u128 = 0;

        for (transfer, rate) in active.iter().zip(rates) {
            let Some(rate) = *rate else {
                quotas.push(None);
                continue;
            };
            let carry = carry_mut(self.carries.entry(transfer.id.clone()).or_default(), direction);
            if rate == 0 {
                *carry = 0;
                quotas.push(Some(0));
                continue;
            }
            let owed = rate as u128 * tick_ms + *carry;
            *carry = owed % 1000;
            granted += owed / 1000;
            quotas.push(Some((owed / 1000) as u64));
        }

        let ceiling = match direction {
            Direction::Download => self.download_ceiling,
            Direction::Upload => self.upload_ceiling,
        };
        if ceiling == 0 {
            return quotas;
        }

        let global = carry_mut(&mut self.ceiling_carry, direction);
        let budget_owed = ceiling as u128 * tick_ms + *global;
        let budget = budget_owed / 1000;
        *global = budget_owed % 1000;

        // 从后往前削减，削掉的字节记入该任务的零头
        let mut excess = granted.saturating_sub(budget);
        for (i, transfer) in active.iter().enumerate().rev() {
            if excess == 0 {
                break;
            }
            let Some(Some(bytes)) = quotas.get_mut(i) else {
                continue;
            };
            let cut = excess.min(*bytes as u128);
            *bytes -= cut as u64;
            excess -= cut;
            if let Some(carry) = self.carries.get_mut(&transfer.id) {
                *carry_mut(carry, direction) += cut * 1000;
            }
        }
        quotas
    }
}

fn carry_mut(carry: &mut TickCarry, direction: Direction) -> &mut u128 {
    match direction {
        Direction::Download => &mut carry.download,
        Direction::Upload => &mut carry.upload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn transfer(id: &str, priority: Priority, limit: BandwidthLimit) -> ActiveTransfer {
        ActiveTransfer {
            id: id.to_string(),
            priority,
            limit,
            downloading: true,
            uploading: false,
        }
    }

    #[test]
    fn test_unlimited_everywhere() {
        let shares = weighted_shares(
            0,
            &[ShareRequest {
                weight: 2,
                cap: None,
                busy: true,
            }],
        );
        assert_eq!(shares, vec![None]);
    }

    #[test]
    fn test_per_download_cap_without_ceiling() {
        let mut allocator = BandwidthAllocator::new(0, 0, Duration::from_millis(100));
        let result = allocator.recompute(&[transfer(
            "a",
            Priority::Normal,
            BandwidthLimit::new(1000, 0),
        )]);
        assert_eq!(result["a"].download, Some(1000));
        assert_eq!(result["a"].upload, None);
    }

    #[test]
    fn test_priority_weighting() {
        let mut allocator = BandwidthAllocator::new(1200, 0, Duration::from_millis(100));
        let result = allocator.recompute(&[
            transfer("high", Priority::High, BandwidthLimit::default()),
            transfer("normal", Priority::Normal, BandwidthLimit::default()),
        ]);
        assert_eq!(result["high"].download, Some(800));
        assert_eq!(result["normal"].download, Some(400));
    }

    #[test]
    fn test_capped_share_is_redistributed() {
        let mut allocator = BandwidthAllocator::new(1000, 0, Duration::from_millis(100));
        let result = allocator.recompute(&[
            transfer("capped", Priority::Critical, BandwidthLimit::new(100, 0)),
            transfer("open", Priority::Low, BandwidthLimit::default()),
        ]);
        assert_eq!(result["capped"].download, Some(100));
        assert_eq!(result["open"].download, Some(900));
    }

    #[test]
    fn test_idle_download_gets_nothing() {
        let mut allocator = BandwidthAllocator::new(1000, 0, Duration::from_millis(100));
        let mut idle = transfer("idle", Priority::Critical, BandwidthLimit::default());
        idle.downloading = false;
        let result = allocator.recompute(&[
            idle,
            transfer("busy", Priority::Low, BandwidthLimit::default()),
        ]);
        assert_eq!(result["idle"].download, Some(0));
        assert_eq!(result["busy"].download, Some(1000));
    }

    #[test]
    fn test_stale_quota_released() {
        let mut allocator = BandwidthAllocator::new(1000, 0, Duration::from_millis(100));
        allocator.recompute(&[transfer("a", Priority::Normal, BandwidthLimit::default())]);
        allocator.recompute(&[]);
        assert!(allocator.allocation("a").is_none());
    }

    #[tokio::test]
    async fn test_quota_bucket_grants_per_tick() {
        let mut allocator = BandwidthAllocator::new(1000, 0, Duration::from_millis(100));
        let quota = allocator.quota_for("a");
        allocator.recompute(&[transfer("a", Priority::Normal, BandwidthLimit::default())]);

        let cancel = CancellationToken::new();
        // 1000 B/s * 100ms = 100 字节
        assert_eq!(quota.download.acquire(64, &cancel).await.unwrap(), 64);
        assert_eq!(quota.download.acquire(64, &cancel).await.unwrap(), 36);
        assert!(quota.download.try_take(1).is_none());
    }

    #[tokio::test]
    async fn test_quota_wait_is_cancellable() {
        let mut allocator = BandwidthAllocator::new(1000, 0, Duration::from_millis(100));
        let quota = allocator.quota_for("a");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = quota.download.acquire(10, &cancel).await;
        assert_eq!(result, Err(EngineError::Cancelled));
    }

    /// 一个 tick 内所有桶能取出的字节总数
    fn drain_all(quotas: &[Arc<TransferQuota>]) -> u64 {
        quotas
            .iter()
            .map(|q| q.download.try_take(u64::MAX).unwrap_or(0))
            .sum()
    }

    #[test]
    fn test_tick_quotas_never_exceed_ceiling() {
        let mut allocator = BandwidthAllocator::new(1000, 0, Duration::from_millis(100));
        let ids = ["a", "b", "c"];
        let quotas: Vec<_> = ids.iter().map(|id| allocator.quota_for(id)).collect();
        let active: Vec<_> = ids
            .iter()
            .map(|id| transfer(id, Priority::Normal, BandwidthLimit::default()))
            .collect();

        let mut total = 0;
        for _ in 0..10 {
            allocator.recompute(&active);
            let granted = drain_all(&quotas);
            assert!(granted <= 100, "单个 tick 发放了 {} 字节", granted);
            total += granted;
        }
        // 零头顺延，一秒内发放量接近上限
        assert!(total <= 1000);
        assert!(total >= 990);
    }

    #[test]
    fn test_tiny_ceiling_shared_by_many() {
        let mut allocator = BandwidthAllocator::new(10, 0, Duration::from_millis(100));
        let ids = ["a", "b", "c", "d", "e"];
        let quotas: Vec<_> = ids.iter().map(|id| allocator.quota_for(id)).collect();
        let active: Vec<_> = ids
            .iter()
            .map(|id| transfer(id, Priority::Normal, BandwidthLimit::default()))
            .collect();

        let mut total = 0;
        for _ in 0..20 {
            allocator.recompute(&active);
            let granted = drain_all(&quotas);
            assert!(granted <= 1);
            total += granted;
        }
        // 前几个 tick 只攒零头，之后每个 tick 发放全局预算内的 1 字节
        assert!(total <= 20);
        assert!(total >= 15);
    }

    #[tokio::test]
    async fn test_stalled_download_yields_share() {
        let mut allocator = BandwidthAllocator::new(1000, 0, Duration::from_millis(100));
        let active = [
            transfer("moving", Priority::Normal, BandwidthLimit::default()),
            transfer("stalled", Priority::Normal, BandwidthLimit::default()),
        ];
        let moving = allocator.quota_for("moving");
        let result = allocator.recompute(&active);
        assert_eq!(result["stalled"].download, Some(500));

        // 只有 moving 在取配额
        let cancel = CancellationToken::new();
        moving.download.acquire(10, &cancel).await.unwrap();
        let result = allocator.recompute(&active);
        assert_eq!(result["moving"].download, Some(1000));
        assert_eq!(result["stalled"].download, Some(0));
    }

    proptest! {
        #[test]
        fn prop_shares_respect_ceiling_and_caps(
            ceiling in 1u64..10_000_000,
            entries in proptest::collection::vec((1u64..9, proptest::option::of(1u64..5_000_000), any::<bool>()), 0..12),
        ) {
            let requests: Vec<ShareRequest> = entries
                .iter()
                .map(|&(weight, cap, busy)| ShareRequest { weight, cap, busy })
                .collect();
            let shares = weighted_shares(ceiling, &requests);

            let mut sum = 0u64;
            for (share, request) in shares.iter().zip(&requests) {
                let share = share.expect("有全局上限时不会出现不限速");
                if let Some(cap) = request.cap {
                    prop_assert!(share <= cap);
                }
                if !request.busy {
                    prop_assert_eq!(share, 0);
                }
                sum += share;
            }
            prop_assert!(sum <= ceiling);
        }
    }
}

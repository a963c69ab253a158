//! 单个下载任务的执行引擎
//!
//! 一个活跃任务对应一组分片线程：每个线程反复领取 Pending 分片、
//! 按配额拉取数据、写盘并校验。引擎本身不做状态迁移，只把每个阶段的
//! 结果交给管理器，由管理器按状态机推进。

use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bandwidth::{QuotaBucket, TransferQuota};
use super::progress::SpeedCalculator;
use super::segment::{Segment, SegmentManager, SegmentState};
use super::source::SegmentSource;
use super::storage::StorageLayout;
use super::task::{Download, SourceDescriptor};
use crate::error::{EngineError, EngineResult};
use crate::events::{DownloadEvent, EventBus, ProgressThrottler};
use crate::persistence::{RecordHandle, RecordStore};

/// 每累积 256KB 更新一次记录中的进度（减少锁竞争）
pub const PROGRESS_UPDATE_THRESHOLD: u64 = 256 * 1024;

/// 做种时没有上传请求的等待间隔
const SEED_IDLE_INTERVAL: Duration = Duration::from_millis(200);

/// 引擎参数
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// 普通下载的分片数
    pub default_segments: usize,
    /// 单个任务的最大分片线程数
    pub max_workers: usize,
    /// 单个分片的最大尝试次数
    pub max_segment_attempts: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_segments: 4,
            max_workers: 4,
            max_segment_attempts: 3,
        }
    }
}

/// 下载 / 上传速率统计
#[derive(Debug, Default)]
pub struct RateMeter {
    download: parking_lot::Mutex<SpeedCalculator>,
    upload: parking_lot::Mutex<SpeedCalculator>,
}

impl RateMeter {
    pub fn record_download(&self, bytes: u64) {
        self.download.lock().add_sample(bytes);
    }

    pub fn record_upload(&self, bytes: u64) {
        self.upload.lock().add_sample(bytes);
    }

    pub fn download_speed(&self) -> u64 {
        self.download.lock().speed()
    }

    pub fn upload_speed(&self) -> u64 {
        self.upload.lock().speed()
    }
}

/// 分片线程ID分配器
///
/// 为每个分片线程分配一个逻辑ID（1..=max），使日志更清晰易读
#[derive(Debug)]
struct WorkerIdAllocator {
    next_id: AtomicUsize,
    max_workers: usize,
}

impl WorkerIdAllocator {
    fn new(max_workers: usize) -> Self {
        Self {
            next_id: AtomicUsize::new(1),
            max_workers: max_workers.max(1),
        }
    }

    fn allocate(&self) -> usize {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        ((id - 1) % self.max_workers) + 1
    }
}

/// 下载阶段的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// 所有分片都已取回并通过校验
    Fetched,
    /// 被暂停 / 取消打断
    Cancelled,
    /// 某个分片耗尽尝试次数，或出现存储错误
    Failed(EngineError),
}

/// 校验阶段的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Passed,
    /// 需要重新下载的分片
    Mismatch { indices: Vec<usize>, reason: String },
    Cancelled,
    Failed(EngineError),
}

/// 单个下载任务的执行引擎
#[derive(Clone)]
pub struct DownloadEngine {
    id: String,
    source: SourceDescriptor,
    record: RecordHandle,
    store: Arc<RecordStore>,
    fetcher: Arc<dyn SegmentSource>,
    quota: Arc<TransferQuota>,
    cancel: CancellationToken,
    meter: Arc<RateMeter>,
    events: EventBus,
    throttler: Arc<ProgressThrottler>,
    settings: EngineSettings,
}

impl DownloadEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        download: &Download,
        record: RecordHandle,
        store: Arc<RecordStore>,
        fetcher: Arc<dyn SegmentSource>,
        quota: Arc<TransferQuota>,
        cancel: CancellationToken,
        meter: Arc<RateMeter>,
        events: EventBus,
        settings: EngineSettings,
    ) -> Self {
        Self {
            id: download.id.clone(),
            source: download.source.clone(),
            record,
            store,
            fetcher,
            quota,
            cancel,
            meter,
            events,
            throttler: Arc::new(ProgressThrottler::default()),
            settings,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 准备阶段：探测大小、划分分片、预分配文件
    pub async fn prepare(&self) -> EngineResult<Arc<StorageLayout>> {
        let known = self.record.lock().await.total_size;
        let total_size = match known {
            Some(size) => size,
            None => {
                let probed = tokio::select! {
                    result = self.fetcher.probe(&self.source) => result?,
                    _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                };
                probed.ok_or_else(|| EngineError::Transport("无法确定文件大小".to_string()))?
            }
        };

        let layout = {
            let mut download = self.record.lock().await;
            download.total_size = Some(total_size);
            if download.segments.is_planned(total_size) {
                // 断点续传：已校验的分片保留
                download.segments.reset_unverified();
            } else {
                download.segments = match &download.source {
                    SourceDescriptor::Url { .. } => {
                        SegmentManager::for_ranges(total_size, self.settings.default_segments)
                    }
                    SourceDescriptor::Torrent(meta) => SegmentManager::for_pieces(meta)?,
                };
            }
            download.sync_progress();
            self.persist(&download);
            Arc::new(StorageLayout::for_download(&download, total_size))
        };

        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        layout.preallocate().await?;

        info!(
            "任务准备完成: id={}, 大小={} bytes, 文件数={}",
            self.id,
            total_size,
            layout.spans().len()
        );
        Ok(layout)
    }

    /// 下载阶段：并发拉取所有未校验的分片
    pub async fn fetch_all(&self, layout: Arc<StorageLayout>) -> FetchOutcome {
        let pending = {
            let download = self.record.lock().await;
            download
                .segments
                .segments()
                .iter()
                .filter(|s| s.state == SegmentState::Pending)
                .count()
        };

        let workers = self.settings.max_workers.max(1).min(pending.max(1));
        let ids = WorkerIdAllocator::new(self.settings.max_workers);
        // 任一分片致命失败时停止其余分片线程
        let stop = self.cancel.child_token();

        debug!(
            "开始下载分片: id={}, 待下载={}, 分片线程数={}",
            self.id, pending, workers
        );

        let mut set = JoinSet::new();
        for _ in 0..workers {
            let engine = self.clone();
            let layout = layout.clone();
            let stop = stop.clone();
            let worker_id = ids.allocate();
            set.spawn(async move { engine.worker_loop(worker_id, layout, stop).await });
        }

        let mut failure: Option<EngineError> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) | Ok(Err(EngineError::Cancelled)) => {}
                Ok(Err(e)) => {
                    if failure.is_none() {
                        failure = Some(e);
                        stop.cancel();
                    }
                }
                Err(join_error) => {
                    error!("分片线程异常退出: id={}, 错误: {}", self.id, join_error);
                    if failure.is_none() {
                        failure = Some(EngineError::Transport(format!(
                            "分片线程异常退出: {}",
                            join_error
                        )));
                        stop.cancel();
                    }
                }
            }
        }

        self.finish_progress().await;

        if self.cancel.is_cancelled() {
            return FetchOutcome::Cancelled;
        }
        if let Some(e) = failure {
            return FetchOutcome::Failed(e);
        }

        let download = self.record.lock().await;
        if download.segments.is_complete() {
            FetchOutcome::Fetched
        } else {
            FetchOutcome::Failed(EngineError::Transport("存在未完成的分片".to_string()))
        }
    }

    async fn worker_loop(
        &self,
        worker_id: usize,
        layout: Arc<StorageLayout>,
        stop: CancellationToken,
    ) -> EngineResult<()> {
        loop {
            if stop.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            // 领取分片时立即标记 InFlight，防止重复调度
            let claimed = self.record.lock().await.segments.claim_next();
            let Some(segment) = claimed else {
                return Ok(());
            };

            debug!(
                "[分片线程{}] 下载分片 #{}: bytes={}-{}, 第 {} 次尝试",
                worker_id,
                segment.index,
                segment.range.start,
                segment.range.end.saturating_sub(1),
                segment.attempts
            );

            let result = self.fetch_segment(worker_id, &segment, &layout, &stop).await;

            let mut download = self.record.lock().await;
            match result {
                Ok(()) => {
                    download.segments.mark_verified(segment.index);
                    download.sync_progress();
                    download.download_speed = self.meter.download_speed();
                    self.persist(&download);
                    self.publish_progress(&download, false);
                    debug!(
                        "[分片线程{}] 分片 #{} 完成 ({}/{})",
                        worker_id,
                        segment.index,
                        download.segments.verified_count(),
                        download.segments.segment_count()
                    );
                }
                Err(EngineError::Cancelled) => {
                    download.segments.return_unfinished(segment.index);
                    download.sync_progress();
                    debug!("[分片线程{}] 分片 #{} 已取消", worker_id, segment.index);
                    return Err(EngineError::Cancelled);
                }
                Err(e @ EngineError::Storage(_)) => {
                    download.segments.return_unfinished(segment.index);
                    download.sync_progress();
                    error!(
                        "[分片线程{}] 分片 #{} 写入失败: {}",
                        worker_id, segment.index, e
                    );
                    return Err(e);
                }
                Err(e) => {
                    let requeued = download
                        .segments
                        .release_attempt(segment.index, self.settings.max_segment_attempts);
                    download.sync_progress();
                    if requeued {
                        warn!(
                            "[分片线程{}] 分片 #{} 第 {} 次尝试失败，重新排队: {}",
                            worker_id, segment.index, segment.attempts, e
                        );
                        continue;
                    }
                    self.persist(&download);
                    error!(
                        "[分片线程{}] 分片 #{} 尝试 {} 次后仍失败: {}",
                        worker_id, segment.index, segment.attempts, e
                    );
                    return Err(unit_exhausted(&segment, e));
                }
            }
        }
    }

    /// 拉取单个分片
    ///
    /// 普通分片边收边写；块先缓存在内存，哈希通过后才写盘，
    /// 因此未通过校验的块不会计入已下载字节。
    async fn fetch_segment(
        &self,
        worker_id: usize,
        segment: &Segment,
        layout: &Arc<StorageLayout>,
        stop: &CancellationToken,
    ) -> EngineResult<()> {
        let mut stream = tokio::select! {
            result = self.fetcher.fetch(&self.source, segment) => result?,
            _ = stop.cancelled() => return Err(EngineError::Cancelled),
        };

        let is_piece = segment.hash.is_some();
        let mut buffer: Vec<u8> = Vec::new();
        let mut writer = (!is_piece).then(|| layout.writer(segment.range.start));
        let mut received = 0u64;
        let mut pending_progress = 0u64;

        loop {
            let next = tokio::select! {
                item = stream.next() => item,
                _ = stop.cancelled() => return Err(EngineError::Cancelled),
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk: Bytes = chunk?;
            let len = chunk.len() as u64;

            if received + len > segment.size() {
                return Err(EngineError::Transport(format!(
                    "分片 #{} 返回的数据超出范围",
                    segment.index
                )));
            }

            acquire_all(&self.quota.download, len, stop).await?;

            match writer.as_mut() {
                Some(writer) => writer.write(&chunk).await?,
                None => buffer.extend_from_slice(&chunk),
            }
            received += len;
            self.meter.record_download(len);

            if !is_piece {
                pending_progress += len;
                if pending_progress >= PROGRESS_UPDATE_THRESHOLD {
                    self.report_written(segment.index, pending_progress).await;
                    pending_progress = 0;
                }
            }
        }

        if let Some(writer) = writer {
            writer.finish().await?;
        }
        if pending_progress > 0 {
            self.report_written(segment.index, pending_progress).await;
        }

        segment.verify(received, is_piece.then_some(buffer.as_slice()))?;

        if is_piece {
            layout.write_at(segment.range.start, &buffer).await?;
        }

        debug!(
            "[分片线程{}] 分片 #{} 下载完成，大小: {} bytes",
            worker_id, segment.index, received
        );
        Ok(())
    }

    async fn report_written(&self, index: usize, bytes: u64) {
        let mut download = self.record.lock().await;
        download.segments.add_written(index, bytes);
        download.sync_progress();
        download.download_speed = self.meter.download_speed();
        self.publish_progress(&download, false);
    }

    /// 校验阶段
    ///
    /// 普通下载在提供校验和时校验整个文件；块校验类任务从磁盘重新计算每个块的哈希。
    pub async fn verify(&self, layout: Arc<StorageLayout>) -> VerifyOutcome {
        let segments: Vec<Segment> = {
            let download = self.record.lock().await;
            download.segments.segments().to_vec()
        };

        let unverified: Vec<usize> = segments
            .iter()
            .filter(|s| s.state != SegmentState::Verified)
            .map(|s| s.index)
            .collect();
        if !unverified.is_empty() {
            return VerifyOutcome::Mismatch {
                reason: format!("{} 个分片未完成", unverified.len()),
                indices: unverified,
            };
        }

        match &self.source {
            SourceDescriptor::Url {
                checksum: Some(expected),
                ..
            } => {
                let actual = tokio::select! {
                    result = layout.sha256_hex() => result,
                    _ = self.cancel.cancelled() => return VerifyOutcome::Cancelled,
                };
                match actual {
                    Err(e) => VerifyOutcome::Failed(e),
                    Ok(actual) if actual.eq_ignore_ascii_case(expected) => {
                        info!("✅ 文件校验和验证通过: id={}", self.id);
                        VerifyOutcome::Passed
                    }
                    Ok(actual) => VerifyOutcome::Mismatch {
                        indices: segments.iter().map(|s| s.index).collect(),
                        reason: format!("文件校验和不匹配: 期望 {}，实际 {}", expected, actual),
                    },
                }
            }
            SourceDescriptor::Url { checksum: None, .. } => VerifyOutcome::Passed,
            SourceDescriptor::Torrent(_) => {
                let mut mismatched = Vec::new();
                for segment in &segments {
                    if self.cancel.is_cancelled() {
                        return VerifyOutcome::Cancelled;
                    }
                    let data = match layout.read_range(segment.range.clone()).await {
                        Ok(data) => data,
                        Err(e) => return VerifyOutcome::Failed(e),
                    };
                    if let Err(e) = segment.verify(data.len() as u64, Some(&data)) {
                        warn!("块重新校验失败: id={}, {}", self.id, e);
                        mismatched.push(segment.index);
                    }
                }
                if mismatched.is_empty() {
                    info!("✅ 所有块重新校验通过: id={}", self.id);
                    VerifyOutcome::Passed
                } else {
                    VerifyOutcome::Mismatch {
                        reason: format!("{} 个块重新校验失败", mismatched.len()),
                        indices: mismatched,
                    }
                }
            }
        }
    }

    /// 做种：响应对端的上传请求，直到被取消
    pub async fn seed(&self, layout: Arc<StorageLayout>) -> EngineResult<()> {
        info!("开始做种: id={}", self.id);
        loop {
            let request = tokio::select! {
                result = self.fetcher.next_upload_request(&self.source) => result?,
                _ = self.cancel.cancelled() => break,
            };

            let range = match request {
                Some(range) => range,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(SEED_IDLE_INTERVAL) => {}
                        _ = self.cancel.cancelled() => break,
                    }
                    continue;
                }
            };

            if range.start >= range.end || range.end > layout.total_size() {
                warn!("忽略非法的上传请求: id={}, range={:?}", self.id, range);
                continue;
            }

            let data = layout.read_range(range.clone()).await?;
            let len = data.len() as u64;
            match acquire_all(&self.quota.upload, len, &self.cancel).await {
                Ok(()) => {}
                Err(EngineError::Cancelled) => break,
                Err(e) => return Err(e),
            }
            self.fetcher
                .send_upload(&self.source, range, Bytes::from(data))
                .await?;
            self.meter.record_upload(len);

            let mut download = self.record.lock().await;
            download.uploaded_size += len;
            download.upload_speed = self.meter.upload_speed();
            self.publish_progress(&download, false);
        }

        let download = self.record.lock().await;
        self.persist(&download);
        info!("停止做种: id={}, 已上传 {} bytes", self.id, download.uploaded_size);
        Ok(())
    }

    /// 阶段结束时强制发布一次进度
    async fn finish_progress(&self) {
        let mut download = self.record.lock().await;
        download.download_speed = self.meter.download_speed();
        self.persist(&download);
        self.publish_progress(&download, true);
    }

    fn publish_progress(&self, download: &Download, force: bool) {
        let emit = if force {
            self.throttler.force_emit()
        } else {
            self.throttler.should_emit()
        };
        if emit {
            self.events.publish(DownloadEvent::progress(download));
        }
    }

    fn persist(&self, download: &Download) {
        if let Err(e) = self.store.save(download) {
            warn!("保存任务进度失败: id={}, 错误: {}", self.id, e);
        }
    }
}

/// 取得 `bytes` 字节的配额（可能跨多个 tick）
async fn acquire_all(bucket: &QuotaBucket, bytes: u64, cancel: &CancellationToken) -> EngineResult<()> {
    let mut left = bytes;
    while left > 0 {
        left -= bucket.acquire(left, cancel).await?;
    }
    Ok(())
}

/// 分片尝试次数耗尽后升级为任务级错误，原因中带上分片编号
fn unit_exhausted(segment: &Segment, err: EngineError) -> EngineError {
    match err {
        EngineError::Verification { index, reason } => EngineError::Verification {
            index,
            reason: format!("尝试 {} 次后仍失败: {}", segment.attempts, reason),
        },
        other => EngineError::Transport(format!(
            "分片 #{} 尝试 {} 次后仍失败: {}",
            segment.index, segment.attempts, other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::bandwidth::{ActiveTransfer, BandwidthAllocator};
    use crate::downloader::task::{BandwidthLimit, Priority};
    use crate::downloader::test_support::{sample_bytes, torrent_meta, MockSource};
    use crate::downloader::TaskStatus;
    use crate::persistence::DownloadDb;
    use tempfile::TempDir;

    struct Harness {
        engine: DownloadEngine,
        record: RecordHandle,
        events: EventBus,
        _allocator: BandwidthAllocator,
        _dir: TempDir,
    }

    fn harness(source: SourceDescriptor, fetcher: Arc<MockSource>, settings: EngineSettings) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut download = Download::new(source, dir.path().join("payload.bin"), 3);
        download.transition(TaskStatus::Downloading).unwrap();

        let store = Arc::new(RecordStore::new(DownloadDb::in_memory().unwrap()));
        let record = store.insert(download.clone()).unwrap();

        // 不限速
        let mut allocator = BandwidthAllocator::new(0, 0, Duration::from_millis(50));
        let quota = allocator.quota_for(&download.id);
        allocator.recompute(&[ActiveTransfer {
            id: download.id.clone(),
            priority: Priority::Normal,
            limit: BandwidthLimit::default(),
            downloading: true,
            uploading: true,
        }]);

        let events = EventBus::new(4096);
        let engine = DownloadEngine::new(
            &download,
            record.clone(),
            store,
            fetcher,
            quota,
            CancellationToken::new(),
            Arc::new(RateMeter::default()),
            events.clone(),
            settings,
        );
        Harness {
            engine,
            record,
            events,
            _allocator: allocator,
            _dir: dir,
        }
    }

    fn url_source(total: u64) -> SourceDescriptor {
        SourceDescriptor::Url {
            url: "http://example.com/payload.bin".to_string(),
            total_size: Some(total),
            checksum: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fetch_four_segments() {
        let data = sample_bytes(1000);
        let fetcher = Arc::new(MockSource::new(data.clone()));
        let h = harness(url_source(1000), fetcher.clone(), EngineSettings::default());

        let layout = h.engine.prepare().await.unwrap();
        {
            let download = h.record.lock().await;
            let ranges: Vec<_> = download
                .segments
                .segments()
                .iter()
                .map(|s| s.range.clone())
                .collect();
            assert_eq!(ranges, vec![0..250, 250..500, 500..750, 750..1000]);
        }

        assert_eq!(h.engine.fetch_all(layout.clone()).await, FetchOutcome::Fetched);
        assert_eq!(h.engine.verify(layout).await, VerifyOutcome::Passed);

        let download = h.record.lock().await;
        assert_eq!(download.downloaded_size, 1000);
        assert!(download.segments.is_complete());
        let written = tokio::fs::read(&download.save_path).await.unwrap();
        assert_eq!(written, data);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_transient_failures_absorbed_by_segment() {
        let data = sample_bytes(400);
        let fetcher = Arc::new(MockSource::new(data).failing_first(2));
        let settings = EngineSettings {
            default_segments: 1,
            max_workers: 1,
            max_segment_attempts: 3,
        };
        let h = harness(url_source(400), fetcher.clone(), settings);

        let layout = h.engine.prepare().await.unwrap();
        assert_eq!(h.engine.fetch_all(layout).await, FetchOutcome::Fetched);
        assert_eq!(fetcher.fetch_count(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_segment_exhaustion_names_unit() {
        let fetcher = Arc::new(MockSource::new(sample_bytes(100)).always_failing());
        let settings = EngineSettings {
            default_segments: 1,
            max_workers: 2,
            max_segment_attempts: 2,
        };
        let h = harness(url_source(100), fetcher.clone(), settings);

        let layout = h.engine.prepare().await.unwrap();
        match h.engine.fetch_all(layout).await {
            FetchOutcome::Failed(EngineError::Transport(reason)) => {
                assert!(reason.contains("分片 #0"), "{}", reason);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(fetcher.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_size_after_probe_is_transport_error() {
        let fetcher = Arc::new(MockSource::new(sample_bytes(10)).with_probe_size(None));
        let source = SourceDescriptor::url("http://example.com/unknown");
        let h = harness(source, fetcher, EngineSettings::default());

        let err = h.engine.prepare().await.unwrap_err();
        assert!(matches!(err, EngineError::Transport(_)));
    }

    #[tokio::test]
    async fn test_probe_fills_total_size() {
        let fetcher = Arc::new(MockSource::new(sample_bytes(300)));
        let source = SourceDescriptor::url("http://example.com/probe");
        let h = harness(source, fetcher, EngineSettings::default());

        h.engine.prepare().await.unwrap();
        let download = h.record.lock().await;
        assert_eq!(download.total_size, Some(300));
        assert_eq!(download.segments.segment_count(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_corrupted_piece_is_refetched_without_counting() {
        let data = sample_bytes(1024);
        let meta = torrent_meta(&data, 256);
        let fetcher = Arc::new(MockSource::new(data.clone()).corrupt_once(2));
        let h = harness(SourceDescriptor::Torrent(meta), fetcher.clone(), EngineSettings::default());
        let mut rx = h.events.subscribe();

        let layout = h.engine.prepare().await.unwrap();
        assert_eq!(h.engine.fetch_all(layout.clone()).await, FetchOutcome::Fetched);
        assert_eq!(h.engine.verify(layout).await, VerifyOutcome::Passed);

        // 4 个块 + 1 次重新下载
        assert_eq!(fetcher.fetch_count(), 5);

        let mut last = 0;
        while let Ok(event) = rx.try_recv() {
            if let DownloadEvent::Progress { downloaded_size, .. } = event {
                assert!(downloaded_size >= last, "进度不应回退");
                assert_eq!(downloaded_size % 256, 0, "未校验的块不应计入进度");
                last = downloaded_size;
            }
        }

        let download = h.record.lock().await;
        assert_eq!(download.downloaded_size, 1024);
        assert_eq!(tokio::fs::read(&download.save_path).await.unwrap(), data);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_recheck_detects_damaged_piece_on_disk() {
        let data = sample_bytes(1024);
        let meta = torrent_meta(&data, 256);
        let fetcher = Arc::new(MockSource::new(data));
        let h = harness(SourceDescriptor::Torrent(meta), fetcher, EngineSettings::default());

        let layout = h.engine.prepare().await.unwrap();
        assert_eq!(h.engine.fetch_all(layout.clone()).await, FetchOutcome::Fetched);

        layout.write_at(600, b"XX").await.unwrap();
        match h.engine.verify(layout).await {
            VerifyOutcome::Mismatch { indices, .. } => assert_eq!(indices, vec![2]),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_checksum_mismatch_resets_everything() {
        let data = sample_bytes(500);
        let source = SourceDescriptor::Url {
            url: "http://example.com/payload.bin".to_string(),
            total_size: Some(500),
            checksum: Some("00".repeat(32)),
        };
        let h = harness(source, Arc::new(MockSource::new(data)), EngineSettings::default());

        let layout = h.engine.prepare().await.unwrap();
        assert_eq!(h.engine.fetch_all(layout.clone()).await, FetchOutcome::Fetched);
        match h.engine.verify(layout).await {
            VerifyOutcome::Mismatch { indices, .. } => assert_eq!(indices, vec![0, 1, 2, 3]),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_returns_in_flight_segments() {
        let data = sample_bytes(2000);
        let fetcher =
            Arc::new(MockSource::new(data).with_chunk_delay(Duration::from_millis(20)));
        let h = harness(url_source(2000), fetcher, EngineSettings::default());

        let layout = h.engine.prepare().await.unwrap();
        let cancel = h.engine.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            cancel.cancel();
        });

        assert_eq!(h.engine.fetch_all(layout).await, FetchOutcome::Cancelled);
        let download = h.record.lock().await;
        assert_eq!(download.segments.in_flight_count(), 0);
        assert_eq!(download.downloaded_size, download.segments.verified_bytes());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_seed_serves_upload_requests() {
        let data = sample_bytes(512);
        let meta = torrent_meta(&data, 256);
        let fetcher = Arc::new(MockSource::new(data));
        let h = harness(SourceDescriptor::Torrent(meta), fetcher.clone(), EngineSettings::default());

        let layout = h.engine.prepare().await.unwrap();
        assert_eq!(h.engine.fetch_all(layout.clone()).await, FetchOutcome::Fetched);

        fetcher.uploads.lock().push_back(0..256);
        fetcher.uploads.lock().push_back(256..300);
        let cancel = h.engine.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();
        });

        h.engine.seed(layout).await.unwrap();
        assert_eq!(fetcher.uploaded.load(Ordering::SeqCst), 300);
        assert_eq!(h.record.lock().await.uploaded_size, 300);
    }
}

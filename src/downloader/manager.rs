//! 下载管理器
//!
//! 命令入口和三个后台循环（准入、带宽 tick、计划窗口）。
//! 每条记录的状态迁移都在该记录的锁内完成，每次迁移只发布一次状态变更事件；
//! 引擎只报告阶段结果，迁移由这里按状态机推进。

use chrono::NaiveDateTime;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bandwidth::{ActiveTransfer, BandwidthAllocator};
use super::engine::{DownloadEngine, EngineSettings, FetchOutcome, RateMeter, VerifyOutcome};
use super::retry::RetryPolicy;
use super::source::SegmentSource;
use super::status::TaskStatus;
use super::storage::StorageLayout;
use super::task::{
    AddOptions, BandwidthLimit, Category, Download, HoldReason, Priority, SourceDescriptor,
};
use super::task_slot_pool::{select_for_admission, AdmissionCandidate, TaskSlotPool};
use crate::config::AppConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{DownloadEvent, EventBus, ScheduledActionKind};
use crate::persistence::{RecordHandle, RecordStore};
use crate::schedule::{Schedule, ScheduleRunner};

/// 等待引擎收尾的最长时间
const RUN_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// 等待引擎收尾时的轮询间隔
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// 管理器参数
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// 默认下载目录
    pub download_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    /// 全局下载上限 (bytes/s，0 表示不限)
    pub max_download_speed: u64,
    /// 全局上传上限 (bytes/s，0 表示不限)
    pub max_upload_speed: u64,
    pub max_retries: u32,
    pub auto_start_downloads: bool,
    pub engine: EngineSettings,
    pub retry_policy: RetryPolicy,
    pub bandwidth_tick: Duration,
    pub admission_interval: Duration,
    /// None 表示不启动计划窗口循环
    pub schedule_interval: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for ManagerConfig {
    fn from(config: &AppConfig) -> Self {
        let download = &config.download;
        Self {
            download_dir: download.download_dir.clone(),
            max_concurrent_downloads: download.max_concurrent_downloads,
            max_download_speed: download.max_download_speed,
            max_upload_speed: download.max_upload_speed,
            max_retries: download.max_retries,
            auto_start_downloads: download.auto_start_downloads,
            engine: EngineSettings {
                default_segments: download.default_segments,
                max_workers: download.max_workers_per_download,
                max_segment_attempts: download.max_segment_attempts,
            },
            retry_policy: RetryPolicy::new(
                Duration::from_millis(download.retry_backoff_base_ms),
                Duration::from_millis(download.retry_backoff_max_ms),
            ),
            bandwidth_tick: Duration::from_millis(download.bandwidth_tick_ms),
            admission_interval: Duration::from_millis(download.admission_interval_ms),
            schedule_interval: config
                .scheduler
                .enabled
                .then(|| Duration::from_secs(config.scheduler.tick_interval_secs)),
        }
    }
}

/// 正在运行的引擎（下载或做种）
#[derive(Clone)]
struct ActiveRun {
    /// 区分同一任务的先后两次运行
    generation: u64,
    cancel: CancellationToken,
    meter: Arc<RateMeter>,
}

/// 下载管理器
pub struct DownloadManager {
    config: ManagerConfig,
    store: Arc<RecordStore>,
    fetcher: Arc<dyn SegmentSource>,
    events: EventBus,
    /// 任务位池（并发下载数上限）
    slots: TaskSlotPool,
    /// 全局带宽预算，每个 tick 串行重算
    allocator: parking_lot::Mutex<BandwidthAllocator>,
    /// 正在运行的引擎（task_id -> 运行句柄）
    runs: DashMap<String, ActiveRun>,
    /// 等待退避结束的自动重试（task_id -> (generation, 取消令牌)）
    pending_retries: DashMap<String, (u64, CancellationToken)>,
    generation: AtomicU64,
    schedule_runner: parking_lot::Mutex<ScheduleRunner>,
    /// 有任务可能需要准入时唤醒准入循环
    admission_notify: Notify,
    shutdown: CancellationToken,
}

impl DownloadManager {
    /// 创建下载管理器（不启动后台循环，见 [`DownloadManager::start`]）
    pub fn new(
        config: ManagerConfig,
        store: Arc<RecordStore>,
        fetcher: Arc<dyn SegmentSource>,
        events: EventBus,
    ) -> Arc<Self> {
        info!(
            "创建下载管理器: 下载目录={:?}, 最大同时下载数={}, 分片数={}, 最大重试次数={}",
            config.download_dir,
            config.max_concurrent_downloads,
            config.engine.default_segments,
            config.max_retries
        );

        let allocator = BandwidthAllocator::new(
            config.max_download_speed,
            config.max_upload_speed,
            config.bandwidth_tick,
        );

        Arc::new(Self {
            slots: TaskSlotPool::new(config.max_concurrent_downloads.max(1)),
            allocator: parking_lot::Mutex::new(allocator),
            config,
            store,
            fetcher,
            events,
            runs: DashMap::new(),
            pending_retries: DashMap::new(),
            generation: AtomicU64::new(1),
            schedule_runner: parking_lot::Mutex::new(ScheduleRunner::new()),
            admission_notify: Notify::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// 启动后台循环，并重新安排上次退出前仍在退避中的自动重试
    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.reschedule_recovered_retries().await;
        });
        self.spawn_admission_loop();
        self.spawn_bandwidth_loop();
        if let Some(interval) = self.config.schedule_interval {
            self.spawn_schedule_loop(interval);
        }
        info!("下载管理器已启动");
    }

    /// 停止后台循环并打断所有运行中的引擎
    ///
    /// 不做状态迁移：运行中的任务保持原状态落库，下次启动时恢复为 Queued。
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let deadline = tokio::time::Instant::now() + RUN_SHUTDOWN_TIMEOUT;
        while !self.runs.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
        if !self.runs.is_empty() {
            warn!("仍有 {} 个引擎未在超时前退出", self.runs.len());
        }
        info!("下载管理器已停止");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    /// 是否有等待退避结束的自动重试
    pub fn has_pending_retries(&self) -> bool {
        !self.pending_retries.is_empty()
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    // ========================================================================
    // 命令
    // ========================================================================

    /// 添加下载任务，返回任务 ID
    pub async fn add(&self, source: SourceDescriptor, options: AddOptions) -> EngineResult<String> {
        if let SourceDescriptor::Torrent(meta) = &source {
            meta.validate()?;
        }

        let schedule = match options.schedule {
            Some(schedule) => {
                schedule.validate()?;
                Some(schedule.normalized())
            }
            None => None,
        };

        let category = match &options.category_id {
            Some(category_id) => Some(
                self.store
                    .category(category_id)
                    .ok_or_else(|| EngineError::CategoryNotFound(category_id.clone()))?,
            ),
            None => None,
        };

        let save_path = match options.save_path {
            Some(path) => path,
            None => category
                .and_then(|c| c.save_path)
                .unwrap_or_else(|| self.config.download_dir.clone())
                .join(source.suggested_name()),
        };

        let mut download = Download::new(source, save_path, self.config.max_retries);
        download.priority = options.priority;
        download.category_id = options.category_id;
        download.schedule = schedule;
        if let Some(limit) = options.bandwidth_limit {
            download.bandwidth_limit = limit;
        }
        download.sequence = self.store.next_sequence();

        if !options.auto_start.unwrap_or(self.config.auto_start_downloads) {
            download.hold = Some(HoldReason::Manual);
        } else if outside_schedule(&download, local_now()) {
            download.hold = Some(HoldReason::Schedule);
        }

        let id = download.id.clone();
        let created = DownloadEvent::created(&download);
        info!(
            "添加下载任务: id={}, 保存路径={:?}, 优先级={}, 挂起={:?}",
            id, download.save_path, download.priority.as_str(), download.hold
        );
        self.store.insert(download)?;
        self.events.publish(created);
        self.wake_admission();
        Ok(id)
    }

    /// 暂停（Downloading / Seeding -> Paused），对已暂停的任务无操作
    pub async fn pause(&self, id: &str) -> EngineResult<()> {
        self.pause_with(id, false).await
    }

    async fn pause_with(&self, id: &str, by_schedule: bool) -> EngineResult<()> {
        let handle = self.store.get(id)?;
        let mut download = handle.lock().await;
        if download.status == TaskStatus::Paused {
            return Ok(());
        }
        ensure_transition(&download, &TaskStatus::Paused)?;

        self.commit_transition(&mut download, TaskStatus::Paused)?;
        self.cancel_run(id);
        info!("暂停下载任务: id={}, 计划触发={}", id, by_schedule);
        Ok(())
    }

    /// 恢复暂停的任务
    ///
    /// Paused -> Queued，重新参与准入而不是直接开始下载；
    /// 对已在运行的任务无操作；对挂起的 Queued 任务解除挂起。
    pub async fn resume(&self, id: &str) -> EngineResult<()> {
        let handle = self.store.get(id)?;
        let mut download = handle.lock().await;
        let status = download.status.clone();
        match status {
            TaskStatus::Downloading | TaskStatus::Checking | TaskStatus::Seeding => {
                debug!("任务已在运行，忽略恢复: id={}", id);
                return Ok(());
            }
            TaskStatus::Queued => {
                if download.hold.take().is_none() {
                    return Ok(());
                }
                self.persist(&download);
                info!("解除任务挂起: id={}", id);
            }
            TaskStatus::Paused => {
                download.hold = None;
                self.commit_transition(&mut download, TaskStatus::Queued)?;
                info!("恢复下载任务: id={}", id);
            }
            other => {
                return Err(EngineError::InvalidTransition {
                    from: other,
                    to: TaskStatus::Queued,
                })
            }
        }
        drop(download);
        self.wake_admission();
        Ok(())
    }

    /// 手动重试失败的任务，重置重试计数
    pub async fn retry(&self, id: &str) -> EngineResult<()> {
        let handle = self.store.get(id)?;
        let mut download = handle.lock().await;
        if !matches!(download.status, TaskStatus::Failed(_)) {
            return Err(EngineError::InvalidTransition {
                from: download.status.clone(),
                to: TaskStatus::Queued,
            });
        }

        self.cancel_pending_retry(id);
        download.retry_count = 0;
        download.last_error = None;
        download.hold = None;
        self.commit_transition(&mut download, TaskStatus::Queued)?;
        info!("手动重试任务: id={}", id);
        drop(download);
        self.wake_admission();
        Ok(())
    }

    /// 取消任务（保留已校验的分片），对已取消的任务无操作
    pub async fn cancel(&self, id: &str) -> EngineResult<()> {
        let handle = self.store.get(id)?;
        let mut download = handle.lock().await;
        if download.status == TaskStatus::Cancelled {
            return Ok(());
        }
        self.commit_transition(&mut download, TaskStatus::Cancelled)?;
        self.cancel_pending_retry(id);
        self.cancel_run(id);
        info!("取消下载任务: id={}", id);
        Ok(())
    }

    /// 删除任务，可选删除本地文件
    pub async fn remove(&self, id: &str, delete_files: bool) -> EngineResult<()> {
        let handle = self.store.get(id)?;
        self.cancel_pending_retry(id);
        self.cancel_run(id);
        self.store.remove(id)?;
        self.schedule_runner.lock().forget(id);

        if delete_files {
            if !self.wait_until_idle(id, RUN_SHUTDOWN_TIMEOUT).await {
                warn!("引擎未在超时前退出，仍尝试删除文件: id={}", id);
            }
            let download = handle.lock().await.clone();
            let layout = StorageLayout::for_download(&download, download.total_size.unwrap_or(0));
            layout.remove_files().await;
        }

        self.events.publish(DownloadEvent::Removed {
            task_id: id.to_string(),
        });
        info!("删除下载任务: id={}, 删除文件={}", id, delete_files);
        Ok(())
    }

    /// 重新开始已完成或已取消的任务
    ///
    /// 已完成的任务从头下载；已取消的任务保留已校验的分片。
    pub async fn restart(&self, id: &str) -> EngineResult<()> {
        let handle = self.store.get(id)?;
        let mut download = handle.lock().await;
        let status = download.status.clone();
        match status {
            TaskStatus::Completed => {
                download.segments.reset();
                download.sync_progress();
            }
            TaskStatus::Cancelled => {}
            other => {
                return Err(EngineError::InvalidTransition {
                    from: other,
                    to: TaskStatus::Queued,
                })
            }
        }

        download.retry_count = 0;
        download.last_error = None;
        download.hold = None;
        self.commit_transition(&mut download, TaskStatus::Queued)?;
        info!("重新开始任务: id={}", id);
        drop(download);
        self.wake_admission();
        Ok(())
    }

    /// 修改优先级（只影响准入顺序和带宽权重）
    pub async fn set_priority(&self, id: &str, priority: Priority) -> EngineResult<()> {
        let handle = self.store.get(id)?;
        let mut download = handle.lock().await;
        download.priority = priority;
        self.persist(&download);
        debug!("修改优先级: id={}, priority={}", id, priority.as_str());
        Ok(())
    }

    /// 设置或清除计划窗口
    ///
    /// 非法计划返回 ScheduleConflict，原计划保持不变。
    pub async fn set_schedule(&self, id: &str, schedule: Option<Schedule>) -> EngineResult<()> {
        let schedule = match schedule {
            Some(schedule) => {
                schedule.validate()?;
                Some(schedule.normalized())
            }
            None => None,
        };

        let handle = self.store.get(id)?;
        let mut download = handle.lock().await;
        download.schedule = schedule;

        let outside = outside_schedule(&download, local_now());
        let mut released = false;
        match download.hold {
            Some(HoldReason::Schedule) if !outside => {
                download.hold = None;
                released = true;
            }
            None if outside && download.status == TaskStatus::Queued => {
                download.hold = Some(HoldReason::Schedule);
            }
            _ => {}
        }
        self.persist(&download);
        self.schedule_runner.lock().forget(id);
        info!("更新计划窗口: id={}, 启用={}", id, download.schedule.is_some());
        drop(download);

        if released {
            self.wake_admission();
        }
        Ok(())
    }

    /// 设置单任务限速，立即重算带宽
    pub async fn set_bandwidth_limit(&self, id: &str, limit: BandwidthLimit) -> EngineResult<()> {
        let handle = self.store.get(id)?;
        {
            let mut download = handle.lock().await;
            download.bandwidth_limit = limit;
            self.persist(&download);
        }
        debug!("更新单任务限速: id={}, {:?}", id, limit);
        self.recompute_bandwidth().await;
        Ok(())
    }

    /// 设置或解除分类
    pub async fn assign_category(&self, id: &str, category_id: Option<String>) -> EngineResult<()> {
        if let Some(category_id) = &category_id {
            if self.store.category(category_id).is_none() {
                return Err(EngineError::CategoryNotFound(category_id.clone()));
            }
        }
        let handle = self.store.get(id)?;
        let mut download = handle.lock().await;
        download.category_id = category_id;
        self.persist(&download);
        Ok(())
    }

    /// 开始做种（Completed -> Seeding，仅块校验类任务）
    pub async fn start_seeding(self: &Arc<Self>, id: &str) -> EngineResult<()> {
        let handle = self.store.get(id)?;
        if handle.lock().await.status == TaskStatus::Seeding {
            return Ok(());
        }
        // 下载引擎可能仍在收尾
        if !self.wait_until_idle(id, RUN_SHUTDOWN_TIMEOUT).await {
            warn!("下载引擎未在超时前退出: id={}", id);
        }

        let run = {
            let mut download = handle.lock().await;
            self.commit_transition(&mut download, TaskStatus::Seeding)?;
            let run = self.new_run();
            self.runs.insert(id.to_string(), run.clone());
            run
        };

        self.recompute_bandwidth().await;
        let manager = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            manager.seed(id, handle, run).await;
        });
        Ok(())
    }

    /// 停止做种（Seeding -> Completed），对已完成的任务无操作
    pub async fn stop_seeding(&self, id: &str) -> EngineResult<()> {
        let handle = self.store.get(id)?;
        let mut download = handle.lock().await;
        if download.status == TaskStatus::Completed {
            return Ok(());
        }
        if download.status != TaskStatus::Seeding {
            return Err(EngineError::InvalidTransition {
                from: download.status.clone(),
                to: TaskStatus::Completed,
            });
        }
        self.commit_transition(&mut download, TaskStatus::Completed)?;
        self.cancel_run(id);
        Ok(())
    }

    // ========================================================================
    // 查询与运行时配置
    // ========================================================================

    /// 任务快照
    pub async fn get(&self, id: &str) -> EngineResult<Download> {
        let handle = self.store.get(id)?;
        let download = handle.lock().await;
        Ok(download.clone())
    }

    /// 所有任务快照（按添加顺序）
    pub async fn list(&self) -> Vec<Download> {
        self.store.snapshots().await
    }

    /// 调整最大同时下载数（不打断已运行的任务）
    pub async fn set_max_concurrent_downloads(&self, max: usize) {
        self.slots.resize(max.max(1)).await;
        self.wake_admission();
    }

    /// 调整全局限速 (bytes/s，0 表示不限)
    pub async fn set_global_speed_limit(&self, download: u64, upload: u64) {
        self.allocator.lock().set_ceilings(download, upload);
        info!("更新全局限速: 下载={} B/s, 上传={} B/s", download, upload);
        self.recompute_bandwidth().await;
    }

    // ========================================================================
    // 分类
    // ========================================================================

    pub fn list_categories(&self) -> Vec<Category> {
        self.store.categories()
    }

    pub fn create_category(
        &self,
        name: String,
        color: String,
        icon: String,
        save_path: Option<PathBuf>,
    ) -> EngineResult<Category> {
        if self.store.categories().iter().any(|c| c.name == name) {
            return Err(EngineError::Persistence(format!("分类名称已存在: {}", name)));
        }
        let category = Category::new(name, color, icon, save_path);
        self.store.save_category(category.clone())?;
        info!("创建分类: id={}, name={}", category.id, category.name);
        Ok(category)
    }

    pub fn update_category(&self, mut category: Category) -> EngineResult<Category> {
        if self.store.category(&category.id).is_none() {
            return Err(EngineError::CategoryNotFound(category.id));
        }
        category.updated_at = chrono::Utc::now().timestamp();
        self.store.save_category(category.clone())?;
        Ok(category)
    }

    /// 删除分类，引用它的任务解除关联（不删除任务）
    pub async fn delete_category(&self, id: &str) -> EngineResult<()> {
        if !self.store.delete_category(id)? {
            return Err(EngineError::CategoryNotFound(id.to_string()));
        }

        let mut detached = 0;
        for (_, handle) in self.store.handles() {
            let mut download = handle.lock().await;
            if download.category_id.as_deref() == Some(id) {
                download.category_id = None;
                detached += 1;
            }
        }
        info!("删除分类: id={}, 解除关联 {} 个任务", id, detached);
        Ok(())
    }

    // ========================================================================
    // 准入
    // ========================================================================

    fn spawn_admission_loop(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.admission_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = manager.admission_notify.notified() => {}
                    _ = manager.shutdown.cancelled() => break,
                }
                manager.admit_queued().await;
            }
            debug!("准入循环已退出");
        });
    }

    fn wake_admission(&self) {
        self.admission_notify.notify_one();
    }

    /// 一次准入：按 (优先级降序, 添加时间升序) 把排队任务提升为下载中，
    /// 直到任务位用完，返回本次准入的任务数
    pub async fn admit_queued(self: &Arc<Self>) -> usize {
        let free = self.slots.available_slots().await;
        if free == 0 {
            return 0;
        }

        let mut candidates = Vec::new();
        for (id, handle) in self.store.handles() {
            // 上一次运行尚未收尾
            if self.runs.contains_key(&id) {
                continue;
            }
            let download = handle.lock().await;
            if download.status == TaskStatus::Queued && download.hold.is_none() {
                candidates.push(AdmissionCandidate {
                    id,
                    priority: download.priority,
                    added_time: download.added_time,
                    sequence: download.sequence,
                });
            }
        }

        let mut admitted = 0;
        for candidate in select_for_admission(candidates, free) {
            match self.admit(&candidate.id).await {
                Ok(true) => admitted += 1,
                Ok(false) => {}
                Err(e @ EngineError::Capacity { .. }) => {
                    debug!("{}", e);
                    break;
                }
                Err(e) => warn!("任务准入失败: id={}, 错误: {}", candidate.id, e),
            }
        }
        admitted
    }

    async fn admit(self: &Arc<Self>, id: &str) -> EngineResult<bool> {
        let handle = self.store.get(id)?;
        let Some(slot_id) = self.slots.allocate_slot(id).await else {
            return Err(EngineError::Capacity {
                active: self.slots.used_slots().await,
                max: self.slots.max_slots(),
            });
        };

        let run = {
            let mut download = handle.lock().await;
            let admissible = download.status == TaskStatus::Queued
                && download.hold.is_none()
                && !self.runs.contains_key(id);
            let committed = if admissible {
                self.commit_transition(&mut download, TaskStatus::Downloading)
                    .map(|_| ())
            } else {
                Ok(())
            };
            if !admissible || committed.is_err() {
                drop(download);
                self.slots.release_slot(id).await;
                return committed.map(|_| false);
            }

            let run = self.new_run();
            self.runs.insert(id.to_string(), run.clone());
            run
        };

        info!("任务获得准入: id={}, slot_id={}", id, slot_id);
        // 配额桶在重算后才有配额
        self.recompute_bandwidth().await;

        let manager = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            manager.drive(id, handle, run).await;
        });
        Ok(true)
    }

    fn new_run(&self) -> ActiveRun {
        ActiveRun {
            generation: self.generation.fetch_add(1, Ordering::SeqCst),
            cancel: self.shutdown.child_token(),
            meter: Arc::new(RateMeter::default()),
        }
    }

    fn cancel_run(&self, id: &str) {
        if let Some(run) = self.runs.get(id) {
            run.cancel.cancel();
        }
    }

    /// 等待任务的引擎退出
    async fn wait_until_idle(&self, id: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.runs.contains_key(id) {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
        true
    }

    /// 引擎退出后释放任务位和带宽，并唤醒准入
    async fn finish_run(&self, id: &str, generation: u64, holds_slot: bool) {
        self.runs.remove_if(id, |_, run| run.generation == generation);
        if holds_slot {
            self.slots.release_slot(id).await;
        }
        self.recompute_bandwidth().await;
        self.wake_admission();
    }

    // ========================================================================
    // 引擎驱动
    // ========================================================================

    fn build_engine(&self, download: &Download, record: &RecordHandle, run: &ActiveRun) -> DownloadEngine {
        let quota = self.allocator.lock().quota_for(&download.id);
        DownloadEngine::new(
            download,
            record.clone(),
            self.store.clone(),
            self.fetcher.clone(),
            quota,
            run.cancel.clone(),
            run.meter.clone(),
            self.events.clone(),
            self.config.engine,
        )
    }

    /// 驱动一次下载运行：准备 -> 下载 -> 校验 -> 完成
    async fn drive(self: Arc<Self>, id: String, record: RecordHandle, run: ActiveRun) {
        let engine = {
            let download = record.lock().await;
            self.build_engine(&download, &record, &run)
        };

        match self.run_phases(&engine, &record).await {
            Ok(()) => {}
            Err(EngineError::Cancelled) => debug!("下载运行被打断: id={}", id),
            Err(e) => self.fail(&record, &run, e).await,
        }

        self.finish_run(&id, run.generation, true).await;
    }

    async fn run_phases(&self, engine: &DownloadEngine, record: &RecordHandle) -> EngineResult<()> {
        let layout = engine.prepare().await?;
        let cancelled = || engine.cancel_token().is_cancelled();

        loop {
            match engine.fetch_all(layout.clone()).await {
                FetchOutcome::Fetched => {}
                FetchOutcome::Cancelled => return Err(EngineError::Cancelled),
                FetchOutcome::Failed(e) => return Err(e),
            }

            {
                let mut download = record.lock().await;
                if cancelled() {
                    return Err(EngineError::Cancelled);
                }
                self.commit_transition(&mut download, TaskStatus::Checking)?;
            }

            match engine.verify(layout.clone()).await {
                VerifyOutcome::Passed => {
                    let mut download = record.lock().await;
                    if cancelled() {
                        return Err(EngineError::Cancelled);
                    }
                    self.commit_transition(&mut download, TaskStatus::Completed)?;
                    info!("✅ 下载完成: id={}, 大小={:?}", download.id, download.total_size);
                    return Ok(());
                }
                VerifyOutcome::Mismatch { indices, reason } => {
                    let mut download = record.lock().await;
                    if cancelled() {
                        return Err(EngineError::Cancelled);
                    }
                    if !RetryPolicy::should_retry(download.retry_count, download.max_retries) {
                        return Err(EngineError::Verification {
                            index: indices.first().copied().unwrap_or_default(),
                            reason,
                        });
                    }

                    // 只重新下载校验失败的分片
                    download.retry_count += 1;
                    download.segments.reset_indices(&indices);
                    download.sync_progress();
                    warn!(
                        "校验未通过，重新下载 {} 个分片: id={}, 原因: {}, 重试 {}/{}",
                        indices.len(),
                        download.id,
                        reason,
                        download.retry_count,
                        download.max_retries
                    );
                    self.commit_transition(&mut download, TaskStatus::Downloading)?;
                }
                VerifyOutcome::Cancelled => return Err(EngineError::Cancelled),
                VerifyOutcome::Failed(e) => return Err(e),
            }
        }
    }

    /// 任务级失败：迁移到 Failed，预算未耗尽时安排自动重试
    ///
    /// 存储错误不自动重试。
    async fn fail(self: &Arc<Self>, record: &RecordHandle, run: &ActiveRun, err: EngineError) {
        let mut download = record.lock().await;
        if run.cancel.is_cancelled()
            || !matches!(
                download.status,
                TaskStatus::Downloading | TaskStatus::Checking
            )
        {
            return;
        }

        error!("下载失败: id={}, 原因: {}", download.id, err);
        if let Err(e) = self.commit_transition(&mut download, TaskStatus::Failed(err.to_string())) {
            warn!("无法标记任务失败: id={}, 错误: {}", download.id, e);
            return;
        }

        if !err.is_retryable() {
            warn!("存储错误不自动重试: id={}", download.id);
            return;
        }
        if !RetryPolicy::should_retry(download.retry_count, download.max_retries) {
            warn!(
                "重试次数已用完 ({}/{}): id={}",
                download.retry_count, download.max_retries, download.id
            );
            return;
        }

        download.retry_count += 1;
        download.retry_pending = true;
        self.persist(&download);
        let delay = self.config.retry_policy.backoff_delay(download.retry_count);
        info!(
            "将在 {:?} 后自动重试: id={}, 第 {}/{} 次",
            delay, download.id, download.retry_count, download.max_retries
        );
        self.schedule_retry(&download.id, delay);
    }

    fn schedule_retry(self: &Arc<Self>, id: &str, delay: Duration) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let token = self.shutdown.child_token();
        if let Some((_, previous)) = self
            .pending_retries
            .insert(id.to_string(), (generation, token.clone()))
        {
            previous.cancel();
        }

        let manager = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => return,
            }
            manager
                .pending_retries
                .remove_if(&id, |_, (g, _)| *g == generation);
            if let Err(e) = manager.requeue_failed(&id).await {
                debug!("自动重试已跳过: id={}, {}", id, e);
            }
        });
    }

    /// 恢复出的 Failed 任务若仍在等待自动重试，按其重试计数重新计算退避
    async fn reschedule_recovered_retries(self: &Arc<Self>) {
        for (id, handle) in self.store.handles() {
            let download = handle.lock().await;
            if !download.retry_pending
                || !matches!(download.status, TaskStatus::Failed(_))
                || self.pending_retries.contains_key(&id)
            {
                continue;
            }
            let delay = self.config.retry_policy.backoff_delay(download.retry_count);
            info!(
                "重新安排中断前的自动重试: id={}, 第 {}/{} 次, {:?} 后",
                id, download.retry_count, download.max_retries, delay
            );
            drop(download);
            self.schedule_retry(&id, delay);
        }
    }

    fn cancel_pending_retry(&self, id: &str) {
        if let Some((_, (_, token))) = self.pending_retries.remove(id) {
            token.cancel();
        }
    }

    /// 退避结束：Failed -> Queued
    async fn requeue_failed(&self, id: &str) -> EngineResult<()> {
        let handle = self.store.get(id)?;
        let mut download = handle.lock().await;
        if !matches!(download.status, TaskStatus::Failed(_)) {
            return Ok(());
        }
        download.last_error = None;
        self.commit_transition(&mut download, TaskStatus::Queued)?;
        drop(download);
        self.wake_admission();
        Ok(())
    }

    async fn seed(self: Arc<Self>, id: String, record: RecordHandle, run: ActiveRun) {
        let (engine, layout) = {
            let download = record.lock().await;
            let total = download.total_size.unwrap_or(0);
            (
                self.build_engine(&download, &record, &run),
                Arc::new(StorageLayout::for_download(&download, total)),
            )
        };

        if let Err(e) = engine.seed(layout).await {
            let mut download = record.lock().await;
            if !run.cancel.is_cancelled() && download.status == TaskStatus::Seeding {
                warn!("做种出错，停止做种: id={}, 错误: {}", id, e);
                download.last_error = Some(e.to_string());
                if let Err(e) = self.commit_transition(&mut download, TaskStatus::Completed) {
                    warn!("无法停止做种: id={}, 错误: {}", id, e);
                }
            }
        }

        self.finish_run(&id, run.generation, false).await;
    }

    // ========================================================================
    // 带宽
    // ========================================================================

    fn spawn_bandwidth_loop(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.bandwidth_tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = manager.shutdown.cancelled() => break,
                }
                manager.recompute_bandwidth().await;
            }
            debug!("带宽循环已退出");
        });
    }

    /// 按当前活跃集合重算带宽，同时刷新各任务的速率
    pub async fn recompute_bandwidth(&self) {
        let mut active = Vec::new();
        for (id, handle) in self.store.handles() {
            let mut download = handle.lock().await;
            if !download.status.is_active() {
                continue;
            }
            if let Some(run) = self.runs.get(&id) {
                download.download_speed = run.meter.download_speed();
                download.upload_speed = run.meter.upload_speed();
            }
            active.push(ActiveTransfer {
                id,
                priority: download.priority,
                limit: download.bandwidth_limit,
                downloading: download.status == TaskStatus::Downloading,
                uploading: download.status == TaskStatus::Seeding,
            });
        }
        self.allocator.lock().recompute(&active);
    }

    // ========================================================================
    // 计划窗口
    // ========================================================================

    fn spawn_schedule_loop(self: &Arc<Self>, period: Duration) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = manager.shutdown.cancelled() => break,
                }
                manager.run_schedule_tick(local_now()).await;
            }
            debug!("计划窗口循环已退出");
        });
    }

    /// 对所有任务执行一次计划窗口检查，执行与用户相同的命令
    pub async fn run_schedule_tick(&self, now: NaiveDateTime) {
        for (id, handle) in self.store.handles() {
            let snapshot = handle.lock().await.clone();
            let action = self.schedule_runner.lock().observe(&snapshot, now);
            let Some(action) = action else {
                continue;
            };

            info!("计划窗口触发: id={}, 动作={}", id, action.as_str());
            self.events.publish(DownloadEvent::ScheduledAction {
                task_id: id.clone(),
                action,
            });

            let result = match action {
                ScheduledActionKind::Resume => self.resume(&id).await,
                ScheduledActionKind::Retry => self.retry(&id).await,
                ScheduledActionKind::Release => self.set_hold(&id, None).await,
                ScheduledActionKind::Pause => self.pause_with(&id, true).await,
                ScheduledActionKind::Hold => self.set_hold(&id, Some(HoldReason::Schedule)).await,
            };
            if let Err(e) = result {
                warn!("计划动作执行失败: id={}, 动作={}, 错误: {}", id, action.as_str(), e);
            }
        }
    }

    /// 计划窗口挂起 / 释放排队中的任务
    async fn set_hold(&self, id: &str, hold: Option<HoldReason>) -> EngineResult<()> {
        let handle = self.store.get(id)?;
        let mut download = handle.lock().await;
        if download.status != TaskStatus::Queued {
            return Ok(());
        }
        let release = match hold {
            Some(reason) if download.hold.is_none() => {
                download.hold = Some(reason);
                false
            }
            None if download.hold == Some(HoldReason::Schedule) => {
                download.hold = None;
                true
            }
            _ => return Ok(()),
        };
        self.persist(&download);
        drop(download);
        if release {
            self.wake_admission();
        }
        Ok(())
    }

    // ========================================================================
    // 记录读写
    // ========================================================================

    /// 在记录锁内执行状态迁移：写库并发布一次状态变更事件
    fn commit_transition(&self, download: &mut Download, next: TaskStatus) -> EngineResult<TaskStatus> {
        let old = download.transition(next)?;
        self.persist(download);
        info!("任务状态变更: id={}, {} -> {}", download.id, old, download.status);
        self.events
            .publish(DownloadEvent::status_changed(&download.id, &old, &download.status));
        Ok(old)
    }

    fn persist(&self, download: &Download) {
        if let Err(e) = self.store.save(download) {
            warn!("保存任务失败: id={}, 错误: {}", download.id, e);
        }
    }
}

fn ensure_transition(download: &Download, next: &TaskStatus) -> EngineResult<()> {
    if download
        .status
        .can_transition_to(next, download.is_piece_verified())
    {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            from: download.status.clone(),
            to: next.clone(),
        })
    }
}

/// 任务带有启用的计划且当前不在窗口内
fn outside_schedule(download: &Download, now: NaiveDateTime) -> bool {
    download
        .schedule
        .as_ref()
        .is_some_and(|s| s.enabled && !s.is_active_at(now))
}

fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

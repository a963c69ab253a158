//! 下载记录仓库
//!
//! 内存中的记录是唯一真相来源，每条记录一把锁；修改后写穿到 SQLite。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::db::DownloadDb;
use crate::downloader::{Category, Download, TaskStatus};
use crate::error::{EngineError, EngineResult};

/// 单条记录的共享句柄
pub type RecordHandle = Arc<Mutex<Download>>;

fn persistence_error(err: anyhow::Error) -> EngineError {
    EngineError::Persistence(format!("{:#}", err))
}

/// 下载记录仓库
pub struct RecordStore {
    db: DownloadDb,
    records: DashMap<String, RecordHandle>,
    categories: RwLock<Vec<Category>>,
    /// 下一个添加序号（同一毫秒内保持添加顺序）
    next_sequence: AtomicU64,
}

impl RecordStore {
    pub fn new(db: DownloadDb) -> Self {
        Self {
            db,
            records: DashMap::new(),
            categories: RwLock::new(Vec::new()),
            next_sequence: AtomicU64::new(1),
        }
    }

    /// 从数据库恢复所有记录
    ///
    /// 上次退出时仍在运行的任务恢复为 Queued，进行中的分片归还为 Pending，
    /// 已校验的分片保留，恢复后从断点继续。
    pub fn recover(&self) -> EngineResult<usize> {
        let categories = self.db.load_categories().map_err(persistence_error)?;
        *self.categories.write() = categories;

        let downloads = self.db.load_downloads().map_err(persistence_error)?;
        let mut max_sequence = 0;
        let mut recovered = 0;

        for mut download in downloads {
            max_sequence = max_sequence.max(download.sequence);
            if normalize_after_restart(&mut download) {
                info!(
                    "恢复中断的任务: id={}, 已校验分片={}/{}",
                    download.id,
                    download.segments.verified_count(),
                    download.segments.segment_count()
                );
                if let Err(e) = self.db.save_download(&download) {
                    warn!("保存恢复后的任务失败: id={}, 错误: {}", download.id, e);
                }
            }
            self.records
                .insert(download.id.clone(), Arc::new(Mutex::new(download)));
            recovered += 1;
        }

        self.next_sequence.store(max_sequence + 1, Ordering::SeqCst);
        info!("从数据库恢复了 {} 个下载任务", recovered);
        Ok(recovered)
    }

    /// 分配添加序号
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// 插入新记录
    pub fn insert(&self, download: Download) -> EngineResult<RecordHandle> {
        self.db.save_download(&download).map_err(persistence_error)?;
        let id = download.id.clone();
        let handle = Arc::new(Mutex::new(download));
        self.records.insert(id, handle.clone());
        Ok(handle)
    }

    pub fn get(&self, id: &str) -> EngineResult<RecordHandle> {
        self.records
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// 所有记录句柄
    pub fn handles(&self) -> Vec<(String, RecordHandle)> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 写穿到数据库（调用方持有记录锁）
    ///
    /// 已删除的记录不再写入，避免收尾中的分片线程把记录写回数据库。
    pub fn save(&self, download: &Download) -> EngineResult<()> {
        if !self.records.contains_key(&download.id) {
            debug!("记录已删除，跳过保存: id={}", download.id);
            return Ok(());
        }
        self.db.save_download(download).map_err(persistence_error)
    }

    /// 删除记录
    pub fn remove(&self, id: &str) -> EngineResult<Option<RecordHandle>> {
        self.db.delete_download(id).map_err(persistence_error)?;
        Ok(self.records.remove(id).map(|(_, handle)| handle))
    }

    /// 所有记录的快照，按添加顺序排列
    pub async fn snapshots(&self) -> Vec<Download> {
        let mut snapshots = Vec::with_capacity(self.records.len());
        for (_, handle) in self.handles() {
            snapshots.push(handle.lock().await.clone());
        }
        snapshots.sort_by(|a, b| {
            a.added_time
                .cmp(&b.added_time)
                .then(a.sequence.cmp(&b.sequence))
        });
        snapshots
    }

    // ========================================================================
    // 分类
    // ========================================================================

    pub fn categories(&self) -> Vec<Category> {
        self.categories.read().clone()
    }

    pub fn category(&self, id: &str) -> Option<Category> {
        self.categories.read().iter().find(|c| c.id == id).cloned()
    }

    /// 新增或更新分类
    pub fn save_category(&self, category: Category) -> EngineResult<()> {
        self.db.save_category(&category).map_err(persistence_error)?;
        let mut categories = self.categories.write();
        match categories.iter_mut().find(|c| c.id == category.id) {
            Some(existing) => *existing = category,
            None => categories.push(category),
        }
        Ok(())
    }

    /// 删除分类，返回是否存在
    ///
    /// 数据库中的关联由外键置空，内存记录由调用方解除关联。
    pub fn delete_category(&self, id: &str) -> EngineResult<bool> {
        let deleted = self.db.delete_category(id).map_err(persistence_error)?;
        self.categories.write().retain(|c| c.id != id);
        Ok(deleted)
    }
}

/// 重启后的状态规整，返回是否有改动
pub fn normalize_after_restart(download: &mut Download) -> bool {
    let interrupted = matches!(
        download.status,
        TaskStatus::Downloading | TaskStatus::Checking
    );
    let had_in_flight = download.segments.in_flight_count() > 0;

    if interrupted {
        download.status = TaskStatus::Queued;
    }
    if download.status == TaskStatus::Seeding {
        download.status = TaskStatus::Completed;
    }
    if interrupted || had_in_flight {
        download.segments.reset_unverified();
        download.sync_progress();
    }
    download.download_speed = 0;
    download.upload_speed = 0;
    interrupted || had_in_flight
}

//! 下载记录 SQLite 数据库模块
//!
//! - downloads: 下载任务
//! - segments: 任务的分片 / 块（随任务级联删除）
//! - categories: 分类（删除分类只解除关联，不删除任务）

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::downloader::{
    BandwidthLimit, Category, Download, HoldReason, Priority, Segment, SegmentManager,
    SegmentState, SourceDescriptor, TaskStatus,
};
use crate::schedule::Schedule;

/// 下载记录数据库
pub struct DownloadDb {
    /// SQLite 连接
    conn: Mutex<Connection>,
}

/// downloads 表的一行（解析前）
struct DownloadRow {
    id: String,
    source_json: String,
    save_path: String,
    status: String,
    status_reason: Option<String>,
    total_size: Option<i64>,
    downloaded_size: i64,
    uploaded_size: i64,
    retry_count: i64,
    max_retries: i64,
    last_error: Option<String>,
    priority: String,
    bandwidth_limit: String,
    schedule: Option<String>,
    category_id: Option<String>,
    hold: Option<String>,
    retry_pending: bool,
    added_time: i64,
    sequence: i64,
    completed_time: Option<i64>,
    segment_total: i64,
}

impl DownloadDb {
    /// 打开（或创建）数据库文件
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("创建数据库目录失败: {:?}", parent))?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("打开数据库失败: {:?}", db_path))?;
        Self::with_connection(conn)
    }

    /// 内存数据库（测试用）
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_tables()?;
        Ok(db)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))
    }

    /// 初始化数据库表
    fn init_tables(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS categories (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                color TEXT NOT NULL,
                icon TEXT NOT NULL,
                save_path TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS downloads (
                id TEXT PRIMARY KEY,
                source_type TEXT NOT NULL,
                source_json TEXT NOT NULL,
                save_path TEXT NOT NULL,
                status TEXT NOT NULL,
                status_reason TEXT,
                total_size INTEGER,
                downloaded_size INTEGER NOT NULL DEFAULT 0,
                uploaded_size INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                priority TEXT NOT NULL,
                bandwidth_limit TEXT NOT NULL,
                schedule TEXT,
                category_id TEXT REFERENCES categories(id) ON DELETE SET NULL,
                hold TEXT,
                retry_pending INTEGER NOT NULL DEFAULT 0,
                added_time INTEGER NOT NULL,
                sequence INTEGER NOT NULL DEFAULT 0,
                completed_time INTEGER,
                segment_total INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);
            CREATE INDEX IF NOT EXISTS idx_downloads_category ON downloads(category_id);

            CREATE TABLE IF NOT EXISTS segments (
                download_id TEXT NOT NULL REFERENCES downloads(id) ON DELETE CASCADE,
                idx INTEGER NOT NULL,
                range_start INTEGER NOT NULL,
                range_end INTEGER NOT NULL,
                hash TEXT,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                written INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (download_id, idx)
            );
            "#,
        )?;

        info!("下载数据库表初始化完成");
        Ok(())
    }

    // ========================================================================
    // downloads 操作
    // ========================================================================

    /// 保存下载任务（含分片）
    pub fn save_download(&self, download: &Download) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let source_type = match &download.source {
            SourceDescriptor::Url { .. } => "url",
            SourceDescriptor::Torrent(_) => "torrent",
        };
        let schedule = download
            .schedule
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let hold = download.hold.map(|h| match h {
            HoldReason::Manual => "manual",
            HoldReason::Schedule => "schedule",
        });

        tx.execute(
            r#"
            INSERT OR REPLACE INTO downloads (
                id, source_type, source_json, save_path, status, status_reason,
                total_size, downloaded_size, uploaded_size, retry_count, max_retries, last_error,
                priority, bandwidth_limit, schedule, category_id, hold, retry_pending,
                added_time, sequence, completed_time, segment_total
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)
            "#,
            params![
                download.id,
                source_type,
                serde_json::to_string(&download.source)?,
                download.save_path.to_string_lossy(),
                download.status.as_str(),
                download.status.failure_reason(),
                download.total_size.map(|s| s as i64),
                download.downloaded_size as i64,
                download.uploaded_size as i64,
                download.retry_count as i64,
                download.max_retries as i64,
                download.last_error,
                download.priority.as_str(),
                serde_json::to_string(&download.bandwidth_limit)?,
                schedule,
                download.category_id,
                hold,
                download.retry_pending as i64,
                download.added_time,
                download.sequence as i64,
                download.completed_time,
                download.segments.total_size() as i64,
            ],
        )?;

        tx.execute(
            "DELETE FROM segments WHERE download_id = ?1",
            params![download.id],
        )?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO segments (download_id, idx, range_start, range_end, hash, state, attempts, written)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )?;
            for segment in download.segments.segments() {
                stmt.execute(params![
                    download.id,
                    segment.index as i64,
                    segment.range.start as i64,
                    segment.range.end as i64,
                    segment.hash,
                    segment.state.as_str(),
                    segment.attempts as i64,
                    segment.written as i64,
                ])?;
            }
        }

        tx.commit()?;
        debug!("保存下载任务: id={}, status={}", download.id, download.status);
        Ok(())
    }

    /// 加载所有下载任务
    pub fn load_downloads(&self) -> Result<Vec<Download>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, source_json, save_path, status, status_reason,
                   total_size, downloaded_size, uploaded_size, retry_count, max_retries, last_error,
                   priority, bandwidth_limit, schedule, category_id, hold, retry_pending,
                   added_time, sequence, completed_time, segment_total
            FROM downloads
            ORDER BY added_time ASC, sequence ASC
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(DownloadRow {
                id: row.get(0)?,
                source_json: row.get(1)?,
                save_path: row.get(2)?,
                status: row.get(3)?,
                status_reason: row.get(4)?,
                total_size: row.get(5)?,
                downloaded_size: row.get(6)?,
                uploaded_size: row.get(7)?,
                retry_count: row.get(8)?,
                max_retries: row.get(9)?,
                last_error: row.get(10)?,
                priority: row.get(11)?,
                bandwidth_limit: row.get(12)?,
                schedule: row.get(13)?,
                category_id: row.get(14)?,
                hold: row.get(15)?,
                retry_pending: row.get::<_, i64>(16)? != 0,
                added_time: row.get(17)?,
                sequence: row.get(18)?,
                completed_time: row.get(19)?,
                segment_total: row.get(20)?,
            })
        })?;

        let mut parsed = Vec::new();
        for row in rows {
            match row {
                Ok(row) => parsed.push(row),
                Err(e) => warn!("读取下载任务失败: {}", e),
            }
        }
        drop(stmt);

        let mut downloads = Vec::with_capacity(parsed.len());
        for row in parsed {
            let id = row.id.clone();
            let segments = Self::load_segments(&conn, &id)?;
            match Self::row_to_download(row, segments) {
                Ok(download) => downloads.push(download),
                Err(e) => warn!("解析下载任务失败，已跳过: id={}, 错误: {}", id, e),
            }
        }

        info!("从数据库加载了 {} 个下载任务", downloads.len());
        Ok(downloads)
    }

    fn load_segments(conn: &Connection, download_id: &str) -> Result<Vec<Segment>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT idx, range_start, range_end, hash, state, attempts, written
            FROM segments
            WHERE download_id = ?1
            ORDER BY idx ASC
            "#,
        )?;
        let rows = stmt.query_map(params![download_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;

        let mut segments = Vec::new();
        for row in rows {
            let (index, start, end, hash, state, attempts, written) = row?;
            let state = SegmentState::parse(&state)
                .ok_or_else(|| anyhow!("未知的分片状态: {}", state))?;
            segments.push(Segment {
                index: index as usize,
                range: start as u64..end as u64,
                hash,
                state,
                attempts: attempts as u32,
                written: written as u64,
            });
        }
        Ok(segments)
    }

    fn row_to_download(row: DownloadRow, segments: Vec<Segment>) -> Result<Download> {
        let source: SourceDescriptor = serde_json::from_str(&row.source_json)?;
        let status = TaskStatus::from_parts(&row.status, row.status_reason)
            .ok_or_else(|| anyhow!("未知的任务状态: {}", row.status))?;
        let priority = Priority::parse(&row.priority)
            .ok_or_else(|| anyhow!("未知的优先级: {}", row.priority))?;
        let bandwidth_limit: BandwidthLimit = serde_json::from_str(&row.bandwidth_limit)?;
        let schedule: Option<Schedule> = row
            .schedule
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let hold = match row.hold.as_deref() {
            None => None,
            Some("manual") => Some(HoldReason::Manual),
            Some("schedule") => Some(HoldReason::Schedule),
            Some(other) => return Err(anyhow!("未知的暂缓原因: {}", other)),
        };

        Ok(Download {
            id: row.id,
            source,
            save_path: PathBuf::from(row.save_path),
            status,
            total_size: row.total_size.map(|s| s as u64),
            downloaded_size: row.downloaded_size as u64,
            uploaded_size: row.uploaded_size as u64,
            download_speed: 0,
            upload_speed: 0,
            retry_count: row.retry_count as u32,
            max_retries: row.max_retries as u32,
            last_error: row.last_error,
            priority,
            bandwidth_limit,
            schedule,
            category_id: row.category_id,
            hold,
            retry_pending: row.retry_pending,
            added_time: row.added_time,
            sequence: row.sequence as u64,
            completed_time: row.completed_time,
            segments: SegmentManager::from_parts(row.segment_total as u64, segments),
        })
    }

    /// 删除下载任务（分片级联删除）
    pub fn delete_download(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM downloads WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    // ========================================================================
    // categories 操作
    // ========================================================================

    /// 保存分类
    pub fn save_category(&self, category: &Category) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO categories (id, name, color, icon, save_path, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                color = excluded.color,
                icon = excluded.icon,
                save_path = excluded.save_path,
                updated_at = excluded.updated_at
            "#,
            params![
                category.id,
                category.name,
                category.color,
                category.icon,
                category
                    .save_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().to_string()),
                category.created_at,
                category.updated_at,
            ],
        )?;
        Ok(())
    }

    /// 获取单个分类
    pub fn get_category(&self, id: &str) -> Result<Option<Category>> {
        let conn = self.lock()?;
        let category = conn
            .query_row(
                "SELECT id, name, color, icon, save_path, created_at, updated_at FROM categories WHERE id = ?1",
                params![id],
                Self::row_to_category,
            )
            .optional()?;
        Ok(category)
    }

    /// 加载所有分类
    pub fn load_categories(&self) -> Result<Vec<Category>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, color, icon, save_path, created_at, updated_at FROM categories ORDER BY created_at ASC, name ASC",
        )?;
        let rows = stmt.query_map([], Self::row_to_category)?;

        let mut categories = Vec::new();
        for row in rows {
            match row {
                Ok(category) => categories.push(category),
                Err(e) => warn!("读取分类失败: {}", e),
            }
        }
        Ok(categories)
    }

    fn row_to_category(row: &rusqlite::Row<'_>) -> rusqlite::Result<Category> {
        Ok(Category {
            id: row.get(0)?,
            name: row.get(1)?,
            color: row.get(2)?,
            icon: row.get(3)?,
            save_path: row.get::<_, Option<String>>(4)?.map(PathBuf::from),
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    /// 删除分类，关联任务的 category_id 置空
    pub fn delete_category(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM categories WHERE id = ?1", params![id])?;
        if deleted > 0 {
            info!("删除分类: {}", id);
        }
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, Weekday};
    use tempfile::TempDir;

    fn sample_download() -> Download {
        let mut download = Download::new(
            SourceDescriptor::Url {
                url: "http://example.com/a.bin".to_string(),
                total_size: Some(1000),
                checksum: None,
            },
            PathBuf::from("/tmp/a.bin"),
            3,
        );
        download.priority = Priority::High;
        download.bandwidth_limit = BandwidthLimit::new(2048, 0);
        download.schedule = Some(Schedule::new(
            NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
            vec![Weekday::Mon],
        ));
        download.segments = SegmentManager::for_ranges(1000, 4);
        download.segments.claim_next();
        download.segments.mark_verified(0);
        download
    }

    #[test]
    fn test_save_and_load_download() {
        let dir = TempDir::new().unwrap();
        let db = DownloadDb::new(&dir.path().join("downloads.db")).unwrap();

        let mut download = sample_download();
        download.transition(TaskStatus::Downloading).unwrap();
        download
            .transition(TaskStatus::Failed("分片 #1 尝试次数耗尽".to_string()))
            .unwrap();
        download.retry_count = 1;
        download.retry_pending = true;
        db.save_download(&download).unwrap();

        let loaded = db.load_downloads().unwrap();
        assert_eq!(loaded.len(), 1);
        let restored = &loaded[0];
        assert_eq!(restored.id, download.id);
        assert_eq!(restored.status, download.status);
        assert_eq!(restored.priority, Priority::High);
        assert_eq!(restored.bandwidth_limit, download.bandwidth_limit);
        assert_eq!(restored.schedule, download.schedule);
        assert_eq!(restored.segments, download.segments);
        assert_eq!(restored.last_error.as_deref(), Some("分片 #1 尝试次数耗尽"));
        assert_eq!(restored.retry_count, 1);
        assert!(restored.retry_pending);
    }

    #[test]
    fn test_save_replaces_segments() {
        let db = DownloadDb::in_memory().unwrap();
        let mut download = sample_download();
        db.save_download(&download).unwrap();

        download.segments.reset();
        db.save_download(&download).unwrap();

        let loaded = db.load_downloads().unwrap();
        assert_eq!(loaded[0].segments.verified_count(), 0);
        assert_eq!(loaded[0].segments.segment_count(), 4);
    }

    #[test]
    fn test_delete_category_detaches_downloads() {
        let db = DownloadDb::in_memory().unwrap();
        let category = Category::new(
            "视频".to_string(),
            "#ff0000".to_string(),
            "film".to_string(),
            None,
        );
        db.save_category(&category).unwrap();

        let mut download = sample_download();
        download.category_id = Some(category.id.clone());
        db.save_download(&download).unwrap();

        assert!(db.delete_category(&category.id).unwrap());
        assert!(db.get_category(&category.id).unwrap().is_none());

        let loaded = db.load_downloads().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].category_id, None);
    }

    #[test]
    fn test_category_name_unique() {
        let db = DownloadDb::in_memory().unwrap();
        let first = Category::new("文档".to_string(), "#000".to_string(), "doc".to_string(), None);
        let second = Category::new("文档".to_string(), "#fff".to_string(), "doc".to_string(), None);
        db.save_category(&first).unwrap();
        assert!(db.save_category(&second).is_err());
    }

    #[test]
    fn test_delete_download_cascades_segments() {
        let db = DownloadDb::in_memory().unwrap();
        let download = sample_download();
        db.save_download(&download).unwrap();
        assert!(db.delete_download(&download.id).unwrap());
        assert!(!db.delete_download(&download.id).unwrap());

        let conn = db.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM segments", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}

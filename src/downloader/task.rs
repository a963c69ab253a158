use crate::error::{EngineError, EngineResult};
use crate::schedule::Schedule;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

use super::segment::SegmentManager;
use super::status::TaskStatus;

/// 下载优先级（只影响准入排序，不影响已激活任务的吞吐）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// 带宽加权共享的权重
    pub fn weight(&self) -> u64 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 4,
            Priority::Critical => 8,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }
}

/// 单任务限速（bytes/s，0 表示不限）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BandwidthLimit {
    pub enabled: bool,
    #[serde(default)]
    pub download: u64,
    #[serde(default)]
    pub upload: u64,
}

impl BandwidthLimit {
    pub fn new(download: u64, upload: u64) -> Self {
        Self {
            enabled: true,
            download,
            upload,
        }
    }

    /// 下载方向的有效上限，None 表示不限
    pub fn download_cap(&self) -> Option<u64> {
        (self.enabled && self.download > 0).then_some(self.download)
    }

    /// 上传方向的有效上限，None 表示不限
    pub fn upload_cap(&self) -> Option<u64> {
        (self.enabled && self.upload > 0).then_some(self.upload)
    }
}

/// 块校验类任务中的单个文件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TorrentFile {
    /// 相对保存目录的路径
    pub path: PathBuf,
    /// 文件长度
    pub length: u64,
}

/// 块校验类任务的元数据
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TorrentMeta {
    pub info_hash: String,
    pub piece_length: u64,
    pub num_pieces: usize,
    /// 每块的 SHA-1（十六进制）
    pub piece_hashes: Vec<String>,
    pub files: Vec<TorrentFile>,
    pub total_size: u64,
}

impl TorrentMeta {
    /// 校验元数据自洽
    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |msg: String| EngineError::Verification {
            index: 0,
            reason: msg,
        };
        if self.piece_length == 0 {
            return Err(invalid("块大小为 0".to_string()));
        }
        let expected = self.total_size.div_ceil(self.piece_length) as usize;
        if self.num_pieces != expected || self.piece_hashes.len() != self.num_pieces {
            return Err(invalid(format!(
                "块数量不一致: 声明 {}，哈希 {}，按大小应为 {}",
                self.num_pieces,
                self.piece_hashes.len(),
                expected
            )));
        }
        if let Some(file) = self.files.iter().find(|f| !is_plain_relative(&f.path)) {
            return Err(invalid(format!("文件路径不合法: {:?}", file.path)));
        }
        let files_total: u64 = self.files.iter().map(|f| f.length).sum();
        if !self.files.is_empty() && files_total != self.total_size {
            return Err(invalid(format!(
                "文件长度之和 {} 与总大小 {} 不一致",
                files_total, self.total_size
            )));
        }
        Ok(())
    }
}

/// 只由普通路径段组成的相对路径（不含根、盘符、`.` 和 `..`）
fn is_plain_relative(path: &Path) -> bool {
    path.components().next().is_some()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

/// 下载来源
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceDescriptor {
    /// 普通分段下载
    Url {
        url: String,
        /// 已知大小，未知时下载前探测
        #[serde(default)]
        total_size: Option<u64>,
        /// 整个文件的 SHA-256（十六进制）
        #[serde(default)]
        checksum: Option<String>,
    },
    /// 块校验类下载
    Torrent(TorrentMeta),
}

impl SourceDescriptor {
    pub fn url(url: impl Into<String>) -> Self {
        SourceDescriptor::Url {
            url: url.into(),
            total_size: None,
            checksum: None,
        }
    }

    pub fn is_piece_verified(&self) -> bool {
        matches!(self, SourceDescriptor::Torrent(_))
    }

    pub fn known_size(&self) -> Option<u64> {
        match self {
            SourceDescriptor::Url { total_size, .. } => *total_size,
            SourceDescriptor::Torrent(meta) => Some(meta.total_size),
        }
    }

    /// 推导默认文件名
    pub fn suggested_name(&self) -> String {
        match self {
            SourceDescriptor::Url { url, .. } => reqwest::Url::parse(url)
                .ok()
                .and_then(|parsed| {
                    parsed
                        .path_segments()?
                        .rev()
                        .find(|s| !s.is_empty())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "download".to_string()),
            SourceDescriptor::Torrent(meta) => meta.info_hash.clone(),
        }
    }
}

/// 不参与准入的原因
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HoldReason {
    /// 未开启自动开始，等待用户 resume
    Manual,
    /// 等待计划窗口
    Schedule,
}

/// 分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub color: String,
    pub icon: String,
    pub save_path: Option<PathBuf>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Category {
    pub fn new(name: String, color: String, icon: String, save_path: Option<PathBuf>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            color,
            icon,
            save_path,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 添加下载时的选项
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// 完整保存路径，未指定时由分类或默认下载目录推导
    pub save_path: Option<PathBuf>,
    pub priority: Priority,
    pub category_id: Option<String>,
    pub schedule: Option<Schedule>,
    pub bandwidth_limit: Option<BandwidthLimit>,
    /// 覆盖配置中的 auto_start_downloads
    pub auto_start: Option<bool>,
}

/// 下载任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Download {
    /// 任务ID
    pub id: String,
    /// 下载来源
    pub source: SourceDescriptor,
    /// 本地保存路径（多文件任务为目录）
    pub save_path: PathBuf,
    /// 任务状态
    pub status: TaskStatus,
    /// 文件总大小（未探测时为 None）
    pub total_size: Option<u64>,
    /// 已下载大小
    pub downloaded_size: u64,
    /// 已上传大小
    pub uploaded_size: u64,
    /// 下载速度 (bytes/s)
    pub download_speed: u64,
    /// 上传速度 (bytes/s)
    pub upload_speed: u64,
    /// 自动重试次数
    pub retry_count: u32,
    /// 最大自动重试次数
    pub max_retries: u32,
    /// 最近一次错误
    pub last_error: Option<String>,
    pub priority: Priority,
    pub bandwidth_limit: BandwidthLimit,
    pub schedule: Option<Schedule>,
    pub category_id: Option<String>,
    /// 暂不参与准入的原因
    pub hold: Option<HoldReason>,
    /// Failed 状态下已安排自动重试（退避中），重启后据此重新安排
    pub retry_pending: bool,
    /// 添加时间 (Unix 毫秒)
    pub added_time: i64,
    /// 同一毫秒内的添加顺序
    pub sequence: u64,
    /// 完成时间 (Unix 毫秒)
    pub completed_time: Option<i64>,
    /// 分片 / 块
    pub segments: SegmentManager,
}

impl Download {
    pub fn new(source: SourceDescriptor, save_path: PathBuf, max_retries: u32) -> Self {
        let total_size = source.known_size();
        Self {
            id: Uuid::new_v4().to_string(),
            source,
            save_path,
            status: TaskStatus::Queued,
            total_size,
            downloaded_size: 0,
            uploaded_size: 0,
            download_speed: 0,
            upload_speed: 0,
            retry_count: 0,
            max_retries,
            last_error: None,
            priority: Priority::Normal,
            bandwidth_limit: BandwidthLimit::default(),
            schedule: None,
            category_id: None,
            hold: None,
            retry_pending: false,
            added_time: chrono::Utc::now().timestamp_millis(),
            sequence: 0,
            completed_time: None,
            segments: SegmentManager::default(),
        }
    }

    pub fn is_piece_verified(&self) -> bool {
        self.source.is_piece_verified()
    }

    /// 计算进度百分比
    pub fn progress(&self) -> f64 {
        match self.total_size {
            Some(0) if self.status == TaskStatus::Completed => 100.0,
            Some(total) if total > 0 => (self.downloaded_size as f64 / total as f64) * 100.0,
            _ => 0.0,
        }
    }

    /// 估算剩余时间 (秒)
    pub fn eta(&self) -> Option<u64> {
        let total = self.total_size?;
        if self.download_speed == 0 || self.downloaded_size >= total {
            return None;
        }
        Some((total - self.downloaded_size) / self.download_speed)
    }

    /// 从分片同步已下载字节数
    pub fn sync_progress(&mut self) {
        self.downloaded_size = self.segments.downloaded_bytes();
        if let Some(total) = self.total_size {
            self.downloaded_size = self.downloaded_size.min(total);
        }
    }

    /// 执行状态迁移
    ///
    /// 只接受迁移表中的边，返回旧状态。
    pub fn transition(&mut self, next: TaskStatus) -> EngineResult<TaskStatus> {
        if !self.status.can_transition_to(&next, self.is_piece_verified()) {
            return Err(EngineError::InvalidTransition {
                from: self.status.clone(),
                to: next,
            });
        }

        match &next {
            TaskStatus::Completed => {
                if let Some(total) = self.total_size {
                    self.downloaded_size = total;
                }
                if self.completed_time.is_none() {
                    self.completed_time = Some(chrono::Utc::now().timestamp_millis());
                }
                self.download_speed = 0;
            }
            TaskStatus::Failed(reason) => {
                self.last_error = Some(reason.clone());
                self.download_speed = 0;
                self.upload_speed = 0;
            }
            TaskStatus::Queued => {
                self.completed_time = None;
                self.download_speed = 0;
                self.upload_speed = 0;
            }
            TaskStatus::Paused | TaskStatus::Cancelled => {
                self.download_speed = 0;
                self.upload_speed = 0;
            }
            _ => {}
        }

        self.retry_pending = false;

        Ok(std::mem::replace(&mut self.status, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url_download(total: u64) -> Download {
        Download::new(
            SourceDescriptor::Url {
                url: "http://example.com/file.bin".to_string(),
                total_size: Some(total),
                checksum: None,
            },
            PathBuf::from("./downloads/file.bin"),
            3,
        )
    }

    #[test]
    fn test_task_creation() {
        let task = url_download(1024 * 1024);
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.downloaded_size, 0);
        assert_eq!(task.progress(), 0.0);
        assert_eq!(task.total_size, Some(1024 * 1024));
    }

    #[test]
    fn test_progress_calculation() {
        let mut task = url_download(1000);

        task.downloaded_size = 250;
        assert_eq!(task.progress(), 25.0);

        task.downloaded_size = 1000;
        assert_eq!(task.progress(), 100.0);
    }

    #[test]
    fn test_eta_calculation() {
        let mut task = url_download(1000);

        task.downloaded_size = 200;
        task.download_speed = 100;
        assert_eq!(task.eta(), Some(8));

        task.download_speed = 0;
        assert_eq!(task.eta(), None);
    }

    #[test]
    fn test_status_transitions() {
        let mut task = url_download(1000);

        task.transition(TaskStatus::Downloading).unwrap();
        task.transition(TaskStatus::Checking).unwrap();
        let old = task.transition(TaskStatus::Completed).unwrap();
        assert_eq!(old, TaskStatus::Checking);
        assert_eq!(task.downloaded_size, 1000);
        assert!(task.completed_time.is_some());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut task = url_download(1000);
        let err = task.transition(TaskStatus::Completed).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[test]
    fn test_failed_records_last_error() {
        let mut task = url_download(1000);
        task.transition(TaskStatus::Downloading).unwrap();
        task.transition(TaskStatus::Failed("Network error".to_string()))
            .unwrap();
        assert_eq!(task.last_error.as_deref(), Some("Network error"));
    }

    #[test]
    fn test_suggested_name() {
        let source = SourceDescriptor::url("https://host/path/movie.mkv?token=1");
        assert_eq!(source.suggested_name(), "movie.mkv");
        assert_eq!(SourceDescriptor::url("https://host/").suggested_name(), "download");
    }

    #[test]
    fn test_bandwidth_limit_caps() {
        let disabled = BandwidthLimit {
            enabled: false,
            download: 100,
            upload: 100,
        };
        assert_eq!(disabled.download_cap(), None);

        let limit = BandwidthLimit::new(500, 0);
        assert_eq!(limit.download_cap(), Some(500));
        assert_eq!(limit.upload_cap(), None);
    }

    #[test]
    fn test_torrent_meta_validation() {
        let meta = TorrentMeta {
            info_hash: "abc".to_string(),
            piece_length: 4,
            num_pieces: 3,
            piece_hashes: vec!["a".into(), "b".into(), "c".into()],
            files: vec![],
            total_size: 10,
        };
        assert!(meta.validate().is_ok());

        let broken = TorrentMeta {
            num_pieces: 2,
            ..meta
        };
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_torrent_file_paths_stay_inside_save_dir() {
        let meta = |path: &str| TorrentMeta {
            info_hash: "abc".to_string(),
            piece_length: 4,
            num_pieces: 3,
            piece_hashes: vec!["a".into(), "b".into(), "c".into()],
            files: vec![
                TorrentFile {
                    path: PathBuf::from("album/01.flac"),
                    length: 6,
                },
                TorrentFile {
                    path: PathBuf::from(path),
                    length: 4,
                },
            ],
            total_size: 10,
        };

        assert!(meta("album/cover.jpg").validate().is_ok());
        for bad in ["/tmp/escape.bin", "../../etc_escape", "album/../../x", ""] {
            assert!(
                matches!(meta(bad).validate(), Err(EngineError::Verification { .. })),
                "路径应被拒绝: {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_leaving_failed_clears_retry_pending() {
        let mut download = url_download(100);
        download.transition(TaskStatus::Downloading).unwrap();
        download
            .transition(TaskStatus::Failed("timeout".to_string()))
            .unwrap();
        download.retry_pending = true;

        download.transition(TaskStatus::Queued).unwrap();
        assert!(!download.retry_pending);
    }
}

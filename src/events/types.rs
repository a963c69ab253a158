//! 下载事件类型定义
//!
//! 事件只携带状态名、错误字符串与进度快照，不暴露内部错误类型。

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::downloader::{Download, TaskStatus};

/// 事件广播通道容量
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// 事件优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    /// 低优先级：进度更新
    Low = 0,
    /// 中优先级：状态变更
    Medium = 1,
    /// 高优先级：删除等关键事件
    High = 2,
}

/// 计划窗口触发的动作
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledActionKind {
    Resume,
    Retry,
    Release,
    Pause,
    /// 窗口关闭时挂起尚未开始的任务
    Hold,
}

impl ScheduledActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduledActionKind::Resume => "resume",
            ScheduledActionKind::Retry => "retry",
            ScheduledActionKind::Release => "release",
            ScheduledActionKind::Pause => "pause",
            ScheduledActionKind::Hold => "hold",
        }
    }
}

/// 下载任务事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DownloadEvent {
    /// 任务创建
    Created {
        task_id: String,
        save_path: String,
        total_size: Option<u64>,
        priority: String,
    },
    /// 进度更新
    Progress {
        task_id: String,
        downloaded_size: u64,
        uploaded_size: u64,
        total_size: Option<u64>,
        download_speed: u64,
        upload_speed: u64,
        progress: f64,
        eta_secs: Option<u64>,
    },
    /// 状态变更
    StatusChanged {
        task_id: String,
        old_status: String,
        new_status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// 计划窗口触发的动作
    ScheduledAction {
        task_id: String,
        action: ScheduledActionKind,
    },
    /// 任务删除
    Removed { task_id: String },
}

impl DownloadEvent {
    /// 获取任务 ID
    pub fn task_id(&self) -> &str {
        match self {
            DownloadEvent::Created { task_id, .. } => task_id,
            DownloadEvent::Progress { task_id, .. } => task_id,
            DownloadEvent::StatusChanged { task_id, .. } => task_id,
            DownloadEvent::ScheduledAction { task_id, .. } => task_id,
            DownloadEvent::Removed { task_id } => task_id,
        }
    }

    /// 获取事件优先级
    pub fn priority(&self) -> EventPriority {
        match self {
            DownloadEvent::Progress { .. } => EventPriority::Low,
            DownloadEvent::StatusChanged { .. } => EventPriority::Medium,
            DownloadEvent::Created { .. } => EventPriority::Medium,
            DownloadEvent::ScheduledAction { .. } => EventPriority::Medium,
            DownloadEvent::Removed { .. } => EventPriority::High,
        }
    }

    /// 获取事件类型名称
    pub fn event_type_name(&self) -> &'static str {
        match self {
            DownloadEvent::Created { .. } => "created",
            DownloadEvent::Progress { .. } => "progress",
            DownloadEvent::StatusChanged { .. } => "status_changed",
            DownloadEvent::ScheduledAction { .. } => "scheduled_action",
            DownloadEvent::Removed { .. } => "removed",
        }
    }

    pub fn created(download: &Download) -> Self {
        DownloadEvent::Created {
            task_id: download.id.clone(),
            save_path: download.save_path.to_string_lossy().to_string(),
            total_size: download.total_size,
            priority: download.priority.as_str().to_string(),
        }
    }

    /// 从任务快照生成进度事件
    pub fn progress(download: &Download) -> Self {
        DownloadEvent::Progress {
            task_id: download.id.clone(),
            downloaded_size: download.downloaded_size,
            uploaded_size: download.uploaded_size,
            total_size: download.total_size,
            download_speed: download.download_speed,
            upload_speed: download.upload_speed,
            progress: download.progress(),
            eta_secs: download.eta(),
        }
    }

    pub fn status_changed(task_id: &str, old: &TaskStatus, new: &TaskStatus) -> Self {
        DownloadEvent::StatusChanged {
            task_id: task_id.to_string(),
            old_status: old.as_str().to_string(),
            new_status: new.as_str().to_string(),
            error: new.failure_reason().map(str::to_string),
        }
    }
}

/// 事件总线
///
/// 没有订阅者时发布的事件直接丢弃。
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DownloadEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: DownloadEvent) {
        let name = event.event_type_name();
        if self.sender.send(event).is_err() {
            debug!("事件无订阅者，已丢弃: {}", name);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

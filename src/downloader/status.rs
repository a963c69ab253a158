//! 下载任务状态机
//!
//! 所有状态迁移都查同一张迁移表，表外的迁移一律拒绝。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 下载任务状态
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum TaskStatus {
    /// 等待准入
    Queued,
    /// 下载中
    Downloading,
    /// 已暂停
    Paused,
    /// 所有分片已获取，等待校验
    Checking,
    /// 做种中（仅块校验类任务）
    Seeding,
    /// 已完成
    Completed,
    /// 失败（附带原因）
    Failed(String),
    /// 已取消
    Cancelled,
}

/// 状态种类（不带负载，便于迁移表匹配和持久化）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKind {
    Queued,
    Downloading,
    Paused,
    Checking,
    Seeding,
    Completed,
    Failed,
    Cancelled,
}

/// 迁移表
///
/// `(from, to, 仅块校验类任务)`
const TRANSITIONS: &[(StatusKind, StatusKind, bool)] = {
    use StatusKind::*;
    &[
        (Queued, Downloading, false),
        (Queued, Cancelled, false),
        (Downloading, Paused, false),
        (Downloading, Checking, false),
        (Downloading, Failed, false),
        (Downloading, Cancelled, false),
        (Paused, Queued, false),
        (Paused, Downloading, false),
        (Paused, Cancelled, false),
        (Checking, Completed, false),
        (Checking, Failed, false),
        (Checking, Downloading, false),
        (Checking, Cancelled, false),
        (Failed, Queued, false),
        (Failed, Cancelled, false),
        // 用户重新开始
        (Completed, Queued, false),
        (Cancelled, Queued, false),
        (Completed, Seeding, true),
        (Seeding, Completed, true),
        (Seeding, Paused, true),
        (Seeding, Cancelled, true),
    ]
};

impl TaskStatus {
    pub fn kind(&self) -> StatusKind {
        match self {
            TaskStatus::Queued => StatusKind::Queued,
            TaskStatus::Downloading => StatusKind::Downloading,
            TaskStatus::Paused => StatusKind::Paused,
            TaskStatus::Checking => StatusKind::Checking,
            TaskStatus::Seeding => StatusKind::Seeding,
            TaskStatus::Completed => StatusKind::Completed,
            TaskStatus::Failed(_) => StatusKind::Failed,
            TaskStatus::Cancelled => StatusKind::Cancelled,
        }
    }

    /// 检查迁移是否合法
    ///
    /// # 参数
    /// * `piece_verified` - 是否为块校验类（torrent 类）任务
    pub fn can_transition_to(&self, next: &TaskStatus, piece_verified: bool) -> bool {
        let (from, to) = (self.kind(), next.kind());
        TRANSITIONS
            .iter()
            .any(|&(f, t, torrent_only)| f == from && t == to && (!torrent_only || piece_verified))
    }

    /// 引擎自身不会再推进的状态
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// 占用并发名额、参与带宽分配的状态
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Downloading | TaskStatus::Checking | TaskStatus::Seeding
        )
    }

    /// 失败原因
    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            TaskStatus::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// 持久化用的状态名
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Paused => "paused",
            TaskStatus::Checking => "checking",
            TaskStatus::Seeding => "seeding",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed(_) => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// 从持久化的状态名恢复
    pub fn from_parts(name: &str, reason: Option<String>) -> Option<Self> {
        let status = match name {
            "queued" => TaskStatus::Queued,
            "downloading" => TaskStatus::Downloading,
            "paused" => TaskStatus::Paused,
            "checking" => TaskStatus::Checking,
            "seeding" => TaskStatus::Seeding,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed(reason.unwrap_or_default()),
            "cancelled" => TaskStatus::Cancelled,
            _ => return None,
        };
        Some(status)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Failed(reason) if !reason.is_empty() => write!(f, "failed({})", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

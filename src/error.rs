//! 下载引擎错误类型
//!
//! 分片级错误（传输、校验）在分片内部重试消化，只有预算耗尽后才会升级为
//! 下载任务级失败；界面层只能看到 `status` 与 `last_error` 字符串。

use crate::downloader::TaskStatus;
use thiserror::Error;

/// 引擎错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// 网络 / IO 传输失败（分片内重试，耗尽后升级）
    #[error("传输错误: {0}")]
    Transport(String),

    /// 分片 / 块校验失败（丢弃数据并重新排队）
    #[error("校验失败: 分片 #{index}: {reason}")]
    Verification { index: usize, reason: String },

    /// 准入被拒绝（不是真正的错误，任务保持 Queued）
    #[error("并发下载数已满 ({active}/{max})")]
    Capacity { active: usize, max: usize },

    /// 计划时间窗口非法（配置时拒绝，保留原计划）
    #[error("计划配置冲突: {0}")]
    ScheduleConflict(String),

    /// 磁盘已满 / 不可写（对该任务致命，不自动重试）
    #[error("存储错误: {0}")]
    Storage(String),

    /// 状态机不允许的状态迁移
    #[error("非法状态迁移: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    /// 任务不存在
    #[error("任务不存在: {0}")]
    NotFound(String),

    /// 分类不存在
    #[error("分类不存在: {0}")]
    CategoryNotFound(String),

    /// 持久化失败
    #[error("持久化失败: {0}")]
    Persistence(String),

    /// 任务已被取消
    #[error("任务已取消")]
    Cancelled,
}

impl EngineError {
    /// 存储错误不自动重试
    pub fn is_retryable(&self) -> bool {
        !matches!(self, EngineError::Storage(_) | EngineError::Cancelled)
    }

    /// 将 IO 错误归类为存储错误
    pub fn storage(context: &str, err: std::io::Error) -> Self {
        EngineError::Storage(format!("{}: {}", context, err))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::Transport(err.to_string())
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

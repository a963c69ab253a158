// Download Engine Library
// 多任务分段下载引擎核心库

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 下载引擎模块
pub mod downloader;

// 下载事件
pub mod events;

// 日志系统
pub mod logging;

// 任务持久化
pub mod persistence;

// 计划时间窗口
pub mod schedule;

// 导出常用类型
pub use config::AppConfig;
pub use downloader::{AddOptions, Download, DownloadManager, SourceDescriptor, TaskStatus};
pub use error::{EngineError, EngineResult};
pub use events::{DownloadEvent, EventBus};

//! 任务持久化模块
//!
//! - `db.rs`: SQLite 表结构与读写
//! - `store.rs`: 内存记录仓库（写穿到数据库）与重启恢复
//!
//! ## 设计原则
//!
//! 1. **单一真相来源**: 所有组件只通过 `RecordStore` 读写下载记录
//! 2. **逐条加锁**: 同一任务的状态迁移串行执行，不同任务互不阻塞
//! 3. **断点恢复**: 已校验的分片随任务一起落库，重启后从断点继续

pub mod db;
pub mod store;

pub use db::DownloadDb;
pub use store::{normalize_after_restart, RecordHandle, RecordStore};

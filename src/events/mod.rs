//! 事件模块
//!
//! - `types.rs`: 下载事件类型与事件总线
//! - `throttle.rs`: 进度事件节流

mod throttle;
mod types;

pub use throttle::*;
pub use types::*;

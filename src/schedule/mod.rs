//! 计划窗口模块
//!
//! - `window.rs`: 每周时间窗口（支持跨午夜）
//! - `runner.rs`: 边沿检测，窗口开关时产生动作

mod runner;
mod window;

pub use runner::{evaluate_edge, ScheduleRunner};
pub use window::Schedule;

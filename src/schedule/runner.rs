//! 计划窗口执行器
//!
//! 每个 tick 对每个带计划的任务判断窗口是否生效，只在生效 / 失效的边沿
//! 产生动作，重复观察到同一状态不会产生重复动作。

use chrono::NaiveDateTime;
use std::collections::HashMap;

use crate::downloader::{Download, HoldReason, RetryPolicy, TaskStatus};
use crate::events::ScheduledActionKind;

/// 窗口边沿上应执行的动作（纯函数）
pub fn evaluate_edge(download: &Download, active: bool) -> Option<ScheduledActionKind> {
    if active {
        match &download.status {
            TaskStatus::Paused => Some(ScheduledActionKind::Resume),
            TaskStatus::Failed(_)
                if RetryPolicy::should_retry(download.retry_count, download.max_retries) =>
            {
                Some(ScheduledActionKind::Retry)
            }
            TaskStatus::Queued if download.hold == Some(HoldReason::Schedule) => {
                Some(ScheduledActionKind::Release)
            }
            _ => None,
        }
    } else {
        match &download.status {
            TaskStatus::Downloading | TaskStatus::Seeding => Some(ScheduledActionKind::Pause),
            TaskStatus::Queued if download.hold.is_none() => Some(ScheduledActionKind::Hold),
            _ => None,
        }
    }
}

/// 计划窗口执行器
///
/// 记录每个任务上一次观察到的窗口状态，用于边沿检测。
#[derive(Debug, Default)]
pub struct ScheduleRunner {
    last_active: HashMap<String, bool>,
}

impl ScheduleRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// 观察一个任务，返回需要执行的动作
    ///
    /// 首次观察视为一次边沿。
    pub fn observe(&mut self, download: &Download, now: NaiveDateTime) -> Option<ScheduledActionKind> {
        let Some(schedule) = download.schedule.as_ref().filter(|s| s.enabled) else {
            self.last_active.remove(&download.id);
            return None;
        };

        let active = schedule.is_active_at(now);
        let previous = self.last_active.insert(download.id.clone(), active);
        if previous == Some(active) {
            return None;
        }
        evaluate_edge(download, active)
    }

    /// 计划变更或任务删除后重新开始边沿检测
    pub fn forget(&mut self, id: &str) {
        self.last_active.remove(id);
    }

    /// 上一次观察到的窗口状态
    pub fn last_state(&self, id: &str) -> Option<bool> {
        self.last_active.get(id).copied()
    }
}

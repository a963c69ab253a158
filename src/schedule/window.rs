//! 计划时间窗口
//!
//! 纯函数判定：给定 (时刻, 计划) 即可得出窗口是否生效，与驱动它的定时循环无关。

use crate::error::{EngineError, EngineResult};
use chrono::{Datelike, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

/// 下载计划
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schedule {
    /// 是否启用
    pub enabled: bool,
    /// 开始时间（含）
    pub start_time: NaiveTime,
    /// 结束时间（不含），早于开始时间表示跨越午夜
    pub end_time: NaiveTime,
    /// 窗口开始的星期
    pub days_of_week: Vec<Weekday>,
}

impl Schedule {
    pub fn new(start_time: NaiveTime, end_time: NaiveTime, days_of_week: Vec<Weekday>) -> Self {
        Self {
            enabled: true,
            start_time,
            end_time,
            days_of_week,
        }
    }

    /// 配置时校验，非法计划返回 ScheduleConflict
    pub fn validate(&self) -> EngineResult<()> {
        if self.days_of_week.is_empty() {
            return Err(EngineError::ScheduleConflict(
                "未指定任何星期".to_string(),
            ));
        }
        if self.start_time == self.end_time {
            return Err(EngineError::ScheduleConflict(format!(
                "开始时间与结束时间相同: {}",
                self.start_time
            )));
        }
        Ok(())
    }

    /// 去重后的计划
    pub fn normalized(mut self) -> Self {
        let mut days: Vec<Weekday> = Vec::with_capacity(self.days_of_week.len());
        for day in self.days_of_week {
            if !days.contains(&day) {
                days.push(day);
            }
        }
        days.sort_by_key(|d| d.num_days_from_monday());
        self.days_of_week = days;
        self
    }

    /// 是否跨越午夜
    pub fn wraps_midnight(&self) -> bool {
        self.end_time < self.start_time
    }

    /// 判断时刻 `now` 是否落在计划窗口内
    ///
    /// 跨午夜的窗口归属于开始那天：周一 22:00-02:00 在周二 01:30 仍然生效。
    pub fn is_active_at(&self, now: NaiveDateTime) -> bool {
        if !self.enabled {
            return false;
        }

        let time = now.time();
        let today = now.weekday();

        if self.wraps_midnight() {
            (self.days_of_week.contains(&today) && time >= self.start_time)
                || (self.days_of_week.contains(&today.pred()) && time < self.end_time)
        } else {
            self.days_of_week.contains(&today) && time >= self.start_time && time < self.end_time
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(date: (i32, u32, u32), hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(date.0, date.1, date.2)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn hm(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
    }

    // 2024-01-01 是周一
    const MON: (i32, u32, u32) = (2024, 1, 1);
    const TUE: (i32, u32, u32) = (2024, 1, 2);

    #[test]
    fn test_midnight_spanning_window() {
        let schedule = Schedule::new(hm(22, 0), hm(2, 0), vec![Weekday::Mon]);

        assert!(schedule.is_active_at(at(MON, 23, 30)));
        assert!(schedule.is_active_at(at(TUE, 1, 30)));
        assert!(!schedule.is_active_at(at(TUE, 3, 0)));
        assert!(!schedule.is_active_at(at(MON, 21, 59)));
        // 周一凌晨属于周日开始的窗口
        assert!(!schedule.is_active_at(at(MON, 1, 0)));
        // 周二 22:00 不在计划内
        assert!(!schedule.is_active_at(at(TUE, 22, 30)));
    }

    #[test]
    fn test_same_day_window_bounds() {
        let schedule = Schedule::new(hm(9, 0), hm(17, 0), vec![Weekday::Mon, Weekday::Tue]);

        assert!(schedule.is_active_at(at(MON, 9, 0)));
        assert!(schedule.is_active_at(at(TUE, 16, 59)));
        assert!(!schedule.is_active_at(at(TUE, 17, 0)));
        assert!(!schedule.is_active_at(at((2024, 1, 3), 12, 0)));
    }

    #[test]
    fn test_disabled_schedule_never_active() {
        let mut schedule = Schedule::new(hm(0, 0), hm(23, 59), vec![Weekday::Mon]);
        schedule.enabled = false;
        assert!(!schedule.is_active_at(at(MON, 12, 0)));
    }

    #[test]
    fn test_validate_rejects_conflicts() {
        let empty_days = Schedule::new(hm(1, 0), hm(2, 0), vec![]);
        assert!(matches!(
            empty_days.validate(),
            Err(EngineError::ScheduleConflict(_))
        ));

        let zero_length = Schedule::new(hm(1, 0), hm(1, 0), vec![Weekday::Fri]);
        assert!(zero_length.validate().is_err());

        assert!(Schedule::new(hm(1, 0), hm(2, 0), vec![Weekday::Fri])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_normalized_dedupes_days() {
        let schedule = Schedule::new(
            hm(1, 0),
            hm(2, 0),
            vec![Weekday::Sun, Weekday::Mon, Weekday::Sun],
        )
        .normalized();
        assert_eq!(schedule.days_of_week, vec![Weekday::Mon, Weekday::Sun]);
    }
}

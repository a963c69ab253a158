//! 任务位池管理模块
//!
//! 管理任务级槽位，决定哪些排队任务能获得运行资格。
//! 优先级只影响排队顺序，已占位的低优先级任务不会被抢占。

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::task::Priority;

/// 任务位
#[derive(Debug, Clone)]
pub struct TaskSlot {
    /// 槽位ID
    pub id: usize,
    /// 占用此位的任务ID
    pub task_id: Option<String>,
}

impl TaskSlot {
    fn new(id: usize) -> Self {
        Self { id, task_id: None }
    }

    /// 检查槽位是否空闲
    pub fn is_free(&self) -> bool {
        self.task_id.is_none()
    }
}

/// 等待准入的候选任务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionCandidate {
    pub id: String,
    pub priority: Priority,
    pub added_time: i64,
    pub sequence: u64,
}

impl AdmissionCandidate {
    /// 准入顺序：优先级降序，添加时间升序
    pub fn admission_cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.added_time.cmp(&other.added_time))
            .then(self.sequence.cmp(&other.sequence))
    }
}

/// 按准入顺序选出至多 `free_slots` 个候选
pub fn select_for_admission(
    mut candidates: Vec<AdmissionCandidate>,
    free_slots: usize,
) -> Vec<AdmissionCandidate> {
    candidates.sort_by(|a, b| a.admission_cmp(b));
    candidates.truncate(free_slots);
    candidates
}

/// 任务位池管理器
#[derive(Debug)]
pub struct TaskSlotPool {
    /// 最大槽位数（支持动态调整）
    max_slots: Arc<AtomicUsize>,
    /// 槽位列表
    slots: Arc<RwLock<Vec<TaskSlot>>>,
}

impl TaskSlotPool {
    /// 创建新的任务位池
    pub fn new(max_slots: usize) -> Self {
        let slots = (0..max_slots).map(TaskSlot::new).collect();

        info!("创建任务位池，最大槽位数: {}", max_slots);

        Self {
            max_slots: Arc::new(AtomicUsize::new(max_slots)),
            slots: Arc::new(RwLock::new(slots)),
        }
    }

    /// 获取最大槽位数
    pub fn max_slots(&self) -> usize {
        self.max_slots.load(Ordering::SeqCst)
    }

    /// 动态调整槽位池容量
    ///
    /// # 缩容策略
    /// - 不会中断已占用的槽位，超出新上限的任务继续运行到完成
    /// - 新的分配只会在新上限范围内进行
    pub async fn resize(&self, new_max: usize) {
        let old_max = self.max_slots.load(Ordering::SeqCst);

        if new_max == old_max {
            debug!("任务位池容量无需调整: {}", old_max);
            return;
        }

        let mut slots = self.slots.write().await;

        if new_max > old_max {
            let existing = slots.len();
            for i in existing..new_max {
                slots.push(TaskSlot::new(i));
            }
            info!("✅ 任务位池扩容: {} -> {}", old_max, new_max);
        } else {
            let occupied_beyond_limit = slots
                .iter()
                .filter(|s| s.id >= new_max && !s.is_free())
                .count();

            if occupied_beyond_limit > 0 {
                warn!(
                    "⚠️ 任务位池缩容: {} -> {} (有 {} 个超出新上限的槽位仍被占用，将继续运行)",
                    old_max, new_max, occupied_beyond_limit
                );
            } else {
                slots.retain(|s| s.id < new_max);
                info!("✅ 任务位池缩容: {} -> {} (已清理空闲槽位)", old_max, new_max);
            }
        }

        self.max_slots.store(new_max, Ordering::SeqCst);
    }

    /// 为任务分配槽位
    ///
    /// 任务已持有槽位时直接返回该槽位；无空闲槽位返回 None
    pub async fn allocate_slot(&self, task_id: &str) -> Option<usize> {
        let max_slots = self.max_slots.load(Ordering::SeqCst);
        let mut slots = self.slots.write().await;

        if let Some(slot) = slots.iter().find(|s| s.task_id.as_deref() == Some(task_id)) {
            return Some(slot.id);
        }

        // 只在有效范围内分配（id < max_slots），且总占用不超过上限
        let used = slots.iter().filter(|s| !s.is_free()).count();
        if used >= max_slots {
            debug!("无可用任务位: task_id={}", task_id);
            return None;
        }

        let slot = slots.iter_mut().find(|s| s.id < max_slots && s.is_free())?;
        slot.task_id = Some(task_id.to_string());
        info!("分配任务位: slot_id={}, task_id={}", slot.id, task_id);
        Some(slot.id)
    }

    /// 释放任务的槽位
    pub async fn release_slot(&self, task_id: &str) -> bool {
        let mut slots = self.slots.write().await;
        let Some(slot) = slots
            .iter_mut()
            .find(|s| s.task_id.as_deref() == Some(task_id))
        else {
            return false;
        };
        info!("释放任务位: slot_id={}, task_id={}", slot.id, task_id);
        slot.task_id = None;
        true
    }

    /// 获取可用槽位数
    pub async fn available_slots(&self) -> usize {
        self.max_slots().saturating_sub(self.used_slots().await)
    }

    /// 获取当前已使用槽位数（包括缩容后仍在运行的超限槽位）
    pub async fn used_slots(&self) -> usize {
        let slots = self.slots.read().await;
        slots.iter().filter(|s| !s.is_free()).count()
    }

    /// 检查任务是否占用槽位
    pub async fn slot_of(&self, task_id: &str) -> Option<usize> {
        let slots = self.slots.read().await;
        slots
            .iter()
            .find(|s| s.task_id.as_deref() == Some(task_id))
            .map(|s| s.id)
    }
}

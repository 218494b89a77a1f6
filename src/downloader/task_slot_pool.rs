//! 任务位池管理模块
//!
//! 决定哪些任务能获得运行资格：每个正在运行的 worker 占用一个槽位，
//! 槽位数即 `max_parallel`，为 0 时不设上限（按需追加槽位）。
//!
//! 槽位池本身不加锁，由调度器在同一把锁内与任务表一起修改。

use tracing::{debug, info, warn};

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

/// 任务位池
#[derive(Debug)]
pub struct TaskSlotPool {
    /// 最大槽位数，0 表示不限
    max_slots: usize,
    /// 槽位列表
    slots: Vec<TaskSlot>,
}

impl TaskSlotPool {
    /// 创建新的任务位池
    pub fn new(max_slots: usize) -> Self {
        let slots = (0..max_slots).map(TaskSlot::new).collect();

        if max_slots == 0 {
            info!("创建任务位池，不限制并发");
        } else {
            info!("创建任务位池，最大槽位数: {}", max_slots);
        }

        Self { max_slots, slots }
    }

    /// 获取最大槽位数（0 表示不限）
    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    fn is_unbounded(&self) -> bool {
        self.max_slots == 0
    }

    /// 动态调整槽位池容量
    ///
    /// # 缩容策略
    /// - 不会中断已占用的槽位，超出新上限的任务继续运行到完成
    /// - 新的分配只会在新上限范围内进行
    pub fn resize(&mut self, new_max: usize) {
        let old_max = self.max_slots;
        if new_max == old_max {
            debug!("任务位池容量无需调整: {}", old_max);
            return;
        }

        self.max_slots = new_max;

        if new_max == 0 {
            info!("✅ 任务位池调整: {} -> 不限", old_max);
            return;
        }

        // 补齐到新上限
        for id in 0..new_max {
            if !self.slots.iter().any(|s| s.id == id) {
                self.slots.push(TaskSlot::new(id));
            }
        }
        self.slots.sort_by_key(|s| s.id);

        let occupied_beyond_limit = self
            .slots
            .iter()
            .filter(|s| s.id >= new_max && !s.is_free())
            .count();

        if occupied_beyond_limit > 0 {
            warn!(
                "⚠️ 任务位池缩容: {} -> {} (有 {} 个超出新上限的槽位仍被占用，将继续运行)",
                old_max, new_max, occupied_beyond_limit
            );
        }

        // 超出上限的空闲槽位直接移除，仍被占用的等释放后再清理
        self.slots.retain(|s| s.id < new_max || !s.is_free());
        info!("✅ 任务位池调整: {} -> {}", old_max, new_max);
    }

    /// 尝试为任务分配槽位
    ///
    /// # Returns
    /// 分配成功返回 Some(slot_id)，否则返回 None
    pub fn allocate(&mut self, task_id: &str) -> Option<usize> {
        let max_slots = self.max_slots;
        let unbounded = self.is_unbounded();

        // 缩容后超出上限的任务仍在运行时，占用数降到上限以下才分配
        if !unbounded && self.used_slots() >= max_slots {
            debug!("任务位已满: task_id={}", task_id);
            return None;
        }

        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|s| (unbounded || s.id < max_slots) && s.is_free())
        {
            slot.task_id = Some(task_id.to_string());
            debug!("分配任务位: slot_id={}, task_id={}", slot.id, task_id);
            return Some(slot.id);
        }

        if unbounded {
            let id = self.slots.iter().map(|s| s.id + 1).max().unwrap_or(0);
            self.slots.push(TaskSlot {
                id,
                task_id: Some(task_id.to_string()),
            });
            debug!("追加任务位: slot_id={}, task_id={}", id, task_id);
            return Some(id);
        }

        debug!("无可用任务位: task_id={}", task_id);
        None
    }

    /// 释放槽位
    ///
    /// 只有当槽位确实属于该任务时才释放
    pub fn release(&mut self, slot_id: usize, task_id: &str) -> bool {
        let released = match self.slots.iter_mut().find(|s| s.id == slot_id) {
            Some(slot) if slot.task_id.as_deref() == Some(task_id) => {
                slot.task_id = None;
                debug!("释放任务位: slot_id={}, task_id={}", slot_id, task_id);
                true
            }
            _ => {
                warn!("任务位释放失败：slot {} 不属于任务 {}", slot_id, task_id);
                false
            }
        };

        // 缩容后遗留的槽位在释放时清理
        if released && !self.is_unbounded() && slot_id >= self.max_slots {
            self.slots.retain(|s| s.id != slot_id);
        }

        released
    }

    /// 可用槽位数，不限并发时返回 None
    pub fn available_slots(&self) -> Option<usize> {
        if self.is_unbounded() {
            return None;
        }
        Some(self.max_slots.saturating_sub(self.used_slots()))
    }

    /// 当前已占用槽位数（包括缩容后仍在运行的）
    pub fn used_slots(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_free()).count()
    }
}

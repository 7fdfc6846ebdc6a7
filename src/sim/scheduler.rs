//! 事件调度器
//!
//! 维护按时间排序的待决事件多重映射（同一时刻内先进先出）、LIFO 触发栈，
//! 以及单调递增的 `last_event_time`。这是仿真内核中对精确度要求最高的部分：
//! 取消语义（`cancel` / `cancel_at` / `cancel_by_handle`）必须与调用方对
//! "event source" 身份的假设完全一致。

use std::collections::{BTreeMap, VecDeque};

use super::event::Event;
use super::time::SimTime;
use super::trigger::TriggerTarget;

/// 可取消事件源的不透明身份。`net::NodeId`/`net::TaskId` 通过简单的奇偶
/// 编码映射到这里，调度器本身不知道节点/任务的含义，只用它做相等性比较。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

/// `schedule_handle` 返回的句柄：精确定位一次待决调度，用于之后的精确取消。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    pub(crate) at: SimTime,
    pub(crate) seq: u64,
    pub(crate) source: SourceId,
}

struct PendingEntry {
    seq: u64,
    source: Option<SourceId>,
    ev: Box<dyn Event>,
}

#[derive(Default)]
pub struct Scheduler {
    pending: BTreeMap<SimTime, VecDeque<PendingEntry>>,
    trigger_stack: Vec<Box<dyn TriggerTarget>>,
    next_seq: u64,
    end_time: Option<SimTime>,
}

impl Scheduler {
    pub fn set_end_time(&mut self, at: SimTime) {
        self.end_time = Some(at);
    }

    pub fn end_time(&self) -> Option<SimTime> {
        self.end_time
    }

    fn clamp(&self, now: SimTime, at: SimTime) -> Option<SimTime> {
        let at = at.max(now);
        if let Some(end) = self.end_time {
            if at >= end {
                return None;
            }
        }
        Some(at)
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    /// `schedule(src, when)`：`when < now` 被钳制到 `now`；超过 `end_time` 时静默忽略。
    pub fn push(&mut self, now: SimTime, source: Option<SourceId>, at: SimTime, ev: Box<dyn Event>) {
        let Some(at) = self.clamp(now, at) else {
            return;
        };
        let seq = self.next_seq();
        self.pending
            .entry(at)
            .or_default()
            .push_back(PendingEntry { seq, source, ev });
    }

    pub fn push_with_handle(
        &mut self,
        now: SimTime,
        source: SourceId,
        at: SimTime,
        ev: Box<dyn Event>,
    ) -> Option<Handle> {
        let Some(at) = self.clamp(now, at) else {
            return None;
        };
        let seq = self.next_seq();
        self.pending.entry(at).or_default().push_back(PendingEntry {
            seq,
            source: Some(source),
            ev,
        });
        Some(Handle { at, seq, source })
    }

    /// `cancel(src)`：按时间顺序线性扫描，移除第一条匹配的待决条目；找不到则静默忽略。
    pub fn cancel(&mut self, source: SourceId) {
        for (_, slot) in self.pending.iter_mut() {
            if let Some(pos) = slot.iter().position(|e| e.source == Some(source)) {
                slot.remove(pos);
                return;
            }
        }
    }

    /// `cancel_at(src, when)`：在指定时间槽中 O(1) 查找；找不到是致命的编程错误。
    pub fn cancel_at(&mut self, source: SourceId, at: SimTime) {
        let found = self
            .pending
            .get_mut(&at)
            .and_then(|slot| slot.iter().position(|e| e.source == Some(source)))
            .map(|pos| {
                self.pending.get_mut(&at).unwrap().remove(pos);
            });
        assert!(
            found.is_some(),
            "cancel_at: no pending event for source {:?} at {:?}",
            source,
            at
        );
    }

    /// `cancel_by_handle`：精确移除；句柄必须引用一个尚未到达的未来时刻且 source 匹配。
    pub fn cancel_by_handle(&mut self, handle: Handle, now: SimTime) {
        assert!(
            handle.at >= now,
            "cancel_by_handle: handle time {:?} is in the past (now={:?})",
            handle.at,
            now
        );
        let removed = self
            .pending
            .get_mut(&handle.at)
            .and_then(|slot| {
                slot.iter()
                    .position(|e| e.seq == handle.seq && e.source == Some(handle.source))
            })
            .map(|pos| {
                self.pending.get_mut(&handle.at).unwrap().remove(pos);
            });
        assert!(
            removed.is_some(),
            "cancel_by_handle: handle did not match a pending entry"
        );
    }

    /// 将目标压入 LIFO 触发栈，等待下一次 `pop_trigger`。
    pub fn activate_trigger(&mut self, target: Box<dyn TriggerTarget>) {
        self.trigger_stack.push(target);
    }

    /// 弹出最近压入的触发目标（LIFO）。
    pub fn pop_trigger(&mut self) -> Option<Box<dyn TriggerTarget>> {
        self.trigger_stack.pop()
    }

    /// 弹出时间最早、同一时刻内插入顺序最早的待决事件。
    pub fn pop_earliest(&mut self) -> Option<(SimTime, Box<dyn Event>)> {
        let at = *self.pending.keys().next()?;
        let slot = self.pending.get_mut(&at).unwrap();
        let entry = slot.pop_front().unwrap();
        if slot.is_empty() {
            self.pending.remove(&at);
        }
        Some((at, entry.ev))
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.trigger_stack.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.values().map(|q| q.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl Event for Noop {
        fn execute(self: Box<Self>, _sim: &mut super::super::Simulator, _world: &mut dyn super::super::World) {}
    }

    #[test]
    fn fifo_within_same_timestamp() {
        let mut s = Scheduler::default();
        let t = SimTime::from_millis(1);
        s.push(SimTime::ZERO, Some(SourceId(1)), t, Box::new(Noop));
        s.push(SimTime::ZERO, Some(SourceId(2)), t, Box::new(Noop));
        let (_, _) = s.pop_earliest().unwrap();
        // second entry (source 2) should still be pending, in FIFO order
        assert_eq!(s.pending_len(), 1);
    }

    #[test]
    fn schedule_in_past_is_clamped_to_now() {
        let mut s = Scheduler::default();
        let now = SimTime::from_millis(5);
        s.push(now, None, SimTime::ZERO, Box::new(Noop));
        let (at, _) = s.pop_earliest().unwrap();
        assert_eq!(at, now);
    }

    #[test]
    fn end_time_drops_events_at_or_past_it() {
        let mut s = Scheduler::default();
        s.set_end_time(SimTime::from_millis(10));
        s.push(SimTime::ZERO, None, SimTime::from_millis(10), Box::new(Noop));
        s.push(SimTime::ZERO, None, SimTime::from_millis(20), Box::new(Noop));
        assert!(s.pop_earliest().is_none());
    }

    #[test]
    #[should_panic(expected = "no pending event")]
    fn cancel_at_miss_is_fatal() {
        let mut s = Scheduler::default();
        s.cancel_at(SourceId(1), SimTime::ZERO);
    }

    #[test]
    fn cancel_removes_first_matching_entry() {
        let mut s = Scheduler::default();
        s.push(SimTime::ZERO, Some(SourceId(9)), SimTime::from_millis(1), Box::new(Noop));
        s.cancel(SourceId(9));
        assert!(s.pop_earliest().is_none());
    }
}

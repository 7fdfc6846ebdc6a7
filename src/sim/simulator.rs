//! 仿真器上下文
//!
//! `Simulator` 取代源码中的全局可变状态（调度器单例、流 ID 计数器、确定性
//! 随机数）：它被显式地以 `&mut Simulator` 传给构造函数和事件处理器，
//! 使得多次独立仿真运行互不干扰成为可能。

use super::event::Event;
use super::scheduler::{Handle, Scheduler, SourceId};
use super::time::SimTime;
use super::trigger::TriggerTarget;
use super::world::World;
use tracing::{debug, info, trace};

/// 动态分配的流 ID 从这里开始；往下是保留给调用方手工指定的范围。
pub const DYNAMIC_FLOW_ID_BASE: u64 = 1 << 32;

#[derive(Default)]
pub struct Simulator {
    now: SimTime,
    scheduler: Scheduler,
    next_pkt_id: u64,
    next_flow_id: u64,
    rng_state: u64,
}

impl Simulator {
    /// 用给定的确定性种子创建仿真器（影响 ECMP 盐、队列随机丢弃等所有用到
    /// `next_rng_u64`/`coin_flip` 的地方）。
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng_state: seed,
            ..Self::default()
        }
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    pub fn set_end_time(&mut self, at: SimTime) {
        self.scheduler.set_end_time(at);
    }

    /// 分配下一个数据包 ID。
    pub fn alloc_pkt_id(&mut self) -> u64 {
        let id = self.next_pkt_id;
        self.next_pkt_id = self.next_pkt_id.wrapping_add(1);
        id
    }

    /// 分配下一个动态流 ID（位于 [`DYNAMIC_FLOW_ID_BASE`], ∞) 区间）。
    pub fn alloc_flow_id(&mut self) -> u64 {
        if self.next_flow_id < DYNAMIC_FLOW_ID_BASE {
            self.next_flow_id = DYNAMIC_FLOW_ID_BASE;
        }
        let id = self.next_flow_id;
        self.next_flow_id = self.next_flow_id.wrapping_add(1);
        id
    }

    /// splitmix64 风格的确定性伪随机数：供 ECMP 盐、随机丢弃、composite-priority
    /// 的公平掷硬币等需要"同一个种子复现同一个结果"的地方统一使用。
    pub fn next_rng_u64(&mut self) -> u64 {
        self.rng_state = self.rng_state.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = self.rng_state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }

    pub fn coin_flip(&mut self) -> bool {
        self.next_rng_u64() & 1 == 0
    }

    #[tracing::instrument(skip(self, ev), fields(event_type = std::any::type_name::<E>(), at = ?at))]
    pub fn schedule<E: Event>(&mut self, at: SimTime, ev: E) {
        trace!(now = ?self.now, "调度事件（无 source）");
        self.scheduler.push(self.now, None, at, Box::new(ev));
    }

    pub fn schedule_rel<E: Event>(&mut self, delta: SimTime, ev: E) {
        let at = self.now.saturating_add(delta);
        self.schedule(at, ev);
    }

    #[tracing::instrument(skip(self, ev), fields(event_type = std::any::type_name::<E>(), source = ?source, at = ?at))]
    pub fn schedule_for<E: Event>(&mut self, source: SourceId, at: SimTime, ev: E) {
        trace!(now = ?self.now, "调度事件（带 source，可取消）");
        self.scheduler.push(self.now, Some(source), at, Box::new(ev));
    }

    pub fn schedule_handle<E: Event>(&mut self, source: SourceId, at: SimTime, ev: E) -> Option<Handle> {
        self.scheduler.push_with_handle(self.now, source, at, Box::new(ev))
    }

    pub fn cancel(&mut self, source: SourceId) {
        self.scheduler.cancel(source);
    }

    pub fn cancel_at(&mut self, source: SourceId, at: SimTime) {
        self.scheduler.cancel_at(source, at);
    }

    pub fn cancel_by_handle(&mut self, handle: Handle) {
        self.scheduler.cancel_by_handle(handle, self.now);
    }

    /// `reschedule(src, when) := cancel(src); schedule(src, when)`。
    pub fn reschedule<E: Event>(&mut self, source: SourceId, at: SimTime, ev: E) {
        self.scheduler.cancel(source);
        self.schedule_for(source, at, ev);
    }

    pub fn activate_trigger<T: TriggerTarget>(&mut self, target: T) {
        self.scheduler.activate_trigger(Box::new(target));
    }

    pub(crate) fn activate_trigger_boxed(&mut self, target: Box<dyn TriggerTarget>) {
        self.scheduler.activate_trigger(target);
    }

    /// 推进一步：优先清空触发栈（不消耗时间），否则取出时间最早的待决事件。
    pub fn do_next_event(&mut self, world: &mut dyn World) -> bool {
        if let Some(target) = self.scheduler.pop_trigger() {
            target.activate(self, world);
            return true;
        }
        let Some((at, ev)) = self.scheduler.pop_earliest() else {
            return false;
        };
        assert!(at >= self.now, "scheduler time must be monotonically non-decreasing");
        self.now = at;
        debug!(now = ?self.now, remaining = self.scheduler.pending_len(), "执行事件");
        ev.execute(self, world);
        world.on_tick(self);
        true
    }

    /// 运行直到触发栈与待决事件都耗尽。
    #[tracing::instrument(skip(self, world))]
    pub fn run(&mut self, world: &mut dyn World) {
        info!("▶️  开始运行仿真");
        let mut n = 0u64;
        while self.do_next_event(world) {
            n += 1;
        }
        info!(total_events = n, final_time = ?self.now, "✅ 仿真完成");
    }

    /// 运行到指定截止时间（含）为止；`end_time` 之后的事件不会被调度。
    pub fn run_until(&mut self, until: SimTime, world: &mut dyn World) {
        self.set_end_time(until);
        self.run(world);
        self.now = self.now.max(until);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::World;
    use std::any::Any;

    #[derive(Default)]
    struct NullWorld;
    impl World for NullWorld {
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct Mark(std::sync::Arc<std::sync::atomic::AtomicU64>, SimTime);
    impl Event for Mark {
        fn execute(self: Box<Self>, sim: &mut Simulator, _world: &mut dyn World) {
            self.0.store(sim.now().as_ps(), std::sync::atomic::Ordering::SeqCst);
            let _ = self.1;
        }
    }

    #[test]
    fn time_never_goes_backwards() {
        let mut sim = Simulator::default();
        let mut world = NullWorld;
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
        sim.schedule(SimTime::from_millis(5), Mark(seen.clone(), SimTime::ZERO));
        sim.schedule(SimTime::from_millis(1), Mark(seen.clone(), SimTime::ZERO));
        sim.run(&mut world);
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), SimTime::from_millis(5).as_ps());
    }

    #[test]
    fn reschedule_then_schedule_matches_single_schedule() {
        let mut sim = Simulator::default();
        let mut world = NullWorld;
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
        let src = SourceId(42);
        let h = sim
            .schedule_handle(src, SimTime::from_millis(3), Mark(seen.clone(), SimTime::ZERO))
            .unwrap();
        sim.cancel_by_handle(h);
        sim.schedule_for(src, SimTime::from_millis(3), Mark(seen.clone(), SimTime::ZERO));
        sim.run(&mut world);
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), SimTime::from_millis(3).as_ps());
    }

    #[test]
    fn dynamic_flow_ids_never_collide_with_user_range() {
        let mut sim = Simulator::default();
        let a = sim.alloc_flow_id();
        let b = sim.alloc_flow_id();
        assert!(a >= DYNAMIC_FLOW_ID_BASE);
        assert!(b > a);
    }

    #[test]
    fn rng_is_deterministic_given_seed() {
        let mut a = Simulator::with_seed(7);
        let mut b = Simulator::with_seed(7);
        for _ in 0..8 {
            assert_eq!(a.next_rng_u64(), b.next_rng_u64());
        }
    }
}

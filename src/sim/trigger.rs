//! 触发器（Trigger）
//!
//! `TriggerTarget` 在被触发时立即激活（不消耗仿真时间），由调度器的 LIFO
//! 触发栈承载。三种变体对应 single-shot / multi-shot / barrier 语义。

use super::simulator::Simulator;
use super::world::World;

/// 被触发对象：在 `now` 不变的情况下立即执行。
pub trait TriggerTarget: Send + 'static {
    fn activate(self: Box<Self>, sim: &mut Simulator, world: &mut dyn World);
}

/// 单次触发：第一次 `fire()` 把所有目标压入触发栈；再次 `fire()` 是编程错误。
#[derive(Default)]
pub struct SingleShotTrigger {
    targets: Vec<Box<dyn TriggerTarget>>,
    fired: bool,
}

impl SingleShotTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_target<T: TriggerTarget>(&mut self, target: T) {
        assert!(!self.fired, "cannot add a target to an already-fired trigger");
        self.targets.push(Box::new(target));
    }

    /// 触发：将所有目标压入调度器的触发栈。
    pub fn fire(&mut self, sim: &mut Simulator) {
        assert!(!self.fired, "SingleShotTrigger fired more than once");
        self.fired = true;
        for target in self.targets.drain(..) {
            sim.activate_trigger_boxed(target);
        }
    }
}

/// 多次触发：每次 `fire()` 激活列表中的下一个目标（按顺序）。
#[derive(Default)]
pub struct MultiShotTrigger {
    targets: Vec<Box<dyn TriggerTarget>>,
    next: usize,
}

impl MultiShotTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_target<T: TriggerTarget>(&mut self, target: T) {
        self.targets.push(Box::new(target));
    }

    /// 激活下一个目标；若已耗尽则不做任何事。
    pub fn fire(&mut self, sim: &mut Simulator) {
        if self.next >= self.targets.len() {
            return;
        }
        let target = std::mem::replace(&mut self.targets[self.next], Box::new(NoopTarget));
        self.next += 1;
        sim.activate_trigger_boxed(target);
    }
}

struct NoopTarget;
impl TriggerTarget for NoopTarget {
    fn activate(self: Box<Self>, _sim: &mut Simulator, _world: &mut dyn World) {}
}

/// 屏障触发：第 N 次激活才真正触发所有目标，之前的调用只是递减计数。
pub struct BarrierTrigger {
    targets: Vec<Box<dyn TriggerTarget>>,
    remaining: u32,
}

impl BarrierTrigger {
    pub fn new(n: u32) -> Self {
        Self {
            targets: Vec::new(),
            remaining: n.max(1),
        }
    }

    pub fn add_target<T: TriggerTarget>(&mut self, target: T) {
        self.targets.push(Box::new(target));
    }

    /// 递减屏障计数；到零时把所有目标压入触发栈。
    pub fn fire(&mut self, sim: &mut Simulator) {
        if self.remaining == 0 {
            return;
        }
        self.remaining -= 1;
        if self.remaining == 0 {
            for target in self.targets.drain(..) {
                sim.activate_trigger_boxed(target);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::World;
    use std::any::Any;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct NullWorld;
    impl World for NullWorld {
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct CountTarget(Arc<AtomicU32>);
    impl TriggerTarget for CountTarget {
        fn activate(self: Box<Self>, _sim: &mut Simulator, _world: &mut dyn World) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn single_shot_fires_all_targets_without_elapsing_time() {
        let mut sim = Simulator::default();
        let mut world = NullWorld;
        let counter = Arc::new(AtomicU32::new(0));

        let mut trig = SingleShotTrigger::new();
        trig.add_target(CountTarget(counter.clone()));
        trig.add_target(CountTarget(counter.clone()));
        let before = sim.now();
        trig.fire(&mut sim);

        while sim.do_next_event(&mut world) {}
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(sim.now(), before);
    }

    #[test]
    #[should_panic(expected = "fired more than once")]
    fn single_shot_second_fire_panics() {
        let mut sim = Simulator::default();
        let mut trig = SingleShotTrigger::new();
        trig.fire(&mut sim);
        trig.fire(&mut sim);
    }

    #[test]
    fn barrier_only_fires_on_nth_activation() {
        let mut sim = Simulator::default();
        let mut world = NullWorld;
        let counter = Arc::new(AtomicU32::new(0));

        let mut barrier = BarrierTrigger::new(3);
        barrier.add_target(CountTarget(counter.clone()));

        barrier.fire(&mut sim);
        barrier.fire(&mut sim);
        while sim.do_next_event(&mut world) {}
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        barrier.fire(&mut sim);
        while sim.do_next_event(&mut world) {}
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn multi_shot_fires_targets_in_order() {
        let mut sim = Simulator::default();
        let mut world = NullWorld;
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        struct PushTarget(Arc<std::sync::Mutex<Vec<u32>>>, u32);
        impl TriggerTarget for PushTarget {
            fn activate(self: Box<Self>, _sim: &mut Simulator, _world: &mut dyn World) {
                self.0.lock().unwrap().push(self.1);
            }
        }

        let mut trig = MultiShotTrigger::new();
        trig.add_target(PushTarget(order.clone(), 1));
        trig.add_target(PushTarget(order.clone(), 2));

        trig.fire(&mut sim);
        while sim.do_next_event(&mut world) {}
        trig.fire(&mut sim);
        while sim.do_next_event(&mut world) {}
        trig.fire(&mut sim); // exhausted, no-op

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }
}

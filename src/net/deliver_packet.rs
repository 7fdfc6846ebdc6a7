//! 转发图的两个基础事件
//!
//! `DeliverPacket` 把一个包交给某个 sink 的 `receive_packet`；`WakeSink` 在
//! sink 自己安排的服务时刻到达时调用它的 `on_wake`（不携带包——包已经存在
//! sink 内部的状态里，比如 `Pipe::in_flight` 或某个队列的积压）。

use super::id::{NodeId, TaskId};
use super::net_world::NetWorld;
use super::packet::Packet;
use crate::sim::{Event, Simulator, World};
use tracing::{debug, trace};

#[derive(Debug)]
pub struct DeliverPacket {
    pub to: NodeId,
    pub pkt: Packet,
}

impl Event for DeliverPacket {
    #[tracing::instrument(skip(self, sim, world), fields(pkt_id = self.pkt.id, flow_id = self.pkt.flow_id, to = ?self.to))]
    fn execute(self: Box<Self>, sim: &mut Simulator, world: &mut dyn World) {
        let DeliverPacket { to, pkt } = *self;
        debug!(now = ?sim.now(), "数据包到达节点");
        let w = world
            .as_any_mut()
            .downcast_mut::<NetWorld>()
            .expect("world must be NetWorld");
        w.net.deliver(to, pkt, None, sim);
        trace!("DeliverPacket::execute 完成");
    }
}

#[derive(Debug)]
pub struct WakeSink {
    pub to: NodeId,
}

impl Event for WakeSink {
    #[tracing::instrument(skip(self, sim, world), fields(to = ?self.to))]
    fn execute(self: Box<Self>, sim: &mut Simulator, world: &mut dyn World) {
        let WakeSink { to } = *self;
        trace!(now = ?sim.now(), "唤醒 sink");
        let w = world
            .as_any_mut()
            .downcast_mut::<NetWorld>()
            .expect("world must be NetWorld");
        w.net.wake(to, sim);
    }
}

/// 唤醒一个没有位置、按固定周期运行的后台任务（见 `net::BackgroundTask`）。
#[derive(Debug)]
pub struct WakeTask {
    pub id: TaskId,
}

impl Event for WakeTask {
    #[tracing::instrument(skip(self, sim, world), fields(id = ?self.id))]
    fn execute(self: Box<Self>, sim: &mut Simulator, world: &mut dyn World) {
        let WakeTask { id } = *self;
        trace!(now = ?sim.now(), "唤醒后台任务");
        let w = world
            .as_any_mut()
            .downcast_mut::<NetWorld>()
            .expect("world must be NetWorld");
        w.net.run_task(id, sim);
    }
}

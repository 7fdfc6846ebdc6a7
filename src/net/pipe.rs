//! 传播延迟管道
//!
//! 固定时延 `D`；维护一个按到达顺序增长的 `(departure_time, packet)` 环，
//! `receive_packet` 记录 `now+D`，若之前为空则安排自己在 `now+D` 醒来；
//! `on_wake` 弹出队首，调用 `send_on()` 转发，并在还有剩余包时安排下一次
//! 在新队首的出发时间醒来。管道内部从不排队等待带宽——它只是延迟。

use std::collections::VecDeque;

use super::deliver_packet::WakeSink;
use super::id::NodeId;
use super::network::Network;
use super::packet::Packet;
use super::sink::Sink;
use crate::sim::{SimTime, Simulator};
use tracing::trace;

pub struct Pipe {
    id: NodeId,
    name: String,
    delay: SimTime,
    in_flight: VecDeque<(SimTime, Packet)>,
    scheduled_wakeup: bool,
}

impl Pipe {
    pub fn new(id: NodeId, name: impl Into<String>, delay: SimTime) -> Self {
        Self {
            id,
            name: name.into(),
            delay,
            in_flight: VecDeque::new(),
            scheduled_wakeup: false,
        }
    }

    pub fn delay(&self) -> SimTime {
        self.delay
    }
}

impl Sink for Pipe {
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(skip(self, pkt, sim, _net), fields(pipe = %self.name, pkt_id = pkt.id))]
    fn receive_packet(&mut self, pkt: Packet, _prev_vq: Option<usize>, sim: &mut Simulator, _net: &mut Network) {
        let departure = sim.now().saturating_add(self.delay);
        trace!(departure = ?departure, "包进入管道");
        let was_empty = self.in_flight.is_empty();
        self.in_flight.push_back((departure, pkt));
        if was_empty && !self.scheduled_wakeup {
            sim.schedule_for(self.id.source_id(), departure, WakeSink { to: self.id });
            self.scheduled_wakeup = true;
        }
    }

    #[tracing::instrument(skip(self, sim, net), fields(pipe = %self.name))]
    fn on_wake(&mut self, sim: &mut Simulator, net: &mut Network) {
        let Some((_, mut pkt)) = self.in_flight.pop_front() else {
            self.scheduled_wakeup = false;
            return;
        };
        if let Some(next) = pkt.send_on() {
            net.deliver(next, pkt, None, sim);
        } else {
            net.on_delivered(pkt);
        }
        if let Some((next_departure, _)) = self.in_flight.front() {
            sim.schedule_for(self.id.source_id(), *next_departure, WakeSink { to: self.id });
            self.scheduled_wakeup = true;
        } else {
            self.scheduled_wakeup = false;
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::net_world::NetWorld;
    use crate::net::packet::{PacketKind, Route};
    use crate::sim::Simulator;

    #[test]
    fn pipe_delivers_exactly_after_fixed_delay() {
        let mut net = Network::default();
        let host_a = net.add_host("a");
        let pipe_id = net.add_sink(|id| Box::new(Pipe::new(id, "p", SimTime::from_micros(10))));
        let host_b = net.add_host("b");
        let mut sim = Simulator::default();
        let mut world = NetWorld::new(net);

        let mut pkt = world.net.pool.alloc(PacketKind::TcpData);
        pkt.dst = host_b;
        pkt.set_route(Route::new(vec![pipe_id, host_b]));
        world.net.deliver(pipe_id, pkt, None, &mut sim);
        let _ = host_a;

        sim.run(&mut world);
        assert_eq!(world.net.stats.delivered_pkts, 1);
        assert_eq!(sim.now(), SimTime::from_micros(10));
    }
}

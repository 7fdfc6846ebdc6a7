//! QueueSink：把任意 `QueueDiscipline` 接到调度器上
//!
//! 非空态开始服务时安排自己在 `now + drain_time(head)` 醒来；服务完成后
//! `send_on()` 转发，如果队列仍非空就安排下一个头部的服务时刻。忙时利用率
//! 跟踪器在每次服务开始/结束时更新，供自适应路由读取。

use super::utilization::{quantized_queuesize, UtilizationTracker};
use super::QueueDiscipline;
use crate::net::{Network, NodeId, Packet, QueueStatus, Sink, WakeSink};
use crate::sim::{drain_time, SimTime, Simulator};
use tracing::{debug, trace};

pub struct QueueSink<D: QueueDiscipline> {
    id: NodeId,
    name: String,
    discipline: D,
    bitrate_bps: u64,
    max_bytes: u64,
    utilization: UtilizationTracker,
    serving: bool,
}

impl<D: QueueDiscipline> QueueSink<D> {
    pub fn new(id: NodeId, name: impl Into<String>, discipline: D, bitrate_bps: u64, max_bytes: u64) -> Self {
        Self {
            id,
            name: name.into(),
            discipline,
            bitrate_bps,
            max_bytes,
            utilization: UtilizationTracker::new(SimTime::from_millis(100)),
            serving: false,
        }
    }

    pub fn queue_bytes(&self) -> u64 {
        self.discipline.bytes()
    }

    pub fn queue_len(&self) -> usize {
        self.discipline.len()
    }

    pub fn quantized_queuesize(&self) -> u8 {
        quantized_queuesize(self.discipline.bytes(), self.max_bytes)
    }

    pub fn quantized_utilization(&self, sim: &Simulator) -> u8 {
        self.utilization.quantized_utilization(sim.now())
    }

    fn begin_service_if_idle(&mut self, sim: &mut Simulator) {
        if self.serving {
            return;
        }
        let Some(head) = self.discipline.peek_next() else {
            return;
        };
        self.serving = true;
        self.utilization.on_service_start(sim.now());
        let at = sim.now().saturating_add(drain_time(head.size, self.bitrate_bps));
        sim.schedule_for(self.id.source_id(), at, WakeSink { to: self.id });
    }
}

impl<D: QueueDiscipline + 'static> Sink for QueueSink<D> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(skip(self, pkt, sim, _net), fields(queue = %self.name, pkt_id = pkt.id))]
    fn receive_packet(&mut self, pkt: Packet, _prev_vq: Option<usize>, sim: &mut Simulator, _net: &mut Network) {
        let before = self.discipline.bytes();
        match self.discipline.admit(pkt, before, self.max_bytes) {
            Ok(()) => {
                trace!(queue_bytes = self.discipline.bytes(), "入队成功");
                self.begin_service_if_idle(sim);
            }
            Err(dropped) => {
                debug!(pkt_id = dropped.id, "队列已满，丢弃");
                _net.on_dropped(dropped);
            }
        }
    }

    #[tracing::instrument(skip(self, sim, net), fields(queue = %self.name))]
    fn on_wake(&mut self, sim: &mut Simulator, net: &mut Network) {
        self.utilization.on_service_end(sim.now());
        self.serving = false;
        let Some(mut pkt) = self.discipline.pop_next() else {
            return;
        };
        if let Some(next) = pkt.send_on() {
            net.deliver(next, pkt, None, sim);
        } else {
            net.on_delivered(pkt);
        }
        self.begin_service_if_idle(sim);
    }

    fn queue_status(&self, sim: &Simulator) -> Option<QueueStatus> {
        Some(QueueStatus {
            paused: false,
            quantized_queuesize: self.quantized_queuesize(),
            quantized_utilization: self.quantized_utilization(sim),
        })
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::NetWorld;
    use crate::net::{PacketKind, Route};
    use crate::queue::FifoQueue;

    #[test]
    fn queue_drains_at_link_rate_then_delivers() {
        let mut net = Network::default();
        let host_b = net.add_host("b");
        let queue_id = net.add_sink(|id| {
            Box::new(QueueSink::new(id, "q", FifoQueue::new(), 8_000_000_000, 1_000_000))
        });
        let mut sim = Simulator::default();
        let mut world = NetWorld::new(net);

        let mut pkt = world.net.pool.alloc(PacketKind::TcpData);
        pkt.size = 1000;
        pkt.dst = host_b;
        pkt.set_route(Route::new(vec![queue_id, host_b]));
        world.net.deliver(queue_id, pkt, None, &mut sim);

        sim.run(&mut world);
        assert_eq!(world.net.stats.delivered_pkts, 1);
        assert!(sim.now() > SimTime::ZERO);
    }
}

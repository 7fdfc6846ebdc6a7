//! DCTCP 发送端 / 接收端
//!
//! 在 TCP 的 Reno 框架之上叠加显式拥塞通知反馈：接收端对每个收到 CE 标记的
//! 包在其 ACK 上置位 ECN-Echo；发送端按窗口（一个 RTT）统计 `pkts_seen`/
//! `pkts_marked`，更新 `alpha := 15/16·alpha + 1/16·f`（`f` 为本窗口被标记的
//! 比例），并在窗口末尾按 `cwnd := max(mss, floor(cwnd·(1-alpha/2)))`
//! 收缩拥塞窗口——不像 Reno 那样整窗口腰斩，而是按标记比例做比例式收缩。
//! 丢包信号（3 个重复 ACK / RTO）仍然走和 [`super::tcp`] 一样的 Reno 反应：
//! ECN 管拥塞避免阶段的窗口收缩，dup-ACK/RTO 管丢包阶段的窗口收缩，两者
//! 并不互斥。

use std::collections::BTreeMap;

use super::tcp::{DUPACK_THRESHOLD, INIT_SSTHRESH_SEGS, rtx_reschedule_offset};
use crate::net::{Flags, Network, NodeId, Packet, PacketKind, Route, Sink, TransportPayload};
use crate::sim::{SimTime, Simulator};
use tracing::{debug, trace};

pub const INIT_CWND_SEGS: u64 = 10;
pub const INIT_RTO: SimTime = SimTime::from_millis(10);
pub const MIN_RTO: SimTime = SimTime::from_millis(10);
/// alpha EWMA 的增益 g=1/16（经典 DCTCP 论文取值）。
const ALPHA_GAIN_NUM: u64 = 1;
const ALPHA_GAIN_DEN: u64 = 16;

#[derive(Debug, Clone)]
struct InflightSeg {
    len: u32,
    sent_at: SimTime,
    retransmitted: bool,
}

pub struct DctcpSender {
    id: NodeId,
    name: String,
    dst: NodeId,
    flow_id: u64,
    mss: u32,
    route: Route,
    total_bytes: u64,

    next_seq: u64,
    last_acked: u64,
    cwnd: u64,
    ssthresh: u64,
    dup_acks: u32,
    recover: u64,
    in_fast_recovery: bool,
    inflight: BTreeMap<u64, InflightSeg>,

    srtt: Option<SimTime>,
    rttvar: SimTime,
    rto: SimTime,
    rto_deadline: Option<SimTime>,
    backoff_exp: u32,
    rtx_pending: bool,

    // DCTCP alpha 窗口统计：以 `window_end`（发起窗口时的 next_seq）为界，
    // ack 推进越过它就结算一次。
    alpha_milli: u64, // alpha * 1000，定点数避免在仿真核心里引入浮点
    window_end: u64,
    pkts_seen: u64,
    pkts_marked: u64,

    done_at: Option<SimTime>,
}

impl DctcpSender {
    pub fn new(id: NodeId, name: impl Into<String>, dst: NodeId, route: Route, flow_id: u64, mss: u32, total_bytes: u64) -> Self {
        let cwnd = (mss as u64) * INIT_CWND_SEGS;
        Self {
            id,
            name: name.into(),
            dst,
            flow_id,
            mss,
            route,
            total_bytes,
            next_seq: 0,
            last_acked: 0,
            cwnd,
            ssthresh: (mss as u64) * INIT_SSTHRESH_SEGS,
            dup_acks: 0,
            recover: 0,
            in_fast_recovery: false,
            inflight: BTreeMap::new(),
            srtt: None,
            rttvar: SimTime::ZERO,
            rto: INIT_RTO,
            rto_deadline: None,
            backoff_exp: 0,
            rtx_pending: false,
            alpha_milli: 0,
            window_end: cwnd,
            pkts_seen: 0,
            pkts_marked: 0,
            done_at: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done_at.is_some()
    }

    pub fn alpha(&self) -> f64 {
        self.alpha_milli as f64 / 1000.0
    }

    fn inflight_bytes(&self) -> u64 {
        self.inflight.values().map(|s| s.len as u64).sum()
    }

    fn earliest_unacked(&self) -> Option<(u64, InflightSeg)> {
        self.inflight.iter().next().map(|(&s, seg)| (s, seg.clone()))
    }

    fn make_data_packet(&self, net: &mut Network) -> Packet {
        let mut pkt = net.pool.alloc(PacketKind::DctcpData);
        pkt.dst = self.dst;
        pkt.flow_id = self.flow_id;
        pkt.set_route(self.route.clone());
        pkt
    }

    #[tracing::instrument(skip(self, sim, net), fields(sender = %self.name, flow = self.flow_id))]
    pub fn send_packets(&mut self, sim: &mut Simulator, net: &mut Network) {
        if self.done_at.is_some() {
            return;
        }
        let mut avail = self.cwnd.saturating_sub(self.inflight_bytes());
        while avail > 0 && self.next_seq < self.total_bytes {
            let remain = self.total_bytes - self.next_seq;
            let len = (self.mss as u64).min(remain).min(avail) as u32;
            if len == 0 {
                break;
            }
            let seq = self.next_seq;
            self.next_seq += len as u64;
            avail = avail.saturating_sub(len as u64);

            let mut pkt = self.make_data_packet(net);
            pkt.size = self.mss;
            pkt.id = sim.alloc_pkt_id();
            pkt.transport = TransportPayload::DctcpData { seqno: seq, ts: sim.now().as_ps() };
            trace!(seq, len, "发送数据段");
            net.forward_from(self.id, pkt, sim);
            self.inflight.insert(seq, InflightSeg { len, sent_at: sim.now(), retransmitted: false });
        }
        self.ensure_rto(sim);
    }

    fn retransmit_earliest(&mut self, sim: &mut Simulator, net: &mut Network) {
        let Some((seq, _)) = self.earliest_unacked() else { return };
        let mut pkt = self.make_data_packet(net);
        pkt.size = self.mss;
        pkt.id = sim.alloc_pkt_id();
        pkt.transport = TransportPayload::DctcpData { seqno: seq, ts: sim.now().as_ps() };
        net.forward_from(self.id, pkt, sim);
        if let Some(entry) = self.inflight.get_mut(&seq) {
            entry.sent_at = sim.now();
            entry.retransmitted = true;
        }
    }

    fn update_rto_sample(&mut self, sample: SimTime) {
        if let Some(srtt) = self.srtt {
            let diff = if sample.0 >= srtt.0 { sample.0 - srtt.0 } else { srtt.0 - sample.0 };
            self.rttvar = SimTime((self.rttvar.0 * 3 / 4).saturating_add(diff / 4));
            self.srtt = Some(SimTime((srtt.0 * 7 / 8).saturating_add(sample.0 / 8)));
        } else {
            self.srtt = Some(sample);
            self.rttvar = SimTime(sample.0 / 2);
        }
        let srtt = self.srtt.unwrap();
        let rto = srtt.0.saturating_add(self.rttvar.0.saturating_mul(4)).max(MIN_RTO.0);
        self.rto = SimTime(rto);
        self.backoff_exp = 0;
    }

    fn ensure_rto(&mut self, sim: &mut Simulator) {
        if self.rto_deadline.is_some() || self.inflight.is_empty() {
            return;
        }
        self.rto_deadline = Some(sim.now().saturating_add(self.rto));
    }

    fn restart_rto(&mut self, sim: &mut Simulator) {
        self.rto_deadline = if self.inflight.is_empty() { None } else { Some(sim.now().saturating_add(self.rto)) };
    }

    /// 窗口结算：先把 `ssthresh` 钳制到不超过当前 `cwnd`（上一轮丢包反应可能
    /// 把它抬得比 cwnd 还高，ECN 的比例式收缩要在一个干净的基准上进行），
    /// 再算 `f = pkts_marked/pkts_seen`，`alpha := (15·alpha + f)/16`，按比例
    /// 收缩 cwnd；随后开启下一个窗口（`window_end := next_seq`，计数器清零）。
    fn maybe_settle_window(&mut self, ackno: u64) {
        if ackno < self.window_end {
            return;
        }
        if self.ssthresh > self.cwnd {
            self.ssthresh = self.cwnd;
        }
        if self.pkts_seen > 0 {
            let f_milli = self.pkts_marked.saturating_mul(1000) / self.pkts_seen;
            let keep = ALPHA_GAIN_DEN - ALPHA_GAIN_NUM;
            self.alpha_milli = (self.alpha_milli.saturating_mul(keep).saturating_add(f_milli * ALPHA_GAIN_NUM)) / ALPHA_GAIN_DEN;
            if self.alpha_milli > 0 {
                let shrink_milli = 1000u64.saturating_sub(self.alpha_milli / 2);
                let mss = self.mss as u64;
                self.cwnd = (self.cwnd.saturating_mul(shrink_milli) / 1000).max(mss);
            }
        }
        self.pkts_seen = 0;
        self.pkts_marked = 0;
        self.window_end = self.next_seq;
    }

    #[tracing::instrument(skip(self, sim, net), fields(sender = %self.name))]
    fn on_ack(&mut self, ackno: u64, ecn_echo: bool, sim: &mut Simulator, net: &mut Network) {
        if ackno > self.last_acked {
            self.rtx_pending = false; // 连接仍在往前走，作废任何已安排的抖动重传
            self.pkts_seen = self.pkts_seen.saturating_add(1);
            if ecn_echo {
                self.pkts_marked = self.pkts_marked.saturating_add(1);
            }

            let now = sim.now();
            let mut rtt_sample = None;
            for (&s, seg) in self.inflight.iter() {
                let end = s.saturating_add(seg.len as u64);
                if end <= ackno {
                    if !seg.retransmitted {
                        rtt_sample = Some(SimTime(now.0.saturating_sub(seg.sent_at.0)));
                    }
                } else {
                    break;
                }
            }
            if let Some(sample) = rtt_sample {
                self.update_rto_sample(sample);
            }

            let to_remove: Vec<u64> = self
                .inflight
                .iter()
                .take_while(|(&s, seg)| s.saturating_add(seg.len as u64) <= ackno)
                .map(|(&s, _)| s)
                .collect();
            for s in to_remove {
                self.inflight.remove(&s);
            }

            let prev_acked = self.last_acked;
            self.last_acked = ackno;
            self.dup_acks = 0;
            let mss = self.mss as u64;

            if self.in_fast_recovery {
                if ackno >= self.recover {
                    let flightsize = self.next_seq.saturating_sub(ackno);
                    self.cwnd = self.ssthresh.min(flightsize.saturating_add(mss));
                    self.in_fast_recovery = false;
                } else {
                    let new_data = ackno.saturating_sub(prev_acked);
                    self.cwnd = self.cwnd.saturating_sub(new_data).saturating_add(mss);
                    self.retransmit_earliest(sim, net);
                }
            } else {
                // ECN 反馈只在窗口结算时收缩；两次结算之间按普通 TCP 方式增长。
                self.cwnd = self.cwnd.saturating_add(mss);
            }

            self.maybe_settle_window(ackno);

            if self.last_acked >= self.total_bytes {
                self.done_at = Some(sim.now());
                self.rto_deadline = None;
                self.rtx_pending = false;
                return;
            }
            self.restart_rto(sim);
            self.send_packets(sim, net);
        } else if ackno == self.last_acked {
            if self.in_fast_recovery {
                self.cwnd = self.cwnd.saturating_add(self.mss as u64);
                self.send_packets(sim, net);
                return;
            }
            self.dup_acks += 1;
            let mss = self.mss as u64;
            if self.dup_acks == DUPACK_THRESHOLD {
                if self.last_acked < self.recover {
                    return;
                }
                self.ssthresh = (self.cwnd / 2).max(2 * mss);
                self.retransmit_earliest(sim, net);
                self.cwnd = self.ssthresh + 3 * mss;
                self.in_fast_recovery = true;
                self.recover = self.next_seq;
                self.send_packets(sim, net);
            } else if self.dup_acks > DUPACK_THRESHOLD {
                self.cwnd += mss;
                self.send_packets(sim, net);
            }
        }
    }

    /// 与 [`super::tcp::TcpSender::rtx_timer_hook`] 同样的两阶段设计：这里只
    /// 标记 `rtx_pending`、安排一个抖动过的 [`DctcpRtxFire`]，并把 `rto` 翻倍、
    /// `rto_deadline` 前移；真正的窗口回退 + 重传放到 `retransmit_fire`。
    #[tracing::instrument(skip(self, sim, net), fields(sender = %self.name))]
    pub fn rtx_timer_hook(&mut self, now: SimTime, period: SimTime, sim: &mut Simulator, net: &mut Network) {
        let _ = net;
        if self.done_at.is_some() {
            return;
        }
        let Some(deadline) = self.rto_deadline else { return };
        if now <= deadline {
            return;
        }
        if self.rtx_pending {
            return;
        }
        debug!(backoff = self.backoff_exp, "DCTCP RTO 超时，安排抖动重传");
        self.rtx_pending = true;
        let too_late = now.saturating_sub(deadline);
        let offset = rtx_reschedule_offset(period, too_late, self.backoff_exp);
        sim.schedule_for(self.id.source_id(), now.saturating_add(offset), DctcpRtxFire { node: self.id });

        self.rto = SimTime(self.rto.0.saturating_mul(2)).max(MIN_RTO);
        self.rto_deadline = Some(now.saturating_add(self.rto));
    }

    #[tracing::instrument(skip(self, sim, net), fields(sender = %self.name))]
    pub fn retransmit_fire(&mut self, sim: &mut Simulator, net: &mut Network) {
        if !self.rtx_pending {
            return;
        }
        self.rtx_pending = false;
        if self.done_at.is_some() || self.inflight.is_empty() {
            return;
        }
        debug!(backoff = self.backoff_exp, "DCTCP RTO 重传定时器触发");

        if self.in_fast_recovery {
            let flightsize = self.next_seq.saturating_sub(self.last_acked);
            self.cwnd = self.ssthresh.min(flightsize.saturating_add(self.mss as u64));
        }
        let mss = self.mss as u64;
        self.ssthresh = (self.cwnd / 2).max(2 * mss);
        self.cwnd = mss;
        self.dup_acks = 0;
        self.in_fast_recovery = false;
        self.recover = self.next_seq;
        self.backoff_exp = self.backoff_exp.saturating_add(1);

        self.retransmit_earliest(sim, net);
    }
}

impl Sink for DctcpSender {
    fn id(&self) -> NodeId {
        self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn receive_packet(&mut self, pkt: Packet, _prev_vq: Option<usize>, sim: &mut Simulator, net: &mut Network) {
        if let TransportPayload::DctcpAck { ackno, .. } = pkt.transport {
            let ecn_echo = pkt.flags.contains(Flags::ECN_ECHO);
            self.on_ack(ackno, ecn_echo, sim, net);
        }
        net.pool.free(pkt);
    }
    fn on_wake(&mut self, sim: &mut Simulator, net: &mut Network) {
        self.send_packets(sim, net);
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct OutOfOrderSeg {
    seq: u64,
    len: u32,
}

pub struct DctcpReceiver {
    id: NodeId,
    name: String,
    src: NodeId,
    flow_id: u64,
    ack_bytes: u32,
    ack_route: Route,
    rcv_nxt: u64,
    out_of_order: Vec<OutOfOrderSeg>,
    ce_seen_since_last_ack: bool,
}

impl DctcpReceiver {
    pub fn new(id: NodeId, name: impl Into<String>, src: NodeId, flow_id: u64, ack_bytes: u32, ack_route: Route) -> Self {
        Self {
            id,
            name: name.into(),
            src,
            flow_id,
            ack_bytes,
            ack_route,
            rcv_nxt: 0,
            out_of_order: Vec::new(),
            ce_seen_since_last_ack: false,
        }
    }

    pub fn cumulative_ack(&self) -> u64 {
        self.rcv_nxt
    }

    fn recv_data(&mut self, seq: u64, len: u32) -> u64 {
        if seq == self.rcv_nxt {
            self.rcv_nxt = self.rcv_nxt.saturating_add(len as u64);
            loop {
                let Some(pos) = self.out_of_order.iter().position(|s| s.seq == self.rcv_nxt) else { break };
                let seg = self.out_of_order.remove(pos);
                self.rcv_nxt = self.rcv_nxt.saturating_add(seg.len as u64);
            }
        } else if seq > self.rcv_nxt && !self.out_of_order.iter().any(|s| s.seq == seq) {
            let idx = self.out_of_order.partition_point(|s| s.seq < seq);
            self.out_of_order.insert(idx, OutOfOrderSeg { seq, len });
        }
        self.rcv_nxt
    }

    fn send_ack(&mut self, net: &mut Network, sim: &mut Simulator) {
        let mut pkt = net.pool.alloc(PacketKind::DctcpAck);
        pkt.dst = self.src;
        pkt.flow_id = self.flow_id;
        pkt.size = self.ack_bytes;
        pkt.id = sim.alloc_pkt_id();
        pkt.set_route(self.ack_route.clone());
        if self.ce_seen_since_last_ack {
            pkt.flags.insert(Flags::ECN_ECHO);
            self.ce_seen_since_last_ack = false;
        }
        pkt.transport = TransportPayload::DctcpAck { ackno: self.rcv_nxt, ts: sim.now().as_ps() };
        net.forward_from(self.id, pkt, sim);
    }
}

impl Sink for DctcpReceiver {
    fn id(&self) -> NodeId {
        self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn receive_packet(&mut self, pkt: Packet, _prev_vq: Option<usize>, sim: &mut Simulator, net: &mut Network) {
        if pkt.flags.contains(Flags::ECN_CE) {
            self.ce_seen_since_last_ack = true;
        }
        if let TransportPayload::DctcpData { seqno, .. } = pkt.transport {
            self.recv_data(seqno, pkt.size);
            net.pool.free(pkt);
            self.send_ack(net, sim);
        } else {
            net.pool.free(pkt);
        }
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// `rtx_timer_hook` 安排的延迟重传：到期时重入发送端的 `retransmit_fire`。
#[derive(Debug)]
pub struct DctcpRtxFire {
    pub node: NodeId,
}

impl crate::sim::Event for DctcpRtxFire {
    fn execute(self: Box<Self>, sim: &mut Simulator, world: &mut dyn crate::sim::World) {
        let w = world
            .as_any_mut()
            .downcast_mut::<crate::net::NetWorld>()
            .expect("world must be NetWorld");
        let node = self.node;
        w.net.with_sink_as::<DctcpSender, ()>(node, |sender, net| {
            sender.retransmit_fire(sim, net);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{NetWorld, Network};
    use crate::sim::Simulator;

    #[test]
    fn transfer_completes_without_any_ecn_marking() {
        let sender_id = NodeId(0);
        let recv_id = NodeId(1);
        let mut net = Network::default();
        let route_to_recv = Route::new(vec![recv_id]);
        net.add_sink(|id| Box::new(DctcpSender::new(id, "send", recv_id, route_to_recv, 1, 1460, 1460 * 40)));
        let ack_route = Route::new(vec![sender_id]);
        net.add_sink(|id| Box::new(DctcpReceiver::new(id, "recv", sender_id, 1, 64, ack_route)));

        let mut sim = Simulator::default();
        let mut world = NetWorld::new(net);
        world.net.wake(sender_id, &mut sim);
        sim.run(&mut world);

        let recv = world.net.sink_as::<DctcpReceiver>(recv_id).expect("receiver sink");
        assert_eq!(recv.cumulative_ack(), 1460 * 40);
        let send = world.net.sink_as::<DctcpSender>(sender_id).expect("sender sink");
        assert!(send.is_done());
        assert_eq!(send.alpha(), 0.0);
    }

    #[test]
    fn cumulative_ack_reorders_like_tcp() {
        let mut recv = DctcpReceiver::new(NodeId(1), "r", NodeId(0), 1, 64, Route::new(vec![NodeId(0)]));
        assert_eq!(recv.recv_data(1000, 500), 0);
        assert_eq!(recv.recv_data(0, 1000), 1500);
    }

    #[test]
    fn three_dup_acks_trigger_fast_retransmit() {
        let sender_id = NodeId(0);
        let recv_id = NodeId(1);
        let mut net = Network::default();
        let route_to_recv = Route::new(vec![recv_id]);
        net.add_sink(|id| Box::new(DctcpSender::new(id, "send", recv_id, route_to_recv, 1, 1460, 1460 * 40)));

        let mut sim = Simulator::default();
        let mut world = NetWorld::new(net);
        world.net.wake(sender_id, &mut sim);

        for _ in 0..3 {
            world.net.with_sink_as::<DctcpSender, ()>(sender_id, |sender, net| {
                sender.on_ack(0, false, &mut sim, net);
            });
        }
        let send = world.net.sink_as::<DctcpSender>(sender_id).expect("sender sink");
        assert!(send.in_fast_recovery);
        assert_eq!(send.dup_acks, 3);
    }
}

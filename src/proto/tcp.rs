//! TCP 发送端 / 接收端
//!
//! `TcpSender`/`TcpReceiver` 各自是转发图里的一个 `Sink`，地址就是它们所在的
//! 主机 `NodeId`。拥塞控制沿用 Reno 风格：慢启动 + 拥塞避免 + 快速重传/快速
//! 恢复；超时重传不再由每条连接各自挂一个定时器，而是由进程级的
//! [`crate::proto::rto_scanner::RtoScanner`] 周期性巡检所有发送端的
//! `rto_deadline`（`rtx_timer_hook`），更贴近真实内核一个软中断扫描所有
//! socket 的做法，也避免了每条流一个 cancel/reschedule 事件源的开销。

use std::collections::BTreeMap;

use crate::net::{Flags, HEADER_ONLY_BYTES, Network, NodeId, Packet, PacketKind, Route, Sink, TransportPayload};
use crate::sim::{SimTime, Simulator};
use tracing::{debug, trace};

/// 初始 cwnd = 10 个 MSS。
pub const INIT_CWND_SEGS: u64 = 10;
/// 初始 ssthresh = 100 个 MSS（足够大，实质上等于"先慢启动到天为止"）。
pub const INIT_SSTHRESH_SEGS: u64 = 100;
pub const INIT_RTO: SimTime = SimTime::from_secs(3);
pub const MIN_RTO: SimTime = SimTime::from_millis(250);
/// 触发快速重传所需的重复 ACK 数（Reno 经典阈值；多路径变体会在此基础上加
/// `备选路径数`，本实现不驱动那一档，交给调用方自行传入）。
pub const DUPACK_THRESHOLD: u32 = 3;

/// `rtx_timer_hook` 的抖动重调度偏移：`(P − too_late/2^k) / 200`。这个公式
/// 照抄不改——它是故意的抖动，不是 bug，用来把同一批超时的连接错开，避免
/// 重传风暴在同一个仿真刻度里撞车。
pub(crate) fn rtx_reschedule_offset(period: SimTime, too_late: SimTime, backoff_exp: u32) -> SimTime {
    let shrink = too_late.0 >> backoff_exp.min(63);
    SimTime(period.0.saturating_sub(shrink) / 200)
}

#[derive(Debug, Clone)]
struct InflightSeg {
    len: u32,
    sent_at: SimTime,
    retransmitted: bool,
}

/// TCP 发送端：地址就是源主机的 `NodeId`。
pub struct TcpSender {
    id: NodeId,
    name: String,
    dst: NodeId,
    flow_id: u64,
    mss: u32,
    route: Route,
    total_bytes: u64,

    next_seq: u64,
    last_acked: u64,
    established: bool,
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

    done_at: Option<SimTime>,
}

impl TcpSender {
    pub fn new(id: NodeId, name: impl Into<String>, dst: NodeId, route: Route, flow_id: u64, mss: u32, total_bytes: u64) -> Self {
        Self {
            id,
            name: name.into(),
            dst,
            flow_id,
            mss,
            route,
            total_bytes,
            next_seq: 1, // seq 0 留给 SYN
            last_acked: 0,
            established: false,
            cwnd: (mss as u64) * INIT_CWND_SEGS,
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
            done_at: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done_at.is_some()
    }

    pub fn done_time(&self) -> Option<SimTime> {
        self.done_at
    }

    pub fn cwnd_bytes(&self) -> u64 {
        self.cwnd
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    fn inflight_bytes(&self) -> u64 {
        self.inflight.values().map(|s| s.len as u64).sum()
    }

    fn earliest_unacked(&self) -> Option<(u64, InflightSeg)> {
        self.inflight.iter().next().map(|(&s, seg)| (s, seg.clone()))
    }

    fn make_data_packet(&self, net: &mut Network) -> Packet {
        let mut pkt = net.pool.alloc(PacketKind::TcpData);
        pkt.dst = self.dst;
        pkt.flow_id = self.flow_id;
        pkt.set_route(self.route.clone());
        pkt
    }

    /// 连接建立前唯一会发的包：`seq=0`，占一个序号，带 SYN 标志，用首部大小
    /// 而不是 MSS 计费。
    fn send_syn(&mut self, sim: &mut Simulator, net: &mut Network) {
        let mut pkt = self.make_data_packet(net);
        pkt.size = HEADER_ONLY_BYTES;
        pkt.id = sim.alloc_pkt_id();
        pkt.flags.insert(Flags::SYN);
        pkt.transport = TransportPayload::TcpData { seqno: 0, data_seqno: 0, ts: sim.now().as_ps() };
        trace!("发送 SYN");
        net.forward_from(self.id, pkt, sim);
        self.inflight.insert(0, InflightSeg { len: 1, sent_at: sim.now(), retransmitted: false });
    }

    /// 还没握手完成就只发 SYN，并且在它被确认（`ackno >= 1`）之前不推任何
    /// 数据；握手完成后再回到原先的 cwnd 限速发送循环。
    #[tracing::instrument(skip(self, sim, net), fields(sender = %self.name, flow = self.flow_id))]
    pub fn send_packets(&mut self, sim: &mut Simulator, net: &mut Network) {
        if self.done_at.is_some() {
            return;
        }
        if !self.established {
            if !self.inflight.contains_key(&0) {
                self.send_syn(sim, net);
            }
            self.ensure_rto(sim);
            return;
        }

        let inflight_bytes = self.inflight_bytes();
        let mut avail = self.cwnd.saturating_sub(inflight_bytes);
        let end = self.total_bytes.saturating_add(1); // +1：SYN 占用的序号

        while avail > 0 && self.next_seq < end {
            let remain = end - self.next_seq;
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
            pkt.transport = TransportPayload::TcpData { seqno: seq, data_seqno: seq, ts: sim.now().as_ps() };
            trace!(seq, len, "发送数据段");
            net.forward_from(self.id, pkt, sim);

            self.inflight.insert(seq, InflightSeg { len, sent_at: sim.now(), retransmitted: false });
        }
        self.ensure_rto(sim);
    }

    fn retransmit_earliest(&mut self, sim: &mut Simulator, net: &mut Network) {
        let Some((seq, seg)) = self.earliest_unacked() else { return };
        let is_syn = seq == 0 && !self.established;
        let mut pkt = self.make_data_packet(net);
        pkt.size = if is_syn { HEADER_ONLY_BYTES } else { self.mss };
        pkt.id = sim.alloc_pkt_id();
        if is_syn {
            pkt.flags.insert(Flags::SYN);
        }
        pkt.transport = TransportPayload::TcpData { seqno: seq, data_seqno: seq, ts: sim.now().as_ps() };
        net.forward_from(self.id, pkt, sim);
        if let Some(entry) = self.inflight.get_mut(&seq) {
            entry.sent_at = sim.now();
            entry.retransmitted = true;
        }
        let _ = seg;
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

    /// 处理一个 ACK。`alt_path_count` 是该流可用的备选路径数（MPTCP 子流耦合
    /// 场景下 dup-ack 阈值要相应抬高，普通 TCP 传 0）。
    #[tracing::instrument(skip(self, sim, net), fields(sender = %self.name))]
    fn on_ack(&mut self, ackno: u64, ecn_echo: bool, sim: &mut Simulator, net: &mut Network, alt_path_count: u32) {
        let _ = ecn_echo; // 纯 TCP 不对 ECN-Echo 做反应，DCTCP 在自己的类型里处理
        if ackno > self.last_acked {
            self.rtx_pending = false; // 连接仍在往前走，作废任何已安排的抖动重传
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
            self.dup_acks = 0;

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
            let mss = self.mss as u64;

            if !self.established && ackno >= 1 {
                debug!("SYN 已确认，连接建立");
                self.established = true;
            }

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
            } else if self.cwnd < self.ssthresh {
                self.cwnd += ackno - prev_acked; // 慢启动
            } else {
                let inc = (mss.saturating_mul(mss) / self.cwnd.max(1)).max(1);
                self.cwnd += inc; // 拥塞避免 AIMD
            }

            if self.last_acked >= self.total_bytes.saturating_add(1) {
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
            let threshold = DUPACK_THRESHOLD + alt_path_count;
            let mss = self.mss as u64;
            if self.dup_acks == threshold {
                if self.last_acked < self.recover {
                    return;
                }
                self.ssthresh = (self.cwnd / 2).max(2 * mss);
                self.retransmit_earliest(sim, net);
                self.cwnd = self.ssthresh + 3 * mss;
                self.in_fast_recovery = true;
                self.recover = self.next_seq;
                self.send_packets(sim, net);
            } else if self.dup_acks > threshold {
                self.cwnd += mss;
                self.send_packets(sim, net);
            }
        }
    }

    /// 由 [`crate::proto::rto_scanner::RtoScanner`] 周期性调用，`period` 是它的
    /// 扫描周期。超时到达时不在这里直接重传：只标记 `rtx_pending`，把真正的
    /// 状态回退 + 重传推迟到 `now + 抖动偏移` 的一个独立调度事件
    /// （[`TcpRtxFire`]），并立即把 `rto` 翻倍、`rto_deadline` 前移，这样同一个
    /// 超时不会在接下来几次扫描里被反复侦测到。
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
        debug!(backoff = self.backoff_exp, "RTO 超时，安排抖动重传");
        self.rtx_pending = true;
        let too_late = now.saturating_sub(deadline);
        let offset = rtx_reschedule_offset(period, too_late, self.backoff_exp);
        sim.schedule_for(self.id.source_id(), now.saturating_add(offset), TcpRtxFire { node: self.id });

        self.rto = SimTime(self.rto.0.saturating_mul(2)).max(MIN_RTO);
        self.rto_deadline = Some(now.saturating_add(self.rto));
    }

    /// `rtx_timer_hook` 安排的抖动重传真正触发的地方：回到慢启动并重传最早
    /// 未确认段。如果连接在这之前已经靠新 ACK 自愈（`rtx_pending` 被
    /// `on_ack` 清掉了），这里什么也不做。
    #[tracing::instrument(skip(self, sim, net), fields(sender = %self.name))]
    pub fn retransmit_fire(&mut self, sim: &mut Simulator, net: &mut Network) {
        if !self.rtx_pending {
            return;
        }
        self.rtx_pending = false;
        if self.done_at.is_some() || self.inflight.is_empty() {
            return;
        }
        debug!(backoff = self.backoff_exp, "RTO 重传定时器触发");

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

impl Sink for TcpSender {
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn receive_packet(&mut self, pkt: Packet, _prev_vq: Option<usize>, sim: &mut Simulator, net: &mut Network) {
        if let TransportPayload::TcpAck { ackno, .. } = pkt.transport {
            let ecn_echo = pkt.flags.contains(Flags::ECN_ECHO);
            self.on_ack(ackno, ecn_echo, sim, net, 0);
        }
        net.pool.free(pkt);
    }

    /// 没有新包时的自驱动入口：连接启动时由 `TcpStart` 经 `Network::wake`
    /// 触发，把第一批数据（此时其实是 SYN）推出去。
    fn on_wake(&mut self, sim: &mut Simulator, net: &mut Network) {
        self.send_packets(sim, net);
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// 乱序重排的一段：`[seq, seq+len)`。
#[derive(Debug, Clone, Copy)]
struct OutOfOrderSeg {
    seq: u64,
    len: u32,
}

/// TCP 接收端：地址就是目的主机的 `NodeId`。累计 ACK + 乱序段列表；ECN-Echo
/// 回显收到的 CE 标记（DCTCP 靠它驱动 alpha）。
pub struct TcpReceiver {
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

impl TcpReceiver {
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

    /// 插入一段收到的数据，沿用插入排序维护 `out_of_order`（流量不大，
    /// 简单直接比引入一棵树划算）。返回更新后的累计 ACK。
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

    fn send_ack(&mut self, data_ackno: Option<u64>, net: &mut Network, sim: &mut Simulator) {
        let mut pkt = net.pool.alloc(PacketKind::TcpAck);
        pkt.dst = self.src;
        pkt.flow_id = self.flow_id;
        pkt.size = self.ack_bytes;
        pkt.id = sim.alloc_pkt_id();
        pkt.set_route(self.ack_route.clone());
        if self.ce_seen_since_last_ack {
            pkt.flags.insert(Flags::ECN_ECHO);
            self.ce_seen_since_last_ack = false;
        }
        pkt.transport = TransportPayload::TcpAck {
            ackno: self.rcv_nxt,
            data_ackno: data_ackno.unwrap_or(self.rcv_nxt),
            ts: sim.now().as_ps(),
        };
        net.forward_from(self.id, pkt, sim);
    }
}

impl Sink for TcpReceiver {
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(skip(self, pkt, sim, net), fields(receiver = %self.name))]
    fn receive_packet(&mut self, pkt: Packet, _prev_vq: Option<usize>, sim: &mut Simulator, net: &mut Network) {
        if pkt.flags.contains(Flags::ECN_CE) {
            self.ce_seen_since_last_ack = true;
        }
        if let TransportPayload::TcpData { seqno, .. } = pkt.transport {
            // SYN 不携带数据，只占 1 个序号。
            let len = if pkt.flags.contains(Flags::SYN) { 1 } else { pkt.size };
            self.recv_data(seqno, len);
            net.pool.free(pkt);
            self.send_ack(None, net, sim);
        } else {
            net.pool.free(pkt);
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// 启动一条 TCP 流：把 `TcpSender` 接入 `Network`，随即推它发第一批数据
/// （此时连接尚未建立，实际发出去的是 SYN）。由拓扑/工作负载构建阶段在
/// `t=0`（或流的到达时刻）调度。
#[derive(Debug)]
pub struct TcpStart {
    pub sender_id: NodeId,
}

impl crate::sim::Event for TcpStart {
    fn execute(self: Box<Self>, sim: &mut Simulator, world: &mut dyn crate::sim::World) {
        let w = world
            .as_any_mut()
            .downcast_mut::<crate::net::NetWorld>()
            .expect("world must be NetWorld");
        w.net.wake(self.sender_id, sim);
    }
}

/// `rtx_timer_hook` 安排的延迟重传：到期时重入发送端的 `retransmit_fire`。
#[derive(Debug)]
pub struct TcpRtxFire {
    pub node: NodeId,
}

impl crate::sim::Event for TcpRtxFire {
    fn execute(self: Box<Self>, sim: &mut Simulator, world: &mut dyn crate::sim::World) {
        let w = world
            .as_any_mut()
            .downcast_mut::<crate::net::NetWorld>()
            .expect("world must be NetWorld");
        let node = self.node;
        w.net.with_sink_as::<TcpSender, ()>(node, |sender, net| {
            sender.retransmit_fire(sim, net);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{NetWorld, Network, Route};
    use crate::sim::Simulator;

    #[test]
    fn cumulative_ack_advances_out_of_order() {
        let mut recv = TcpReceiver::new(NodeId(1), "r", NodeId(0), 7, 64, Route::new(vec![NodeId(0)]));
        assert_eq!(recv.recv_data(0, 1000), 1000);
        assert_eq!(recv.recv_data(2000, 1000), 1000);
        assert_eq!(recv.recv_data(1000, 1000), 3000);
    }

    #[test]
    fn handshake_then_slow_start_transfer_completes() {
        // 两个端点直连（无队列/管道），预知 `add_sink` 按调用顺序分配 NodeId。
        let sender_id = NodeId(0);
        let recv_id = NodeId(1);
        let mut net = Network::default();
        let route_to_recv = Route::new(vec![recv_id]);
        let added_sender = net.add_sink(|id| Box::new(TcpSender::new(id, "send", recv_id, route_to_recv, 1, 1460, 5_000)));
        let ack_route = Route::new(vec![sender_id]);
        let added_recv = net.add_sink(|id| Box::new(TcpReceiver::new(id, "recv", sender_id, 1, 64, ack_route)));
        assert_eq!(added_sender, sender_id);
        assert_eq!(added_recv, recv_id);

        let mut sim = Simulator::default();
        let mut world = NetWorld::new(net);
        world.net.wake(sender_id, &mut sim);
        sim.run(&mut world);

        let recv = world.net.sink_as::<TcpReceiver>(recv_id).expect("receiver sink");
        // +1：SYN 占用的那个序号。
        assert_eq!(recv.cumulative_ack(), 5_001);
        let send = world.net.sink_as::<TcpSender>(sender_id).expect("sender sink");
        assert!(send.is_done());
        assert!(send.is_established());
    }

    #[test]
    fn no_data_sent_before_syn_is_acked() {
        let sender_id = NodeId(0);
        let recv_id = NodeId(1);
        let mut net = Network::default();
        let route_to_recv = Route::new(vec![recv_id]);
        net.add_sink(|id| Box::new(TcpSender::new(id, "send", recv_id, route_to_recv, 1, 1460, 5_000)));

        let mut sim = Simulator::default();
        let mut world = NetWorld::new(net);
        world.net.wake(sender_id, &mut sim);
        // 唤醒一次只应该发出 SYN：连接还没建立，不该有数据段被推出去。
        assert_eq!(world.net.stats.delivered_pkts, 1);
        let send = world.net.sink_as::<TcpSender>(sender_id).expect("sender sink");
        assert!(!send.is_established());
    }
}

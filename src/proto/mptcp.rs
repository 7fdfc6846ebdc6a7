//! MPTCP：多子流耦合拥塞控制
//!
//! 一条 MPTCP 连接由若干条独立路由的 TCP 风格子流组成，各自有自己的 cwnd/
//! rtt/inflight，但共享同一个数据级序列号空间（`get_data_seq`）与同一套
//! 耦合算法（决定每个子流在收到 ACK 时 cwnd 该涨多少）。`MptcpMeta` 是这份
//! 共享状态，用 `Rc<RefCell<_>>` 在同一端的多个子流 sink 之间共享——这是
//! 仿真单线程协作式调度下最直接的"多个 sink 共享一份元数据"写法，换成
//! `Arc<Mutex<_>>` 纯属多余。

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use super::tcp::rtx_reschedule_offset;
use crate::net::{Flags, Network, NodeId, Packet, PacketKind, Route, Sink, TransportPayload};
use crate::sim::{SimTime, Simulator};
use tracing::{debug, trace};

/// 没有在工作负载里显式指定时，MPTCP 连接默认的接收窗口（单位：包/MSS）。
pub const DEFAULT_RWND_SEGS: u64 = 256;

/// 子流耦合算法（RFC 6356 LIA 风格的 COUPLED_INC 是默认推荐项）。
#[derive(Debug, Clone, Copy)]
pub enum CouplingAlgorithm {
    /// 各子流各自独立跑 Reno，互不知晓对方存在。
    Uncoupled,
    /// 把所有子流当成一条聚合流：每个 ACK 让"总 cwnd"按 mss²/total_cwnd 增长，
    /// 增量全部记到被 ACK 的子流上。
    FullyCoupled,
    /// RFC 6356 Linked Increase Algorithm：
    /// `a = Σ(cwnd_i)·max_rtt / (Σ(cwnd_i·rtt_i))²`，每个 ACK 的增量是
    /// `min(a·mss/total_cwnd, mss²/cwnd_r)`（不超过单独跑该子流时的增量，
    /// 保证不比普通 TCP 更激进）。
    CoupledInc,
    /// 把耦合视为"表现得像一条普通 TCP 流"：等价于 FullyCoupled。
    CoupledTcp,
    /// 在 Uncoupled 与 FullyCoupled 之间按 `eps` 线性插值。
    CoupledEpsilon(f64),
}

#[derive(Debug, Clone, Copy, Default)]
struct SubflowMeta {
    cwnd: u64,
    srtt: SimTime,
    mss: u32,
}

/// 一条 MPTCP 连接的共享状态：数据级序列号分配、数据级累计 ACK、以及耦合
/// 算法读取的各子流 cwnd/rtt 快照。
pub struct MptcpMeta {
    algorithm: CouplingAlgorithm,
    total_bytes: u64,
    /// 接收窗口，单位是包（乘以子流 mss 换算成字节上限）；`get_data_seq`
    /// 靠它限制未确认的数据级序号总量，拒绝超出窗口的新分配。
    rwnd: u64,
    data_seq_next: u64,
    data_acked: u64,
    out_of_order: Vec<(u64, u32)>,
    subflows: Vec<SubflowMeta>,
    done_at: Option<SimTime>,
}

impl MptcpMeta {
    pub fn new(algorithm: CouplingAlgorithm, total_bytes: u64, rwnd: u64) -> Rc<RefCell<MptcpMeta>> {
        Rc::new(RefCell::new(MptcpMeta {
            algorithm,
            total_bytes,
            rwnd,
            data_seq_next: 0,
            data_acked: 0,
            out_of_order: Vec::new(),
            subflows: Vec::new(),
            done_at: None,
        }))
    }

    /// 注册一条新子流，返回其索引（耦合计算按索引引用各子流的 cwnd/rtt）。
    pub fn add_subflow(&mut self, mss: u32) -> usize {
        self.subflows.push(SubflowMeta { cwnd: (mss as u64) * super::tcp::INIT_CWND_SEGS, srtt: SimTime::ZERO, mss });
        self.subflows.len() - 1
    }

    pub fn compute_total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn is_done(&self) -> bool {
        self.done_at.is_some()
    }

    /// 分配 `len` 字节的数据级序列号区间，返回起始序号；若这次分配会让未
    /// 确认的数据级字节数超过 `data_acked + rwnd·mss`，拒绝分配（调用方应
    /// 停止发送，等下一个 ACK 把窗口推开再重试）。
    pub fn get_data_seq(&mut self, len: u32, mss: u32) -> Option<u64> {
        let window_end = self.data_acked.saturating_add(self.rwnd.saturating_mul(mss as u64));
        if self.data_seq_next.saturating_add(len as u64) > window_end {
            return None;
        }
        let seq = self.data_seq_next;
        self.data_seq_next = self.data_seq_next.saturating_add(len as u64);
        Some(seq)
    }

    /// 数据级累计 ACK 推进；乱序到达的子流数据用同样的插入排序方式重排。
    pub fn advance_data_ack(&mut self, data_seq: u64, len: u32, sim: &Simulator) -> u64 {
        if data_seq == self.data_acked {
            self.data_acked = self.data_acked.saturating_add(len as u64);
            loop {
                let Some(pos) = self.out_of_order.iter().position(|&(s, _)| s == self.data_acked) else { break };
                let (_, l) = self.out_of_order.remove(pos);
                self.data_acked = self.data_acked.saturating_add(l as u64);
            }
        } else if data_seq > self.data_acked && !self.out_of_order.iter().any(|&(s, _)| s == data_seq) {
            self.out_of_order.push((data_seq, len));
        }
        if self.data_acked >= self.total_bytes && self.done_at.is_none() {
            self.done_at = Some(sim.now());
        }
        self.data_acked
    }

    fn total_cwnd(&self) -> u64 {
        self.subflows.iter().map(|s| s.cwnd).sum()
    }

    /// `inflate_window`：子流 `idx` 新确认了 `acked_bytes` 字节，返回它的 cwnd
    /// 应该增加多少（已按耦合算法折算）。调用方负责把增量加到自己的 cwnd
    /// 字段上，并把快照写回 `sync_subflow`。
    pub fn inflate_window(&mut self, idx: usize, acked_bytes: u64) -> u64 {
        let mss = self.subflows[idx].mss as u64;
        let cwnd_r = self.subflows[idx].cwnd.max(1);
        let uncoupled_inc = (mss.saturating_mul(mss) / cwnd_r).max(1).min(acked_bytes.max(1));

        match self.algorithm {
            CouplingAlgorithm::Uncoupled => uncoupled_inc,
            CouplingAlgorithm::FullyCoupled | CouplingAlgorithm::CoupledTcp => {
                let total = self.total_cwnd().max(1);
                (mss.saturating_mul(mss) / total).max(1)
            }
            CouplingAlgorithm::CoupledInc => {
                let max_rtt_ps = self.subflows.iter().map(|s| s.srtt.as_ps()).max().unwrap_or(1).max(1);
                let total_cwnd = self.total_cwnd();
                let denom: u128 = self
                    .subflows
                    .iter()
                    .map(|s| (s.cwnd as u128) * (s.srtt.as_ps().max(1) as u128))
                    .sum::<u128>()
                    .max(1);
                let numer: u128 = (total_cwnd as u128) * (max_rtt_ps as u128);
                let a = numer / (denom * denom / mss.max(1) as u128).max(1);
                let linked_inc = ((a * mss as u128) / total_cwnd.max(1) as u128).max(1) as u64;
                linked_inc.min(uncoupled_inc.max(1))
            }
            CouplingAlgorithm::CoupledEpsilon(eps) => {
                let eps = eps.clamp(0.0, 1.0);
                let total = self.total_cwnd().max(1);
                let fully = (mss.saturating_mul(mss) / total).max(1) as f64;
                let blended = eps * fully + (1.0 - eps) * (uncoupled_inc as f64);
                blended.round().max(1.0) as u64
            }
        }
    }

    /// `deflate_window`：子流 `idx` 发生丢包，返回其收缩后的新 cwnd（Reno 式
    /// 腰斩，下限为一个 MSS；耦合算法不改变丢包反应，只改变增长速率）。
    pub fn deflate_window(&mut self, idx: usize) -> u64 {
        let s = &self.subflows[idx];
        (s.cwnd / 2).max(s.mss as u64)
    }

    pub fn sync_subflow(&mut self, idx: usize, cwnd: u64, srtt: SimTime) {
        self.subflows[idx].cwnd = cwnd;
        self.subflows[idx].srtt = srtt;
    }
}

#[derive(Debug, Clone)]
struct InflightSeg {
    len: u32,
    sent_at: SimTime,
    retransmitted: bool,
}

/// 一条子流的发送端；多条子流共享同一个 `MptcpMeta`。
pub struct MptcpSubflowSender {
    id: NodeId,
    name: String,
    dst: NodeId,
    route: Route,
    flow_id: u64,
    subflow_idx: usize,
    meta: Rc<RefCell<MptcpMeta>>,
    mss: u32,

    next_seq: u64,
    last_acked: u64,
    cwnd: u64,
    ssthresh: u64,
    dup_acks: u32,
    in_fast_recovery: bool,
    recover: u64,
    inflight: BTreeMap<u64, InflightSeg>,

    srtt: Option<SimTime>,
    rttvar: SimTime,
    rto: SimTime,
    rto_deadline: Option<SimTime>,
    backoff_exp: u32,
    rtx_pending: bool,
}

impl MptcpSubflowSender {
    pub fn new(id: NodeId, name: impl Into<String>, dst: NodeId, route: Route, flow_id: u64, mss: u32, meta: Rc<RefCell<MptcpMeta>>) -> Self {
        let subflow_idx = meta.borrow_mut().add_subflow(mss);
        let cwnd = (mss as u64) * super::tcp::INIT_CWND_SEGS;
        Self {
            id,
            name: name.into(),
            dst,
            route,
            flow_id,
            subflow_idx,
            meta,
            mss,
            next_seq: 0,
            last_acked: 0,
            cwnd,
            ssthresh: (mss as u64) * super::tcp::INIT_SSTHRESH_SEGS,
            dup_acks: 0,
            in_fast_recovery: false,
            recover: 0,
            inflight: BTreeMap::new(),
            srtt: None,
            rttvar: SimTime::ZERO,
            rto: super::tcp::INIT_RTO,
            rto_deadline: None,
            backoff_exp: 0,
            rtx_pending: false,
        }
    }

    fn inflight_bytes(&self) -> u64 {
        self.inflight.values().map(|s| s.len as u64).sum()
    }

    fn earliest_unacked(&self) -> Option<u64> {
        self.inflight.keys().next().copied()
    }

    pub fn is_subflow_done(&self) -> bool {
        self.meta.borrow().is_done()
    }

    #[tracing::instrument(skip(self, sim, net), fields(sender = %self.name))]
    pub fn send_packets(&mut self, sim: &mut Simulator, net: &mut Network) {
        if self.meta.borrow().is_done() {
            return;
        }
        let remaining_total = {
            let meta = self.meta.borrow();
            meta.compute_total_bytes().saturating_sub(meta.data_acked)
        };
        if remaining_total == 0 {
            return;
        }
        let mut avail = self.cwnd.saturating_sub(self.inflight_bytes());
        while avail > 0 {
            let total_remaining = {
                let meta = self.meta.borrow();
                meta.compute_total_bytes().saturating_sub(meta.data_seq_next)
            };
            if total_remaining == 0 {
                break;
            }
            let len = (self.mss as u64).min(avail).min(total_remaining) as u32;
            if len == 0 {
                break;
            }
            // 先问共享状态要数据级序号：接收窗口不够就别碰 next_seq/avail，
            // 干净地停在这里，等下一个 ACK 把窗口推开再继续。
            let Some(data_seq) = self.meta.borrow_mut().get_data_seq(len, self.mss) else {
                break;
            };
            let subflow_seq = self.next_seq;
            self.next_seq += len as u64;
            avail = avail.saturating_sub(len as u64);

            let mut pkt = net.pool.alloc(PacketKind::MptcpData);
            pkt.dst = self.dst;
            pkt.flow_id = self.flow_id;
            pkt.set_route(self.route.clone());
            pkt.size = self.mss;
            pkt.id = sim.alloc_pkt_id();
            pkt.transport = TransportPayload::MptcpData { seqno: subflow_seq, data_seqno: data_seq, ts: sim.now().as_ps() };
            trace!(subflow_seq, data_seq, len, "发送子流数据段");
            net.forward_from(self.id, pkt, sim);
            self.inflight.insert(subflow_seq, InflightSeg { len, sent_at: sim.now(), retransmitted: false });
        }
        self.ensure_rto(sim);
    }

    fn retransmit_earliest(&mut self, sim: &mut Simulator, net: &mut Network) {
        let Some(seq) = self.earliest_unacked() else { return };
        let len = self.inflight.get(&seq).map(|s| s.len).unwrap_or(self.mss);
        let mut pkt = net.pool.alloc(PacketKind::MptcpData);
        pkt.dst = self.dst;
        pkt.flow_id = self.flow_id;
        pkt.set_route(self.route.clone());
        pkt.size = self.mss;
        pkt.id = sim.alloc_pkt_id();
        pkt.transport = TransportPayload::MptcpData { seqno: seq, data_seqno: seq, ts: sim.now().as_ps() };
        net.forward_from(self.id, pkt, sim);
        if let Some(entry) = self.inflight.get_mut(&seq) {
            entry.sent_at = sim.now();
            entry.retransmitted = true;
        }
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

    fn sync_meta(&mut self) {
        let srtt = self.srtt.unwrap_or(SimTime::ZERO);
        self.meta.borrow_mut().sync_subflow(self.subflow_idx, self.cwnd, srtt);
    }

    #[tracing::instrument(skip(self, sim, net), fields(sender = %self.name))]
    fn on_ack(&mut self, ackno: u64, data_ackno: u64, ecn_echo: bool, sim: &mut Simulator, net: &mut Network) {
        let _ = ecn_echo;
        if ackno <= self.last_acked {
            if self.dup_acks < u32::MAX {
                self.dup_acks += 1;
            }
            if self.dup_acks == super::tcp::DUPACK_THRESHOLD && !self.in_fast_recovery && self.last_acked >= self.recover {
                self.ssthresh = self.meta.borrow_mut().deflate_window(self.subflow_idx);
                self.cwnd = self.ssthresh + 3 * self.mss as u64;
                self.in_fast_recovery = true;
                self.recover = self.next_seq;
                self.retransmit_earliest(sim, net);
            }
            self.sync_meta();
            return;
        }

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
            self.srtt = Some(match self.srtt {
                Some(s) => SimTime((s.0 * 7 / 8).saturating_add(sample.0 / 8)),
                None => sample,
            });
            self.rto = self.srtt.unwrap().saturating_add(SimTime::from_millis(1)).max(super::tcp::MIN_RTO);
            self.backoff_exp = 0;
        }

        let acked_bytes = ackno - self.last_acked;
        let to_remove: Vec<u64> = self.inflight.iter().take_while(|(&s, seg)| s.saturating_add(seg.len as u64) <= ackno).map(|(&s, _)| s).collect();
        for s in to_remove {
            self.inflight.remove(&s);
        }
        self.last_acked = ackno;
        self.dup_acks = 0;

        if self.in_fast_recovery {
            if ackno >= self.recover {
                self.in_fast_recovery = false;
                self.cwnd = self.ssthresh;
            }
        } else if self.cwnd < self.ssthresh {
            self.cwnd += acked_bytes; // 慢启动（耦合只影响拥塞避免阶段）
        } else {
            let inc = self.meta.borrow_mut().inflate_window(self.subflow_idx, acked_bytes);
            self.cwnd = self.cwnd.saturating_add(inc);
        }
        self.sync_meta();

        let data_done = {
            let mut meta = self.meta.borrow_mut();
            meta.advance_data_ack(data_ackno, acked_bytes as u32, sim);
            meta.is_done()
        };
        if data_done {
            self.rto_deadline = None;
            self.rtx_pending = false;
            return;
        }
        self.restart_rto(sim);
        self.send_packets(sim, net);
    }

    /// 与 [`super::tcp::TcpSender::rtx_timer_hook`] 同样的两阶段设计：这里只
    /// 标记 `rtx_pending`、安排一个抖动过的 [`MptcpRtxFire`]，并把 `rto` 翻倍、
    /// `rto_deadline` 前移；真正的窗口回退 + 重传放到 `retransmit_fire`。
    #[tracing::instrument(skip(self, sim, net), fields(sender = %self.name))]
    pub fn rtx_timer_hook(&mut self, now: SimTime, period: SimTime, sim: &mut Simulator, net: &mut Network) {
        let _ = net;
        if self.meta.borrow().is_done() {
            return;
        }
        let Some(deadline) = self.rto_deadline else { return };
        if now <= deadline {
            return;
        }
        if self.rtx_pending {
            return;
        }
        debug!(backoff = self.backoff_exp, "MPTCP 子流 RTO 超时，安排抖动重传");
        self.rtx_pending = true;
        let too_late = now.saturating_sub(deadline);
        let offset = rtx_reschedule_offset(period, too_late, self.backoff_exp);
        sim.schedule_for(self.id.source_id(), now.saturating_add(offset), MptcpRtxFire { node: self.id });

        self.rto = SimTime(self.rto.0.saturating_mul(2)).max(super::tcp::MIN_RTO);
        self.rto_deadline = Some(now.saturating_add(self.rto));
    }

    #[tracing::instrument(skip(self, sim, net), fields(sender = %self.name))]
    pub fn retransmit_fire(&mut self, sim: &mut Simulator, net: &mut Network) {
        if !self.rtx_pending {
            return;
        }
        self.rtx_pending = false;
        if self.meta.borrow().is_done() || self.inflight.is_empty() {
            return;
        }
        debug!(backoff = self.backoff_exp, "MPTCP 子流 RTO 重传定时器触发");
        self.ssthresh = self.meta.borrow_mut().deflate_window(self.subflow_idx);
        self.cwnd = self.mss as u64;
        self.dup_acks = 0;
        self.in_fast_recovery = false;
        self.recover = self.next_seq;
        self.backoff_exp = self.backoff_exp.saturating_add(1);
        self.sync_meta();
        self.retransmit_earliest(sim, net);
    }
}

impl Sink for MptcpSubflowSender {
    fn id(&self) -> NodeId {
        self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn receive_packet(&mut self, pkt: Packet, _prev_vq: Option<usize>, sim: &mut Simulator, net: &mut Network) {
        if let TransportPayload::MptcpAck { ackno, data_ackno, .. } = pkt.transport {
            let ecn_echo = pkt.flags.contains(Flags::ECN_ECHO);
            self.on_ack(ackno, data_ackno, ecn_echo, sim, net);
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

/// 一条子流的接收端：子流级累计 ACK（给对端估计该子流的 RTT/丢包），同时把
/// 收到的每个段转给共享的 `MptcpMeta` 做数据级重排。
pub struct MptcpSubflowReceiver {
    id: NodeId,
    name: String,
    src: NodeId,
    flow_id: u64,
    ack_bytes: u32,
    ack_route: Route,
    meta: Rc<RefCell<MptcpMeta>>,
    rcv_nxt: u64,
    out_of_order: Vec<(u64, u32)>,
}

impl MptcpSubflowReceiver {
    pub fn new(id: NodeId, name: impl Into<String>, src: NodeId, flow_id: u64, ack_bytes: u32, ack_route: Route, meta: Rc<RefCell<MptcpMeta>>) -> Self {
        Self { id, name: name.into(), src, flow_id, ack_bytes, ack_route, meta, rcv_nxt: 0, out_of_order: Vec::new() }
    }

    fn recv_data(&mut self, seq: u64, len: u32) -> u64 {
        if seq == self.rcv_nxt {
            self.rcv_nxt = self.rcv_nxt.saturating_add(len as u64);
            loop {
                let Some(pos) = self.out_of_order.iter().position(|&(s, _)| s == self.rcv_nxt) else { break };
                let (_, l) = self.out_of_order.remove(pos);
                self.rcv_nxt = self.rcv_nxt.saturating_add(l as u64);
            }
        } else if seq > self.rcv_nxt && !self.out_of_order.iter().any(|&(s, _)| s == seq) {
            self.out_of_order.push((seq, len));
        }
        self.rcv_nxt
    }
}

impl Sink for MptcpSubflowReceiver {
    fn id(&self) -> NodeId {
        self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn receive_packet(&mut self, pkt: Packet, _prev_vq: Option<usize>, sim: &mut Simulator, net: &mut Network) {
        if let TransportPayload::MptcpData { seqno, data_seqno, .. } = pkt.transport {
            let ackno = self.recv_data(seqno, pkt.size);
            net.pool.free(pkt);

            let mut ack = net.pool.alloc(PacketKind::MptcpAck);
            ack.dst = self.src;
            ack.flow_id = self.flow_id;
            ack.size = self.ack_bytes;
            ack.id = sim.alloc_pkt_id();
            ack.set_route(self.ack_route.clone());
            ack.transport = TransportPayload::MptcpAck { ackno, data_ackno: data_seqno, ts: sim.now().as_ps() };
            net.forward_from(self.id, ack, sim);
        } else {
            net.pool.free(pkt);
        }
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// `rtx_timer_hook` 安排的延迟重传：到期时重入子流发送端的 `retransmit_fire`。
#[derive(Debug)]
pub struct MptcpRtxFire {
    pub node: NodeId,
}

impl crate::sim::Event for MptcpRtxFire {
    fn execute(self: Box<Self>, sim: &mut Simulator, world: &mut dyn crate::sim::World) {
        let w = world
            .as_any_mut()
            .downcast_mut::<crate::net::NetWorld>()
            .expect("world must be NetWorld");
        let node = self.node;
        w.net.with_sink_as::<MptcpSubflowSender, ()>(node, |sender, net| {
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
    fn two_subflows_complete_an_mptcp_transfer() {
        let meta = MptcpMeta::new(CouplingAlgorithm::CoupledInc, 1460 * 20, 64);

        let mut net = Network::default();
        let mut ids = Vec::new();
        for i in 0..2 {
            let sender_id = NodeId(net_len(&net));
            let recv_id = NodeId(net_len(&net) + 1);
            let route = Route::new(vec![recv_id]);
            let ack_route = Route::new(vec![sender_id]);
            let meta_s = meta.clone();
            net.add_sink(move |id| Box::new(MptcpSubflowSender::new(id, format!("send{i}"), recv_id, route, 1, 1460, meta_s)));
            let meta_r = meta.clone();
            net.add_sink(move |id| Box::new(MptcpSubflowReceiver::new(id, format!("recv{i}"), sender_id, 1, 64, ack_route, meta_r)));
            ids.push((sender_id, recv_id));
        }

        let mut sim = Simulator::default();
        let mut world = NetWorld::new(net);
        for (sender_id, _) in &ids {
            world.net.wake(*sender_id, &mut sim);
        }
        sim.run(&mut world);

        assert!(meta.borrow().is_done());
    }

    fn net_len(net: &Network) -> usize {
        net.node_ids().count()
    }
}

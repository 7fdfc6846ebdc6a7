//! Fat-tree 交换机：FIB 查找 + ECMP/自适应转发
//!
//! 两阶段处理（`in_flight_pkts` 作为标志集合）：ingress 阶段查 FIB、决定下一跳、
//! 交给内部的固定时延（`switch_delay`）排队；egress 阶段（内部延迟到期后）
//! 直接 `send_on()` 转发到选中的出口。

use std::collections::{HashMap, HashSet, VecDeque};

use super::comparator::{CandidateState, Comparator};
use crate::net::deliver_packet::WakeSink;
use crate::net::{Network, NodeId, Packet, PacketKind, Route, Sink};
use crate::sim::{SimTime, Simulator};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Up,
    Down,
}

#[derive(Debug, Clone)]
pub struct FibEntry {
    /// 到达这个候选出口要走的完整路由（可能是一段 queue+pipe 链，不止一跳）。
    pub egress_route: Route,
    pub cost: u32,
    pub direction: PortDirection,
}

impl FibEntry {
    /// 候选的第一跳：用来向 `Network` 查询这条候选路径起点的队列状态。
    fn first_hop(&self) -> NodeId {
        self.egress_route.hop(0).expect("FibEntry egress_route must have at least one hop")
    }
}

pub enum RoutingStrategy {
    Ecmp,
    RoundRobin,
    Adaptive(Vec<Comparator>),
    EcmpAdaptive(Vec<Comparator>),
    RrEcmp,
}

/// flowlet 粘性路由允许的最大空闲间隔，超过这个间隔才重新做选路决策。
pub const FLOWLET_IDLE_GAP: SimTime = SimTime(50_000_000); // 50 微秒，单位 ps

struct RoundRobinState {
    counter: usize,
    uses_since_permute: u32,
    rng_state: u64,
}

pub struct FatTreeSwitch {
    id: NodeId,
    name: String,
    fib: HashMap<NodeId, Vec<FibEntry>>,
    host_fib: HashMap<(NodeId, u64), Route>,
    strategy: RoutingStrategy,
    switch_delay: SimTime,
    in_flight_pkts: HashSet<u64>,
    internal_delay_q: VecDeque<(SimTime, Packet)>,
    delay_wakeup_scheduled: bool,
    round_robin: HashMap<NodeId, RoundRobinState>,
    flowlet_last: HashMap<u64, (NodeId, SimTime)>,
    pinned_flow_counts: HashMap<NodeId, u32>,
    hash_salt: u64,
}

impl FatTreeSwitch {
    pub fn new(id: NodeId, name: impl Into<String>, strategy: RoutingStrategy, switch_delay: SimTime, hash_salt: u64) -> Self {
        Self {
            id,
            name: name.into(),
            fib: HashMap::new(),
            host_fib: HashMap::new(),
            strategy,
            switch_delay,
            in_flight_pkts: HashSet::new(),
            internal_delay_q: VecDeque::new(),
            delay_wakeup_scheduled: false,
            round_robin: HashMap::new(),
            flowlet_last: HashMap::new(),
            pinned_flow_counts: HashMap::new(),
            hash_salt,
        }
    }

    /// 拓扑构建阶段写入：到 `dst` 的候选出口集合。
    pub fn add_fib_entry(&mut self, dst: NodeId, entry: FibEntry) {
        self.fib.entry(dst).or_default().push(entry);
    }

    /// 拓扑构建阶段写入：某个 (目的主机, 流) 的钉死路由。
    pub fn pin_host_route(&mut self, dst_host: NodeId, flow_id: u64, route: Route) {
        self.host_fib.insert((dst_host, flow_id), route);
    }

    fn freebsd_hash(flow_id: u64, path_id: u64, salt: u64) -> u64 {
        let mut x = flow_id ^ path_id.rotate_left(17) ^ salt;
        x = x.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = x;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }

    fn candidate_state(&self, entry: &FibEntry, net: &Network, sim: &Simulator) -> CandidateState {
        let first_hop = entry.first_hop();
        let status = net.queue_status_of(first_hop, sim).unwrap_or_default();
        CandidateState {
            egress: first_hop,
            paused: status.paused,
            quantized_queuesize: status.quantized_queuesize,
            quantized_utilization: status.quantized_utilization,
            pinned_flow_count: *self.pinned_flow_counts.get(&first_hop).unwrap_or(&0),
        }
    }

    fn pick_ecmp(&self, cands: &[FibEntry], pkt: &Packet) -> usize {
        let h = Self::freebsd_hash(pkt.flow_id, pkt.path_id, self.hash_salt);
        (h as usize) % cands.len()
    }

    fn pick_round_robin(&mut self, dst: NodeId, cands: &[FibEntry]) -> usize {
        let state = self.round_robin.entry(dst).or_insert_with(|| RoundRobinState {
            counter: 0,
            uses_since_permute: 0,
            rng_state: self.hash_salt ^ (dst.0 as u64),
        });
        let idx = state.counter % cands.len();
        state.counter += 1;
        state.uses_since_permute += 1;
        if state.uses_since_permute as usize >= 5 * cands.len() {
            state.uses_since_permute = 0;
            state.rng_state = state.rng_state.wrapping_add(0x9E3779B97F4A7C15);
            state.counter = (state.rng_state >> 16) as usize;
        }
        idx
    }

    fn pick_adaptive(&self, cands: &[FibEntry], comparators: &[Comparator], net: &Network, sim: &Simulator) -> usize {
        let states: Vec<CandidateState> = cands.iter().map(|c| self.candidate_state(c, net, sim)).collect();
        (0..states.len())
            .min_by(|&i, &j| crate::switch::comparator::chain(comparators, &states[i], &states[j]))
            .unwrap_or(0)
    }

    fn choose_among(&mut self, dst: NodeId, cands: &[FibEntry], pkt: &Packet, net: &Network, sim: &Simulator) -> usize {
        match &self.strategy {
            RoutingStrategy::Ecmp => self.pick_ecmp(cands, pkt),
            RoutingStrategy::RoundRobin => self.pick_round_robin(dst, cands),
            RoutingStrategy::Adaptive(cmp) => self.pick_adaptive(cands, cmp, net, sim),
            RoutingStrategy::EcmpAdaptive(cmp) => {
                let ecmp_idx = self.pick_ecmp(cands, pkt);
                let mut rng = self.hash_salt ^ pkt.id;
                rng = rng.wrapping_add(0x9E3779B97F4A7C15);
                let replace = (rng >> 3) & 1 == 0;
                if replace {
                    let states: Vec<CandidateState> = cands.iter().map(|c| self.candidate_state(c, net, sim)).collect();
                    let worst_idx = (0..states.len())
                        .max_by(|&i, &j| crate::switch::comparator::chain(cmp, &states[i], &states[j]));
                    if worst_idx == Some(ecmp_idx) {
                        return self.pick_adaptive(cands, cmp, net, sim);
                    }
                }
                ecmp_idx
            }
            RoutingStrategy::RrEcmp => self.pick_round_robin(dst, cands),
        }
    }

    /// `get_next_hop`：FIB 查询 + 策略选择，粘性 flowlet 路由在空闲间隔内复用上次选择。
    /// 返回选中候选的完整出口路由（可能不止一跳）。
    fn get_next_route(&mut self, pkt: &Packet, net: &Network, sim: &Simulator) -> Option<Route> {
        if let Some(route) = self.host_fib.get(&(pkt.dst, pkt.flow_id)) {
            return Some(route.clone());
        }
        let cands = self.fib.get(&pkt.dst)?.clone();
        if cands.is_empty() {
            return None;
        }
        if cands.len() == 1 {
            return Some(cands[0].egress_route.clone());
        }

        let now = sim.now();
        if let Some((egress, last_used)) = self.flowlet_last.get(&pkt.flow_id).copied() {
            if now.saturating_sub(last_used) < FLOWLET_IDLE_GAP {
                if let Some(entry) = cands.iter().find(|c| c.first_hop() == egress) {
                    self.flowlet_last.insert(pkt.flow_id, (egress, now));
                    return Some(entry.egress_route.clone());
                }
            }
        }

        let idx = self.choose_among(pkt.dst, &cands, pkt, net, sim);
        let chosen = &cands[idx];
        self.flowlet_last.insert(pkt.flow_id, (chosen.first_hop(), now));
        Some(chosen.egress_route.clone())
    }

    fn schedule_internal_wakeup_if_needed(&mut self, sim: &mut Simulator) {
        if self.delay_wakeup_scheduled {
            return;
        }
        if let Some((at, _)) = self.internal_delay_q.front() {
            sim.schedule_for(self.id.source_id(), *at, WakeSink { to: self.id });
            self.delay_wakeup_scheduled = true;
        }
    }
}

impl Sink for FatTreeSwitch {
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(skip(self, pkt, sim, net), fields(switch = %self.name, pkt_id = pkt.id))]
    fn receive_packet(&mut self, mut pkt: Packet, _prev_vq: Option<usize>, sim: &mut Simulator, net: &mut Network) {
        if pkt.kind == PacketKind::EthPause {
            debug!("透传 ETH_PAUSE 做无损背压");
            if let Some(next) = pkt.send_on() {
                net.deliver(next, pkt, None, sim);
            }
            return;
        }

        if !self.in_flight_pkts.contains(&pkt.id) {
            trace!("ingress 阶段");
            self.in_flight_pkts.insert(pkt.id);
            match self.get_next_route(&pkt, net, sim) {
                Some(egress_route) => {
                    pkt.set_route(egress_route);
                    let departure = sim.now().saturating_add(self.switch_delay);
                    self.internal_delay_q.push_back((departure, pkt));
                    self.schedule_internal_wakeup_if_needed(sim);
                }
                None => {
                    self.in_flight_pkts.remove(&pkt.id);
                    net.on_dropped(pkt);
                }
            }
        } else {
            trace!("egress 阶段");
            self.in_flight_pkts.remove(&pkt.id);
            pkt.path_len = pkt.path_len.saturating_add(1);
            if let Some(next) = pkt.send_on() {
                net.deliver(next, pkt, None, sim);
            } else {
                net.on_delivered(pkt);
            }
        }
    }

    #[tracing::instrument(skip(self, sim, net), fields(switch = %self.name))]
    fn on_wake(&mut self, sim: &mut Simulator, net: &mut Network) {
        self.delay_wakeup_scheduled = false;
        let Some((_, pkt)) = self.internal_delay_q.pop_front() else {
            return;
        };
        // 重入 receive_packet 的 egress 分支：id 已在 in_flight_pkts 中。
        self.receive_packet(pkt, None, sim, net);
        self.schedule_internal_wakeup_if_needed(sim);
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{NetWorld, PacketPool};

    #[test]
    fn single_fib_candidate_is_used_directly() {
        let mut net = Network::default();
        let dst_host = net.add_host("dst");
        let switch_id = net.add_sink(|id| {
            let mut sw = FatTreeSwitch::new(id, "sw", RoutingStrategy::Ecmp, SimTime::from_micros(1), 9);
            sw.add_fib_entry(dst_host, FibEntry { egress_route: Route::new(vec![dst_host]), cost: 1, direction: PortDirection::Down });
            Box::new(sw)
        });

        let mut sim = Simulator::default();
        let mut world = NetWorld::new(net);
        let mut pkt = world.net.pool.alloc(PacketKind::TcpData);
        pkt.dst = dst_host;
        pkt.set_route(Route::new(vec![switch_id]));
        world.net.deliver(switch_id, pkt, None, &mut sim);
        sim.run(&mut world);
        assert_eq!(world.net.stats.delivered_pkts, 1);
    }
}

//! Fat-tree 拓扑构建
//!
//! 标准 k 叉 fat-tree：`k` 个 pod，每个 pod 有 `k/2` 个 edge 交换机和 `k/2` 个
//! agg 交换机，`(k/2)^2` 个 core 交换机，每个 edge 下挂 `k/2` 台主机。目的地
//! 路由表按真实设备的方式构建：edge/agg 往上走是多路径（ECMP 候选），往下
//! 走是确定的单一路径（fat-tree 的下行端口唯一确定）。

use std::collections::HashMap;

use crate::net::{NetWorld, NodeId, Route};
use crate::sim::SimTime;
use crate::switch::{FatTreeSwitch, FibEntry, PortDirection};

use super::{add_link, add_switch};

#[derive(Debug, Clone)]
pub struct FatTreeOpts {
    pub k: usize,
    pub link_gbps: u64,
    pub link_latency: SimTime,
    pub switch_delay: SimTime,
    pub queue_max_bytes: u64,
    pub hash_salt: u64,
}

impl Default for FatTreeOpts {
    fn default() -> Self {
        Self {
            k: 4,
            link_gbps: 100,
            link_latency: SimTime::from_micros(2),
            switch_delay: SimTime::from_micros(1),
            queue_max_bytes: crate::queue::mem_from_pkt(100),
            hash_salt: 0x5bd1e995,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FatTreeTopology {
    pub k: usize,
    pub hosts: Vec<NodeId>,
    pub edge_switches: Vec<NodeId>,
    pub agg_switches: Vec<NodeId>,
    pub core_switches: Vec<NodeId>,
    /// 每台主机到它所属 edge 交换机的上行路由段，供发流量的一端拼出完整
    /// 发送路由用（`host_uplink(i)` 之后接 FIB 决定的剩余路径）。
    pub host_uplinks: Vec<Route>,
}

impl FatTreeTopology {
    fn half(&self) -> usize {
        self.k / 2
    }

    pub fn host(&self, pod: usize, edge: usize, host: usize) -> NodeId {
        let half = self.half();
        let idx = (pod * half + edge) * half + host;
        self.hosts[idx]
    }

    pub fn edge(&self, pod: usize, edge: usize) -> NodeId {
        let half = self.half();
        self.edge_switches[pod * half + edge]
    }

    pub fn agg(&self, pod: usize, agg: usize) -> NodeId {
        let half = self.half();
        self.agg_switches[pod * half + agg]
    }

    pub fn core(&self, group: usize, index: usize) -> NodeId {
        let half = self.half();
        self.core_switches[group * half + index]
    }

    /// 主机到它所属 edge 交换机的上行路由段（`[queue, pipe, edge]`）。
    pub fn host_uplink(&self, host_idx: usize) -> Route {
        self.host_uplinks[host_idx].clone()
    }

    fn host_pod(&self, host_idx: usize) -> usize {
        host_idx / (self.half() * self.half())
    }

    fn host_edge_local(&self, host_idx: usize) -> usize {
        (host_idx / self.half()) % self.half()
    }
}

pub fn build_fat_tree(world: &mut NetWorld, opts: &FatTreeOpts) -> FatTreeTopology {
    let k = opts.k;
    assert!(k >= 2 && k % 2 == 0, "fat-tree k must be even and >= 2");
    let net = &mut world.net;

    let half = k / 2;
    let link_bps = opts.link_gbps.saturating_mul(1_000_000_000);
    let latency = opts.link_latency;
    let max_bytes = opts.queue_max_bytes;

    let core_switches: Vec<NodeId> = (0..half * half)
        .map(|c| add_switch(net, format!("core{c}"), opts.switch_delay, opts.hash_salt ^ (c as u64)))
        .collect();

    let mut hosts = Vec::with_capacity(k * half * half);
    let mut edge_switches = Vec::with_capacity(k * half);
    let mut agg_switches = Vec::with_capacity(k * half);

    for pod in 0..k {
        for edge in 0..half {
            let idx = edge_switches.len();
            edge_switches.push(add_switch(net, format!("p{pod}e{edge}"), opts.switch_delay, opts.hash_salt ^ (idx as u64)));
        }
        for agg in 0..half {
            let idx = agg_switches.len();
            agg_switches.push(add_switch(net, format!("p{pod}a{agg}"), opts.switch_delay, opts.hash_salt ^ (idx as u64 + 1000)));
        }
        for edge in 0..half {
            for h in 0..half {
                let host_id = net.add_host(format!("h{pod}_{edge}_{h}"));
                hosts.push(host_id);
            }
        }
    }

    let mut topo = FatTreeTopology { k, hosts, edge_switches, agg_switches, core_switches, host_uplinks: Vec::new() };

    // 物理链路：同时记下每条链路的路由段，供第二遍填 FIB 时复用。
    let mut host_edge_route: Vec<Route> = Vec::with_capacity(topo.hosts.len());
    let mut host_uplinks: Vec<Route> = Vec::with_capacity(topo.hosts.len());
    let mut edge_agg_route: HashMap<(usize, usize), Route> = HashMap::new(); // (edge_global, agg_local) -> edge->agg
    let mut agg_edge_route: HashMap<(usize, usize), Route> = HashMap::new(); // (agg_global, edge_local) -> agg->edge
    let mut agg_core_route: HashMap<(usize, usize), Route> = HashMap::new(); // (agg_global, idx2) -> agg->core
    let mut core_agg_route: HashMap<(usize, usize), Route> = HashMap::new(); // (core_global, pod) -> core->agg

    for host_idx in 0..topo.hosts.len() {
        let host_id = topo.hosts[host_idx];
        let edge_id = topo.edge_switches[topo.host_pod(host_idx) * half + topo.host_edge_local(host_idx)];
        let down = add_link(net, &format!("e{edge_id:?}-h{host_idx}"), host_id, latency, link_bps, max_bytes);
        let up = add_link(net, &format!("h{host_idx}-e{edge_id:?}"), edge_id, latency, link_bps, max_bytes);
        host_edge_route.push(down);
        host_uplinks.push(up);
    }
    topo.host_uplinks = host_uplinks;

    for pod in 0..k {
        for edge in 0..half {
            for agg in 0..half {
                let edge_id = topo.edge_switches[pod * half + edge];
                let agg_id = topo.agg_switches[pod * half + agg];
                let e2a = add_link(net, &format!("p{pod}e{edge}-a{agg}"), agg_id, latency, link_bps, max_bytes);
                let a2e = add_link(net, &format!("p{pod}a{agg}-e{edge}"), edge_id, latency, link_bps, max_bytes);
                edge_agg_route.insert((pod * half + edge, agg), e2a);
                agg_edge_route.insert((pod * half + agg, edge), a2e);
            }
        }
    }

    for pod in 0..k {
        for agg in 0..half {
            let agg_id = topo.agg_switches[pod * half + agg];
            for idx2 in 0..half {
                let core_id = topo.core_switches[agg * half + idx2];
                let a2c = add_link(net, &format!("p{pod}a{agg}-c{agg}_{idx2}"), core_id, latency, link_bps, max_bytes);
                let c2a = add_link(net, &format!("c{agg}_{idx2}-p{pod}a{agg}"), agg_id, latency, link_bps, max_bytes);
                agg_core_route.entry((pod * half + agg, idx2)).or_insert(a2c);
                core_agg_route.insert((agg * half + idx2, pod), c2a);
            }
        }
    }

    // 第二遍：按"下行唯一、上行 ECMP 多候选"的 fat-tree 惯例填写每台交换机的 FIB。
    for (edge_global, &edge_id) in topo.edge_switches.iter().enumerate() {
        let pod = edge_global / half;
        let edge_local = edge_global % half;
        let sw = net.sink_as::<FatTreeSwitch>(edge_id).expect("edge switch must exist");
        for (host_idx, &host_id) in topo.hosts.iter().enumerate() {
            if topo.host_pod(host_idx) == pod && topo.host_edge_local(host_idx) == edge_local {
                sw.add_fib_entry(host_id, FibEntry { egress_route: host_edge_route[host_idx].clone(), cost: 1, direction: PortDirection::Down });
            } else {
                for agg in 0..half {
                    let route = edge_agg_route[&(edge_global, agg)].clone();
                    sw.add_fib_entry(host_id, FibEntry { egress_route: route, cost: 3, direction: PortDirection::Up });
                }
            }
        }
    }

    for (agg_global, &agg_id) in topo.agg_switches.iter().enumerate() {
        let pod = agg_global / half;
        let sw = net.sink_as::<FatTreeSwitch>(agg_id).expect("agg switch must exist");
        for (host_idx, &host_id) in topo.hosts.iter().enumerate() {
            if topo.host_pod(host_idx) == pod {
                let edge_local = topo.host_edge_local(host_idx);
                let route = agg_edge_route[&(agg_global, edge_local)].clone();
                sw.add_fib_entry(host_id, FibEntry { egress_route: route, cost: 1, direction: PortDirection::Down });
            } else {
                for idx2 in 0..half {
                    let route = agg_core_route[&(agg_global, idx2)].clone();
                    sw.add_fib_entry(host_id, FibEntry { egress_route: route, cost: 3, direction: PortDirection::Up });
                }
            }
        }
    }

    for (core_global, &core_id) in topo.core_switches.iter().enumerate() {
        let sw = net.sink_as::<FatTreeSwitch>(core_id).expect("core switch must exist");
        for (host_idx, &host_id) in topo.hosts.iter().enumerate() {
            let pod = topo.host_pod(host_idx);
            let route = core_agg_route[&(core_global, pod)].clone();
            sw.add_fib_entry(host_id, FibEntry { egress_route: route, cost: 1, direction: PortDirection::Down });
        }
    }

    topo
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Network;
    use crate::sim::Simulator;

    #[test]
    fn packet_from_one_host_reaches_another_across_pods() {
        let opts = FatTreeOpts { k: 4, ..Default::default() };
        let mut world = NetWorld::new(Network::default());
        let topo = build_fat_tree(&mut world, &opts);

        let _src = topo.host(0, 0, 0);
        let dst = topo.host(1, 0, 0);
        let mut pkt = world.net.pool.alloc(crate::net::PacketKind::TcpData);
        pkt.dst = dst;
        pkt.size = 1000;

        let mut sim = Simulator::default();
        world.net.deliver(topo.edge(0, 0), pkt, None, &mut sim);
        sim.run(&mut world);
        assert_eq!(world.net.stats.delivered_pkts, 1);
    }
}

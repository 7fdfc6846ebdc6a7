//! Dumbbell 拓扑构建
//!
//! 两台主机各自接一段接入链路到一台边缘交换机，两台交换机之间是瓶颈链路：
//! `h0 -- s0 == s1 -- h1`（`==` 是带宽更低的瓶颈段）。交换机只装一条到对端
//! 主机的 FIB 直连条目，不需要 ECMP。

use crate::net::{NetWorld, NodeId, Route};
use crate::sim::SimTime;
use crate::switch::{FatTreeSwitch, FibEntry, PortDirection};

use super::{add_link, add_switch};

/// Dumbbell 拓扑配置选项
#[derive(Debug, Clone)]
pub struct DumbbellOpts {
    pub pkt_bytes: u32,
    pub pkts: u64,
    pub gap: SimTime,
    pub host_link_gbps: u64,
    pub bottleneck_gbps: u64,
    pub link_latency: SimTime,
    pub until: SimTime,
    pub switch_delay: SimTime,
    pub queue_max_bytes: u64,
}

impl Default for DumbbellOpts {
    fn default() -> Self {
        Self {
            pkt_bytes: 1500,
            pkts: 1000,
            gap: SimTime::from_micros(10),
            host_link_gbps: 100,
            bottleneck_gbps: 10,
            link_latency: SimTime::from_micros(2),
            until: SimTime::from_millis(50),
            switch_delay: SimTime::from_micros(1),
            queue_max_bytes: crate::queue::mem_from_pkt(100),
        }
    }
}

/// 两台主机、一条瓶颈链路的拓扑视图，与 `FatTreeTopology` 对齐：
/// `host_uplink(0)`/`host_uplink(1)` 各自给出该主机到自己 edge 交换机的
/// 发送路由，供 CLI/workload 层按扁平 host 下标点名两端。
#[derive(Debug, Clone)]
pub struct DumbbellTopology {
    pub h0: NodeId,
    pub h1: NodeId,
    host_uplinks: [Route; 2],
}

impl DumbbellTopology {
    pub fn host(&self, idx: usize) -> NodeId {
        match idx {
            0 => self.h0,
            1 => self.h1,
            other => panic!("dumbbell only has 2 hosts, got index {other}"),
        }
    }

    pub fn host_uplink(&self, idx: usize) -> Route {
        self.host_uplinks[idx].clone()
    }
}

/// 构建 dumbbell 拓扑：`h0 <-> s0 <-> s1 <-> h1`。
pub fn build_dumbbell(world: &mut NetWorld, opts: &DumbbellOpts) -> DumbbellTopology {
    let net = &mut world.net;
    let h0 = net.add_host("h0");
    let h1 = net.add_host("h1");
    let s0 = add_switch(net, "s0", opts.switch_delay, 0xA5A5_A5A5);
    let s1 = add_switch(net, "s1", opts.switch_delay, 0x5A5A_5A5A);

    let gbps_to_bps = |g: u64| g.saturating_mul(1_000_000_000);
    let host_bps = gbps_to_bps(opts.host_link_gbps);
    let bottleneck_bps = gbps_to_bps(opts.bottleneck_gbps);
    let max_bytes = opts.queue_max_bytes;

    let h0_to_s0 = add_link(net, "h0-s0", s0, opts.link_latency, host_bps, max_bytes);
    let s0_to_h0 = add_link(net, "s0-h0", h0, opts.link_latency, host_bps, max_bytes);
    let s0_to_s1 = add_link(net, "s0-s1", s1, opts.link_latency, bottleneck_bps, max_bytes);
    let s1_to_s0 = add_link(net, "s1-s0", s0, opts.link_latency, bottleneck_bps, max_bytes);
    let s1_to_h1 = add_link(net, "s1-h1", h1, opts.link_latency, host_bps, max_bytes);
    let h1_to_s1 = add_link(net, "h1-s1", s1, opts.link_latency, host_bps, max_bytes);

    net.sink_as::<FatTreeSwitch>(s0)
        .expect("s0 must exist")
        .add_fib_entry(h1, FibEntry { egress_route: s0_to_s1, cost: 1, direction: PortDirection::Up });
    net.sink_as::<FatTreeSwitch>(s0)
        .expect("s0 must exist")
        .add_fib_entry(h0, FibEntry { egress_route: s0_to_h0, cost: 1, direction: PortDirection::Down });
    net.sink_as::<FatTreeSwitch>(s1)
        .expect("s1 must exist")
        .add_fib_entry(h0, FibEntry { egress_route: s1_to_s0, cost: 1, direction: PortDirection::Up });
    net.sink_as::<FatTreeSwitch>(s1)
        .expect("s1 must exist")
        .add_fib_entry(h1, FibEntry { egress_route: s1_to_h1, cost: 1, direction: PortDirection::Down });

    DumbbellTopology { h0, h1, host_uplinks: [h0_to_s0, h1_to_s1] }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{Network, PacketKind};
    use crate::sim::Simulator;

    #[test]
    fn packet_crosses_the_bottleneck() {
        let opts = DumbbellOpts::default();
        let mut world = NetWorld::new(Network::default());
        let topo = build_dumbbell(&mut world, &opts);

        let mut pkt = world.net.pool.alloc(PacketKind::TcpData);
        pkt.dst = topo.h1;
        pkt.size = 1000;
        pkt.set_route(topo.host_uplink(0));

        let mut sim = Simulator::default();
        world.net.deliver(topo.h0, pkt, None, &mut sim);
        // h0 自身只是一个 HostSink，收到非目的地的包会沿路由转发。
        sim.run(&mut world);
        assert_eq!(world.net.stats.delivered_pkts, 1);
    }
}

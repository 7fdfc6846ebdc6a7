//! host 侧示例程序：加载一个工作负载 JSON，跑一次仿真，打印统计。
//!
//! 核心（事件调度器/包模型/队列/交换机/TCP-DCTCP-MPTCP）对这个文件一无所知：
//! 这里只调用 `dcnetsim::topo`/`dcnetsim::proto` 暴露的公开构造函数和
//! `dcnetsim::sim::WorkloadSpec` 的解析结果来搭建一次具体的运行。

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use thiserror::Error;

use dcnetsim::net::{EventSourceId, NetWorld, Network, NodeId, Route, WakeSink, WakeTask};
use dcnetsim::proto::mptcp::{CouplingAlgorithm, DEFAULT_RWND_SEGS, MptcpMeta, MptcpSubflowReceiver, MptcpSubflowSender};
use dcnetsim::proto::{DctcpReceiver, DctcpSender, RtoScanner, TcpReceiver, TcpSender, TrackedSender};
use dcnetsim::sim::{FlowSpec, SimTime, Simulator, TopologyKind, TransportKind, WorkloadError, WorkloadSpec};
use dcnetsim::topo::dumbbell::{build_dumbbell, DumbbellOpts};
use dcnetsim::topo::fat_tree::{build_fat_tree, FatTreeOpts};

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to read workload file {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
    #[error(transparent)]
    Workload(#[from] WorkloadError),
    #[error("flow {src} -> {dst} references host index out of range (topology has {host_count} hosts)")]
    HostOutOfRange { src: usize, dst: usize, host_count: usize },
}

#[derive(Debug, Parser)]
#[command(name = "dcnetsim", about = "Run a datacenter-network simulation from a workload spec")]
struct Cli {
    /// Path to a workload spec JSON file (see `dcnetsim::sim::WorkloadSpec`).
    workload: PathBuf,
}

/// 搭好的拓扑对外只需要暴露"按扁平 host 下标拿 NodeId/发送路由"这一点，
/// fat-tree 和 dumbbell 的内部差异到这里就抹平了。
enum Topology {
    FatTree(dcnetsim::topo::fat_tree::FatTreeTopology),
    Dumbbell(dcnetsim::topo::dumbbell::DumbbellTopology),
}

impl Topology {
    fn host_count(&self) -> usize {
        match self {
            Topology::FatTree(t) => t.hosts.len(),
            Topology::Dumbbell(_) => 2,
        }
    }

    fn host(&self, idx: usize) -> NodeId {
        match self {
            Topology::FatTree(t) => t.hosts[idx],
            Topology::Dumbbell(t) => t.host(idx),
        }
    }

    fn host_uplink(&self, idx: usize) -> Route {
        match self {
            Topology::FatTree(t) => t.host_uplink(idx),
            Topology::Dumbbell(t) => t.host_uplink(idx),
        }
    }
}

fn build_topology(world: &mut NetWorld, kind: &TopologyKind) -> Topology {
    match kind {
        TopologyKind::FatTree { k, link_gbps, link_latency_us } => {
            let opts = FatTreeOpts {
                k: *k as usize,
                link_gbps: link_gbps.unwrap_or(100),
                link_latency: SimTime::from_micros(link_latency_us.unwrap_or(2)),
                ..Default::default()
            };
            Topology::FatTree(build_fat_tree(world, &opts))
        }
        TopologyKind::Dumbbell { host_link_gbps, bottleneck_gbps, link_latency_us } => {
            let opts = DumbbellOpts {
                host_link_gbps: host_link_gbps.unwrap_or(100),
                bottleneck_gbps: bottleneck_gbps.unwrap_or(10),
                link_latency: SimTime::from_micros(link_latency_us.unwrap_or(2)),
                ..Default::default()
            };
            Topology::Dumbbell(build_dumbbell(world, &opts))
        }
    }
}

fn spawn_flow(
    world: &mut NetWorld,
    sim: &mut Simulator,
    scanner_id: dcnetsim::net::TaskId,
    topo: &Topology,
    flow_idx: usize,
    flow: &FlowSpec,
) -> Result<(), CliError> {
    let host_count = topo.host_count();
    if flow.src_host >= host_count || flow.dst_host >= host_count {
        return Err(CliError::HostOutOfRange { src: flow.src_host, dst: flow.dst_host, host_count });
    }
    let flow_id = flow.id.unwrap_or(flow_idx as u64 + 1);
    let src = topo.host(flow.src_host);
    let dst = topo.host(flow.dst_host);
    let send_route = topo.host_uplink(flow.src_host);
    let ack_route = topo.host_uplink(flow.dst_host);
    let mss = 1460u32;
    let start = SimTime::from_micros(flow.start_offset_us.unwrap_or(0));

    match flow.transport.unwrap_or(TransportKind::Tcp) {
        TransportKind::Tcp => {
            let recv_id = world
                .net
                .add_sink(|id| Box::new(TcpReceiver::new(id, format!("recv{flow_id}"), src, flow_id, 64, ack_route)));
            let send_id = world.net.add_sink(|id| {
                Box::new(TcpSender::new(id, format!("send{flow_id}"), recv_id, send_route, flow_id, mss, flow.size_bytes))
            });
            world.net.with_task_as::<RtoScanner, ()>(scanner_id, |scanner| {
                scanner.track(TrackedSender::Tcp(send_id));
            });
            sim.schedule_for(send_id.source_id(), start, WakeSink { to: send_id });
        }
        TransportKind::Dctcp => {
            let recv_id = world
                .net
                .add_sink(|id| Box::new(DctcpReceiver::new(id, format!("recv{flow_id}"), src, flow_id, 64, ack_route)));
            let send_id = world.net.add_sink(|id| {
                Box::new(DctcpSender::new(id, format!("send{flow_id}"), recv_id, send_route, flow_id, mss, flow.size_bytes))
            });
            world.net.with_task_as::<RtoScanner, ()>(scanner_id, |scanner| {
                scanner.track(TrackedSender::Dctcp(send_id));
            });
            sim.schedule_for(send_id.source_id(), start, WakeSink { to: send_id });
        }
        TransportKind::Mptcp => {
            let subflow_count = flow.subflows.unwrap_or(2).max(1);
            let meta = MptcpMeta::new(CouplingAlgorithm::CoupledInc, flow.size_bytes, DEFAULT_RWND_SEGS);
            for sub in 0..subflow_count {
                let sub_flow_id = flow_id.saturating_mul(1000).saturating_add(sub as u64);
                let recv_id = world.net.add_sink(|id| {
                    Box::new(MptcpSubflowReceiver::new(id, format!("recv{flow_id}.{sub}"), src, sub_flow_id, 64, ack_route.clone(), meta.clone()))
                });
                let send_id = world.net.add_sink(|id| {
                    Box::new(MptcpSubflowSender::new(id, format!("send{flow_id}.{sub}"), recv_id, send_route.clone(), sub_flow_id, mss, meta.clone()))
                });
                world.net.with_task_as::<RtoScanner, ()>(scanner_id, |scanner| {
                    scanner.track(TrackedSender::MptcpSubflow(send_id));
                });
                sim.schedule_for(send_id.source_id(), start, WakeSink { to: send_id });
            }
        }
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), CliError> {
    let text = std::fs::read_to_string(&cli.workload)
        .map_err(|source| CliError::Io { path: cli.workload.display().to_string(), source })?;
    let spec = WorkloadSpec::from_json(&text)?;

    let mut world = NetWorld::new(Network::default());
    let topo = build_topology(&mut world, &spec.topology);

    let mut sim = Simulator::default();
    let scanner_id = world.net.add_task(|id| Box::new(RtoScanner::new(id)));

    for (flow_idx, flow) in spec.flows.iter().enumerate() {
        spawn_flow(&mut world, &mut sim, scanner_id, &topo, flow_idx, flow)?;
    }

    sim.schedule_for(EventSourceId::Task(scanner_id).source_id(), SimTime::ZERO, WakeTask { id: scanner_id });

    match spec.end_time() {
        Some(until) => sim.run_until(until, &mut world),
        None => sim.run(&mut world),
    }

    tracing::info!(
        now = ?sim.now(),
        delivered_pkts = world.net.stats.delivered_pkts,
        delivered_bytes = world.net.stats.delivered_bytes,
        dropped_pkts = world.net.stats.dropped_pkts,
        dropped_bytes = world.net.stats.dropped_bytes,
        "仿真结束"
    );
    println!(
        "done @ {:?}: delivered_pkts={} delivered_bytes={} dropped_pkts={} dropped_bytes={}",
        sim.now(),
        world.net.stats.delivered_pkts,
        world.net.stats.delivered_bytes,
        world.net.stats.dropped_pkts,
        world.net.stats.dropped_bytes,
    );
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

//! 网络：转发图与后台任务的两个 arena
//!
//! `nodes` 以 `NodeId` 寻址，装着管道/队列/交换机/传输端点——一切会在
//! `Route` 里出现的东西。`tasks` 以 `TaskId` 寻址，装着没有位置、只按周期
//! 醒来的后台工作（RTO 扫描器、MPTCP 子流控制器）。两个 arena 互不知晓
//! 对方，调度器只通过 `SourceId`（`id::EventSourceId` 统一编码）区分身份。

use std::collections::HashMap;

use super::flow::{FlowEvent, FlowLogger};
use super::id::{NodeId, TaskId};
use super::packet::{Packet, PacketFlow, PacketPool};
use super::sink::{BackgroundTask, QueueStatus, Sink};
use super::stats::Stats;
use crate::sim::Simulator;
use tracing::{debug, info, trace};

/// 简单的转发主机：不是目的地就转发，是目的地就交付。用于拓扑骨架测试和
/// 还没有接上真正传输端点的链路两端占位。真正跑 TCP/DCTCP/MPTCP 流量的
/// 主机端口由 `proto::tcp::TcpEndpoint` 之类的 sink 占据，不使用这个类型。
pub struct HostSink {
    id: NodeId,
    name: String,
}

impl HostSink {
    pub fn new(id: NodeId, name: impl Into<String>) -> Self {
        Self { id, name: name.into() }
    }
}

impl Sink for HostSink {
    fn id(&self) -> NodeId {
        self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn receive_packet(&mut self, pkt: Packet, _prev_vq: Option<usize>, sim: &mut Simulator, net: &mut Network) {
        if self.id != pkt.dst {
            net.forward_from(self.id, pkt, sim);
        } else {
            net.on_delivered(pkt);
        }
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[derive(Default)]
pub struct Network {
    nodes: Vec<Option<Box<dyn Sink>>>,
    tasks: Vec<Option<Box<dyn BackgroundTask>>>,
    names: HashMap<NodeId, String>,
    pub pool: PacketPool,
    pub stats: Stats,
    logger: Option<Box<dyn FlowLogger>>,
}

impl Network {
    pub fn add_host(&mut self, name: impl Into<String>) -> NodeId {
        self.add_sink(|id| Box::new(HostSink::new(id, name)))
    }

    /// 通用节点注册：构造闭包拿到预先分配好的 `NodeId`，这样 sink 内部可以
    /// 持有自己的身份（用于 `schedule_for(self.id.source_id(), ...)`）。
    pub fn add_sink<F>(&mut self, build: F) -> NodeId
    where
        F: FnOnce(NodeId) -> Box<dyn Sink>,
    {
        let id = NodeId(self.nodes.len());
        let sink = build(id);
        self.names.insert(id, sink.name().to_string());
        self.nodes.push(Some(sink));
        id
    }

    pub fn add_task<F>(&mut self, build: F) -> TaskId
    where
        F: FnOnce(TaskId) -> Box<dyn BackgroundTask>,
    {
        let id = TaskId(self.tasks.len());
        self.tasks.push(Some(build(id)));
        id
    }

    pub fn set_logger(&mut self, logger: Box<dyn FlowLogger>) {
        self.logger = Some(logger);
    }

    pub fn name_of(&self, id: NodeId) -> &str {
        self.names.get(&id).map(String::as_str).unwrap_or("?")
    }

    /// 下转到具体 sink 类型的可变引用。供只需要读/改这一个 sink 自身状态的
    /// 调用方使用（比如测试）；若闭包内还要用到 `&mut Network`，改用
    /// `with_sink_as`（take-and-replace，避免双重借用）。
    pub fn sink_as<T: 'static>(&mut self, id: NodeId) -> Option<&mut T> {
        self.nodes.get_mut(id.0)?.as_mut()?.as_any_mut().downcast_mut::<T>()
    }

    /// 下转到具体 sink 类型，同时把 `&mut Network` 一并交给闭包——RTO 扫描器
    /// 之类需要在处理一个 sink 时仍能调用 `net.forward_from`/`net.pool` 等。
    /// take-and-replace：先把 sink 从 arena 取出（此时它与 `self` 再无借用
    /// 关联），下转、跑闭包，再放回去。
    pub fn with_sink_as<T: 'static, R>(&mut self, id: NodeId, f: impl FnOnce(&mut T, &mut Network) -> R) -> Option<R> {
        let mut boxed = self.nodes.get_mut(id.0)?.take()?;
        let result = boxed.as_any_mut().downcast_mut::<T>().map(|concrete| f(concrete, self));
        self.nodes[id.0] = Some(boxed);
        result
    }

    /// 所有当前存活的节点 id，按分配顺序。供 RTO 扫描器之类需要遍历全部
    /// sink 的后台任务使用。
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().enumerate().filter_map(|(i, s)| s.is_some().then_some(NodeId(i)))
    }

    /// 供自适应路由的比较器读取某个出口 sink 的瞬时队列状态；不是队列（管道、
    /// 主机、另一个交换机）的 sink 返回 `None`。
    pub fn queue_status_of(&self, id: NodeId, sim: &Simulator) -> Option<QueueStatus> {
        self.nodes.get(id.0)?.as_ref()?.queue_status(sim)
    }

    /// 把一个包交给某个 sink 处理。暂时把 sink 取出来，避免 `&mut self` 与
    /// `&mut sink` 的重叠借用（take-and-replace，和协议栈分发用的是同一个
    /// 模式）。
    #[tracing::instrument(skip(self, pkt, sim), fields(pkt_id = pkt.id, to = ?to))]
    pub fn deliver(&mut self, to: NodeId, pkt: Packet, prev_vq: Option<usize>, sim: &mut Simulator) {
        debug!("📬 将数据包交付给 sink 处理");
        let mut sink = self.nodes[to.0].take().expect("sink exists");
        sink.receive_packet(pkt, prev_vq, sim, self);
        self.nodes[to.0] = Some(sink);
    }

    /// 唤醒一个自调度的 sink（管道/队列），不携带新包。
    #[tracing::instrument(skip(self, sim), fields(to = ?to))]
    pub fn wake(&mut self, to: NodeId, sim: &mut Simulator) {
        let mut sink = self.nodes[to.0].take().expect("sink exists");
        sink.on_wake(sim, self);
        self.nodes[to.0] = Some(sink);
    }

    /// 唤醒一个后台任务。
    pub fn run_task(&mut self, id: TaskId, sim: &mut Simulator) {
        let mut task = self.tasks[id.0].take().expect("task exists");
        task.run(sim, self);
        self.tasks[id.0] = Some(task);
    }

    /// 下转到具体的后台任务类型，供拓扑/workload 构建代码注册要巡检的连接
    /// （比如 `RtoScanner::track`）。take-and-replace，原理同 `with_sink_as`。
    pub fn with_task_as<T: 'static, R>(&mut self, id: TaskId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut boxed = self.tasks.get_mut(id.0)?.take()?;
        let result = boxed.as_any_mut().downcast_mut::<T>().map(f);
        self.tasks[id.0] = Some(boxed);
        result
    }

    /// 沿包自身携带的路由走下一跳：`send_on()` 返回 `None` 表示已到终点。
    #[tracing::instrument(skip(self, pkt, sim), fields(pkt_id = pkt.id, from = ?from))]
    pub fn forward_from(&mut self, from: NodeId, mut pkt: Packet, sim: &mut Simulator) {
        trace!("沿路由转发");
        if let Some(next) = pkt.send_on() {
            self.deliver(next, pkt, None, sim);
        } else {
            let _ = from;
            self.on_delivered(pkt);
        }
    }

    #[tracing::instrument(skip(self, pkt), fields(pkt_id = pkt.id, flow_id = pkt.flow_id))]
    pub fn on_delivered(&mut self, pkt: Packet) {
        info!("✅ 数据包送达目的地");
        self.stats.delivered_pkts += 1;
        self.stats.delivered_bytes += pkt.size as u64;
        if let Some(logger) = &mut self.logger {
            logger.log(PacketFlow(pkt.flow_id), FlowEvent::Delivered { bytes: pkt.size });
        }
        self.pool.free(pkt);
    }

    #[tracing::instrument(skip(self, pkt), fields(pkt_id = pkt.id, flow_id = pkt.flow_id))]
    pub fn on_dropped(&mut self, pkt: Packet) {
        debug!("❌ 数据包被丢弃");
        self.stats.dropped_pkts += 1;
        self.stats.dropped_bytes += pkt.size as u64;
        if let Some(logger) = &mut self.logger {
            logger.log(PacketFlow(pkt.flow_id), FlowEvent::Dropped { bytes: pkt.size });
        }
        self.pool.free(pkt);
    }
}

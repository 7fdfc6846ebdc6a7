//! 拓扑构建模块
//!
//! fat-tree 与 dumbbell 两种常见仿真拓扑的构建器。两者都只用 `Network` 已经
//! 暴露的通用原语（`add_sink`/`add_host`）拼出"队列 + 传播时延管道"的物理
//! 链路和交换机 FIB——拓扑相关的概念完全不污染 `net`/`queue`/`switch` 本身。

pub mod dumbbell;
pub mod fat_tree;

use crate::net::{Network, NodeId, Pipe, Route};
use crate::queue::{FifoQueue, QueueSink};
use crate::sim::SimTime;
use crate::switch::{FatTreeSwitch, RoutingStrategy};

/// 一条单向物理链路：出口队列（FIFO，承载 `bps`/`max_bytes`）串联一段传播
/// 时延管道，最终投递给 `to`。返回值是这条链路的路由段（`[queue, pipe, to]`），
/// FIB 条目或主机发送路由把若干这样的段首尾相接即可拼出端到端路径。
pub fn add_link(net: &mut Network, name: &str, to: NodeId, delay: SimTime, bps: u64, max_bytes: u64) -> Route {
    let queue_name = format!("{name}-q");
    let pipe_name = format!("{name}-pipe");
    let queue_id = net.add_sink(move |id| Box::new(QueueSink::new(id, queue_name, FifoQueue::new(), bps, max_bytes)));
    let pipe_id = net.add_sink(move |id| Box::new(Pipe::new(id, pipe_name, delay)));
    Route::new(vec![queue_id, pipe_id, to])
}

/// 一个使用 ECMP 策略的 fat-tree 交换机，带固定的内部转发时延。
pub fn add_switch(net: &mut Network, name: impl Into<String>, switch_delay: SimTime, hash_salt: u64) -> NodeId {
    let name = name.into();
    net.add_sink(move |id| Box::new(FatTreeSwitch::new(id, name, RoutingStrategy::Ecmp, switch_delay, hash_salt)))
}

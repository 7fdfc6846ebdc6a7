//! Sink / BackgroundTask：转发图与后台任务的统一接口
//!
//! `Network` 用两个独立的 arena 承载系统里所有可调度的东西：
//! `nodes: Vec<Option<Box<dyn Sink>>>`（管道/队列/交换机/传输端点，以 `NodeId`
//! 寻址）和 `tasks: Vec<Option<Box<dyn BackgroundTask>>>`（RTO 扫描器、MPTCP
//! 子流控制器这类没有位置、只按固定周期醒来的任务，以 `TaskId` 寻址）。两者
//! 共用调度器的 `SourceId` 命名空间（见 `id::EventSourceId`），但彼此互不
//! 知晓对方的存在。

use std::any::Any;

use super::id::NodeId;
use super::network::Network;
use super::packet::Packet;
use crate::sim::Simulator;

/// 自适应路由读取出口队列瞬时状态用的快照。只有队列类 sink（`QueueSink`）
/// 会重写 `Sink::queue_status` 返回 `Some`；管道、交换机、传输端点等没有
/// 可排队状态的 sink 保持默认的 `None`，比较器把它当成"空闲"处理。
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStatus {
    pub paused: bool,
    pub quantized_queuesize: u8,
    pub quantized_utilization: u8,
}

/// 转发图里的一个节点：管道、队列、交换机或传输端点（TCP/DCTCP/MPTCP 的
/// 发送端/接收端）都实现它。`prev_vq` 是上一跳在其内部虚拟队列数组里的索引
/// （交换机的多端口排队需要知道包来自哪个 ingress queue 才能正确记账 ECN），
/// 绝大多数 sink 忽略它。
pub trait Sink {
    fn id(&self) -> NodeId;
    fn name(&self) -> &str;
    fn receive_packet(
        &mut self,
        pkt: Packet,
        prev_vq: Option<usize>,
        sim: &mut Simulator,
        net: &mut Network,
    );

    /// 自唤醒回调：管道/队列这类需要在没有新包到达时也继续服务内部积压的
    /// sink 会重写它（见 `pipe::Pipe::do_next_event`，经由 `WakeSink` 事件
    /// 驱动）。大多数 sink（交换机、传输端点）没有内部积压，留空实现。
    fn on_wake(&mut self, _sim: &mut Simulator, _net: &mut Network) {}

    /// 供自适应路由的比较器读取的瞬时队列状态。只有 `QueueSink` 重写。
    fn queue_status(&self, _sim: &Simulator) -> Option<QueueStatus> {
        None
    }

    /// 供 RTO 扫描器之类需要拿到具体类型（而不是 `dyn Sink`）的调用方下转。
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// 没有固定位置、按固定周期被调度唤醒的后台任务。
pub trait BackgroundTask {
    fn name(&self) -> &str;
    /// 被调度器唤醒时调用；任务自己负责用 `Simulator::schedule_for` 重新
    /// 安排下一次唤醒（周期性任务永远不会让自己"掉线"）。
    fn run(&mut self, sim: &mut Simulator, net: &mut Network);

    /// 供拓扑/workload 构建代码下转到具体类型（比如注册要巡检的连接）。
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

//! 标识符类型
//!
//! `NodeId` 为转发图（pipe/queue/switch/transport endpoint 的统一 arena）中的
//! 节点编号；`TaskId` 为周期性后台任务（RTO 扫描器、MPTCP 子流控制器）的
//! 编号。`EventSourceId` 把两者统一映射到调度器的不透明 `SourceId` 上，使得
//! `cancel`/`cancel_at` 可以对任一种 event source 的身份做相等性比较。

use crate::sim::SourceId;

/// 转发图中的节点标识符（pipe / queue / switch / transport endpoint）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// 周期性后台任务标识符（RTO 扫描器、MPTCP 子流控制器）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub usize);

/// 链路标识符。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub usize);

impl NodeId {
    /// 映射到调度器的不透明 source 身份：偶数留给节点。
    pub fn source_id(self) -> SourceId {
        SourceId((self.0 as u64) << 1)
    }
}

impl TaskId {
    /// 映射到调度器的不透明 source 身份：奇数留给任务。
    pub fn source_id(self) -> SourceId {
        SourceId(((self.0 as u64) << 1) | 1)
    }
}

/// 一个可调度事件源的不透明身份：要么是转发图里的一个节点，要么是一个
/// 后台任务。调度器本身不区分这两种，只做相等性比较。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSourceId {
    Node(NodeId),
    Task(TaskId),
}

impl EventSourceId {
    pub fn source_id(self) -> SourceId {
        match self {
            EventSourceId::Node(n) => n.source_id(),
            EventSourceId::Task(t) => t.source_id(),
        }
    }
}

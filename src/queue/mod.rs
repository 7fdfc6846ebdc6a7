//! 队列纪律（queue disciplines）
//!
//! `QueueDiscipline` 是子类要实现的最小接口：入队时决定准入/丢弃，出队时
//! 决定服务顺序。公共的排空时间计算、忙时利用率跟踪、以及把纪律接到调度器
//! 上的自驱动逻辑都由 [`QueueSink`] 统一承担——这样每个纪律只需要回答"收到
//! 这个包要不要、现在该送走哪个"，不需要重新实现调度接线。

mod composite_priority;
mod ecn;
mod ecn_priority;
mod fifo;
mod priority;
mod random_drop;
mod sink;
mod utilization;

pub use composite_priority::CompositePriorityQueue;
pub use ecn::EcnQueue;
pub use ecn_priority::EcnPriorityQueue;
pub use fifo::FifoQueue;
pub use priority::PriorityQueue;
pub use random_drop::RandomDropQueue;
pub use sink::QueueSink;
pub use utilization::UtilizationTracker;

use crate::net::Packet;

pub const DEFAULT_PKT_BYTES: u64 = 1500;

pub fn mem_from_pkt(pkts: u64) -> u64 {
    pkts.saturating_mul(DEFAULT_PKT_BYTES)
}

/// 一个队列纪律看到的最小世界：admission + 出队顺序。字节记账、忙时跟踪、
/// 与调度器打交道全部由 `QueueSink` 负责，纪律实现不必关心。
pub trait QueueDiscipline {
    /// 准入 + 入队。返回 `Err(pkt)` 表示被丢弃（调用方负责统计/归还池）。
    fn admit(&mut self, pkt: Packet, queue_bytes_before: u64, max_bytes: u64) -> Result<(), Packet>;
    /// 出队下一个要服务的包（若非空）。
    fn pop_next(&mut self) -> Option<Packet>;
    /// 当前排队的包数与字节数（跨所有内部子队列求和）。
    fn len(&self) -> usize;
    fn bytes(&self) -> u64;
    /// 窥视下一个将被服务的包（用于计算 `drain_time`），不出队。
    fn peek_next(&self) -> Option<&Packet>;
}

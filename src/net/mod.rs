//! 网络模拟模块
//!
//! 转发图（pipe/queue/switch/transport endpoint，统一在一个 arena 里，以
//! `NodeId` 寻址）、后台任务（RTO 扫描器、MPTCP 子流控制器，以 `TaskId`
//! 寻址）、数据包模型与流标识。

mod deliver_packet;
mod flow;
mod id;
mod net_world;
mod network;
mod packet;
mod pipe;
mod routing;
mod sink;
mod stats;

pub use deliver_packet::{DeliverPacket, WakeSink, WakeTask};
pub use flow::{FlowEvent, FlowLogger, NullFlowLogger};
pub use id::{EventSourceId, LinkId, NodeId, TaskId};
pub use net_world::NetWorld;
pub use network::{HostSink, Network};
pub use packet::{
    DEFAULT_MTU_BYTES, Direction, Flags, HEADER_ONLY_BYTES, Packet, PacketFlow, PacketKind,
    PacketPool, Priority, Route, TransportPayload,
};
pub use pipe::Pipe;
pub use routing::Fib;
pub use sink::{BackgroundTask, QueueStatus, Sink};
pub use stats::Stats;

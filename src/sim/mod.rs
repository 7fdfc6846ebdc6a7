//! 仿真核心模块
//!
//! 此模块包含事件驱动仿真的核心组件：皮秒级时间、事件/世界 trait、调度器
//! （含取消与触发栈）、仿真器上下文，以及工作负载/拓扑配置的 serde 模型。

mod event;
mod scheduler;
mod simulator;
mod time;
mod trigger;
mod workload;
mod world;

pub use event::Event;
pub use scheduler::{Handle, SourceId};
pub use simulator::{Simulator, DYNAMIC_FLOW_ID_BASE};
pub use time::{drain_time, SimTime};
pub use trigger::{BarrierTrigger, MultiShotTrigger, SingleShotTrigger, TriggerTarget};
pub use workload::{
    FlowSpec, TopologyKind, TransportKind, WorkloadError, WorkloadSpec,
};
pub use world::World;

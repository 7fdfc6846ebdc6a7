//! 传输层/协议模块
//!
//! 包含 TCP / DCTCP / MPTCP 的简化实现（用于仿真实验），以及把 RTO 超时巡检
//! 从"每条连接一个定时器"改造成进程级周期扫描的 `RtoScanner`。

pub mod dctcp;
pub mod mptcp;
pub mod rto_scanner;
pub mod tcp;

pub use dctcp::{DctcpReceiver, DctcpSender};
pub use mptcp::{CouplingAlgorithm, MptcpMeta, MptcpSubflowReceiver, MptcpSubflowSender};
pub use rto_scanner::{RtoScanner, TrackedSender};
pub use tcp::{TcpReceiver, TcpSender, TcpStart};

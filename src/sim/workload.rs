//! 工作负载/拓扑配置模型（ambient：serde_json）
//!
//! 主机程序可以从一个 JSON 文件加载 `WorkloadSpec`，描述要构建的拓扑
//! （fat-tree 或 dumbbell）以及要跑的流（TCP/DCTCP/MPTCP，起止主机、大小、
//! 启动偏移）。核心仿真逻辑从不依赖这个模块——它只是主机层的边界配置。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::time::SimTime;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub schema_version: u32,
    pub topology: TopologyKind,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub end_time_ms: Option<u64>,
    pub flows: Vec<FlowSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TopologyKind {
    Dumbbell {
        #[serde(default)]
        host_link_gbps: Option<u64>,
        #[serde(default)]
        bottleneck_gbps: Option<u64>,
        #[serde(default)]
        link_latency_us: Option<u64>,
    },
    FatTree {
        k: u64,
        #[serde(default)]
        link_gbps: Option<u64>,
        #[serde(default)]
        link_latency_us: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Tcp,
    Dctcp,
    Mptcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSpec {
    #[serde(default)]
    pub id: Option<u64>,
    pub src_host: usize,
    pub dst_host: usize,
    pub size_bytes: u64,
    #[serde(default)]
    pub transport: Option<TransportKind>,
    #[serde(default)]
    pub start_offset_us: Option<u64>,
    /// MPTCP only: how many subflows/disjoint paths to request initially.
    #[serde(default)]
    pub subflows: Option<u32>,
}

impl WorkloadSpec {
    pub fn from_json(text: &str) -> Result<Self, WorkloadError> {
        let spec: WorkloadSpec = serde_json::from_str(text)?;
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<(), WorkloadError> {
        if self.flows.is_empty() {
            return Err(WorkloadError::NoFlows);
        }
        for flow in &self.flows {
            if flow.src_host == flow.dst_host {
                return Err(WorkloadError::SelfLoopFlow {
                    host: flow.src_host,
                });
            }
            if flow.size_bytes == 0 {
                return Err(WorkloadError::EmptyFlow {
                    src: flow.src_host,
                    dst: flow.dst_host,
                });
            }
        }
        if let TopologyKind::FatTree { k, .. } = &self.topology {
            if *k < 2 || k % 2 != 0 {
                return Err(WorkloadError::BadFatTreeK { k: *k });
            }
        }
        Ok(())
    }

    pub fn end_time(&self) -> Option<SimTime> {
        self.end_time_ms.map(SimTime::from_millis)
    }
}

/// Host-facing, recoverable errors from loading/validating a workload spec.
/// Nothing in the simulation core returns `Result` for conditions like these;
/// they are boundary-only.
#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("malformed workload JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("workload has no flows")]
    NoFlows,
    #[error("flow from host {host} to itself is not allowed")]
    SelfLoopFlow { host: usize },
    #[error("flow {src} -> {dst} has zero size_bytes")]
    EmptyFlow { src: usize, dst: usize },
    #[error("fat-tree k={k} must be even and >= 2")]
    BadFatTreeK { k: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_fat_tree_workload() {
        let text = r#"{
            "schema_version": 1,
            "topology": {"kind": "fat_tree", "k": 4},
            "flows": [{"src_host": 0, "dst_host": 1, "size_bytes": 102400, "transport": "tcp"}]
        }"#;
        let spec = WorkloadSpec::from_json(text).expect("valid workload");
        assert_eq!(spec.flows.len(), 1);
    }

    #[test]
    fn rejects_self_loop_flow() {
        let text = r#"{
            "schema_version": 1,
            "topology": {"kind": "dumbbell"},
            "flows": [{"src_host": 0, "dst_host": 0, "size_bytes": 100}]
        }"#;
        let err = WorkloadSpec::from_json(text).unwrap_err();
        assert!(matches!(err, WorkloadError::SelfLoopFlow { host: 0 }));
    }

    #[test]
    fn rejects_odd_fat_tree_k() {
        let text = r#"{
            "schema_version": 1,
            "topology": {"kind": "fat_tree", "k": 3},
            "flows": [{"src_host": 0, "dst_host": 1, "size_bytes": 100}]
        }"#;
        let err = WorkloadSpec::from_json(text).unwrap_err();
        assert!(matches!(err, WorkloadError::BadFatTreeK { k: 3 }));
    }
}

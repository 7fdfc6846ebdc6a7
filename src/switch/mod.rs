//! Fat-tree 交换机：FIB 转发、ECMP/自适应路由策略、粘性 flowlet 路由。

mod comparator;
mod fat_tree_switch;

pub use comparator::{by_bandwidth, by_flow_count, by_pause, by_queue_size, CandidateState, Comparator};
pub use fat_tree_switch::{FatTreeSwitch, FibEntry, PortDirection, RoutingStrategy, FLOWLET_IDLE_GAP};

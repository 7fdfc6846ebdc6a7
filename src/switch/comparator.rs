//! 自适应路由的候选比较器
//!
//! 每个比较器返回 `Ordering`：`Less` 表示左边的候选更优。组合变体把多个
//! 比较器按优先级链起来（前一个打平才看下一个）。

use std::cmp::Ordering;

use crate::net::NodeId;

/// 一个候选出口的可比较状态快照。真实实现从对应的 `QueueSink` 读取；这里
/// 用一个独立的快照结构体，让比较器不必知道队列纪律的具体类型。
#[derive(Debug, Clone, Copy)]
pub struct CandidateState {
    pub egress: NodeId,
    pub paused: bool,
    pub quantized_queuesize: u8,
    pub quantized_utilization: u8,
    pub pinned_flow_count: u32,
}

pub type Comparator = fn(&CandidateState, &CandidateState) -> Ordering;

pub fn by_pause(a: &CandidateState, b: &CandidateState) -> Ordering {
    // 未暂停优先：false < true 在我们想要的方向上是反的，所以取反比较。
    b.paused.cmp(&a.paused)
}

pub fn by_queue_size(a: &CandidateState, b: &CandidateState) -> Ordering {
    a.quantized_queuesize.cmp(&b.quantized_queuesize)
}

pub fn by_bandwidth(a: &CandidateState, b: &CandidateState) -> Ordering {
    a.quantized_utilization.cmp(&b.quantized_utilization)
}

pub fn by_flow_count(a: &CandidateState, b: &CandidateState) -> Ordering {
    a.pinned_flow_count.cmp(&b.pinned_flow_count)
}

/// 链接多个比较器：按顺序尝试，第一个不是 `Equal` 的结果生效。
pub fn chain(comparators: &[Comparator], a: &CandidateState, b: &CandidateState) -> Ordering {
    for cmp in comparators {
        let ord = cmp(a, b);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// 在候选集合里按给定比较器链挑出最优的一个。
pub fn pick_best(candidates: &[CandidateState], comparators: &[Comparator]) -> Option<NodeId> {
    candidates
        .iter()
        .min_by(|a, b| chain(comparators, a, b))
        .map(|c| c.egress)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(egress: usize, paused: bool, qsize: u8, util: u8, flows: u32) -> CandidateState {
        CandidateState {
            egress: NodeId(egress),
            paused,
            quantized_queuesize: qsize,
            quantized_utilization: util,
            pinned_flow_count: flows,
        }
    }

    #[test]
    fn unpaused_preferred_over_paused() {
        let a = state(0, false, 0, 0, 0);
        let b = state(1, true, 0, 0, 0);
        assert_eq!(by_pause(&a, &b), Ordering::Less);
    }

    #[test]
    fn chain_falls_through_to_next_comparator() {
        let a = state(0, false, 2, 1, 0);
        let b = state(1, false, 1, 0, 0);
        let chained = chain(&[by_pause, by_queue_size], &a, &b);
        assert_eq!(chained, Ordering::Greater);
    }

    #[test]
    fn pick_best_selects_minimal_candidate() {
        let cands = vec![state(0, false, 3, 3, 3), state(1, false, 0, 0, 0), state(2, true, 0, 0, 0)];
        let best = pick_best(&cands, &[by_pause, by_queue_size]).unwrap();
        assert_eq!(best, NodeId(1));
    }
}

//! 路由表（FIB）与 ECMP
//!
//! 每条数据包在分配时已经携带一条完整的 `Route`（节点序列），所以这里的
//! `Fib` 不是逐包查表转发路径——它是拓扑构建阶段用来算出"A 到 B 有哪些等价
//! 最短路径"的工具，供 `topo::fat_tree` 之类的构建器在创建 `Route` 时，以及
//! `switch::FatTreeSwitch` 在做自适应/flowlet 路由决策时，挑选下一跳使用。

use std::collections::{HashMap, VecDeque};

use super::id::NodeId;

#[derive(Debug, Default, Clone)]
pub struct Fib {
    dirty: bool,
    next_hops: HashMap<(NodeId, NodeId), Vec<NodeId>>,
    hash_salt: u64,
}

impl Fib {
    /// `hash_salt` 应当来自 `Simulator::next_rng_u64`，使得 ECMP 的选路在给定
    /// 种子下可复现，而不同种子之间确实不同。
    pub fn new(hash_salt: u64) -> Self {
        Self {
            dirty: true,
            next_hops: HashMap::new(),
            hash_salt,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// 基于邻接表重算 FIB。`adj[from]` 是从 `from` 出发的出边邻居；
    /// `rev_adj[to]` 是能到达 `to` 的前驱集合。对每个目的地在反向图上做一次
    /// BFS 得到最短跳数距离，然后把所有落在最短距离上的出边都记作 ECMP 候选。
    pub fn ensure_built(&mut self, adj: &[Vec<NodeId>], rev_adj: &[Vec<NodeId>]) {
        if !self.dirty {
            return;
        }
        let n = adj.len();
        self.next_hops.clear();

        let mut dist: Vec<i32> = vec![i32::MAX; n];
        let mut q: VecDeque<NodeId> = VecDeque::new();

        for dst_idx in 0..n {
            dist.fill(i32::MAX);
            q.clear();
            let dst = NodeId(dst_idx);
            dist[dst_idx] = 0;
            q.push_back(dst);

            while let Some(v) = q.pop_front() {
                let dv = dist[v.0];
                for &pred in &rev_adj[v.0] {
                    if dist[pred.0] == i32::MAX {
                        dist[pred.0] = dv.saturating_add(1);
                        q.push_back(pred);
                    }
                }
            }

            for from_idx in 0..n {
                let from = NodeId(from_idx);
                if from == dst {
                    continue;
                }
                let df = dist[from_idx];
                if df == i32::MAX {
                    continue;
                }
                let mut cands = Vec::new();
                for &nh in &adj[from_idx] {
                    if dist[nh.0] == df - 1 {
                        cands.push(nh);
                    }
                }
                if !cands.is_empty() {
                    self.next_hops.insert((from, dst), cands);
                }
            }
        }
        self.dirty = false;
    }

    pub fn next_hops(&self, from: NodeId, dst: NodeId) -> Option<&[NodeId]> {
        self.next_hops.get(&(from, dst)).map(|v| v.as_slice())
    }

    /// 基于 flow_id 的稳定 ECMP 选择（同一条流在拓扑不变期间恒定地选同一个
    /// 下一跳，除非发生 flowlet 重哈希）。
    pub fn pick_ecmp(&self, from: NodeId, dst: NodeId, flow_id: u64, cands: &[NodeId]) -> NodeId {
        self.pick_ecmp_with_key(from, dst, flow_id, cands)
    }

    pub fn pick_ecmp_with_key(&self, from: NodeId, dst: NodeId, key: u64, cands: &[NodeId]) -> NodeId {
        debug_assert!(!cands.is_empty());
        let h = mix64(
            key ^ (from.0 as u64).wrapping_mul(0x9E3779B97F4A7C15)
                ^ (dst.0 as u64)
                ^ self.hash_salt,
        );
        let idx = (h as usize) % cands.len();
        cands[idx]
    }
}

/// 确定性的 splitmix64 风格 mixing 函数。
fn mix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecmp_pick_is_deterministic_for_same_key() {
        let fib = Fib::new(42);
        let cands = [NodeId(1), NodeId(2), NodeId(3)];
        let a = fib.pick_ecmp(NodeId(0), NodeId(9), 7, &cands);
        let b = fib.pick_ecmp(NodeId(0), NodeId(9), 7, &cands);
        assert_eq!(a, b);
    }

    #[test]
    fn bfs_finds_ecmp_candidates_on_diamond() {
        // 0 -> {1,2} -> 3
        let adj = vec![vec![NodeId(1), NodeId(2)], vec![NodeId(3)], vec![NodeId(3)], vec![]];
        let rev_adj = vec![vec![], vec![NodeId(0)], vec![NodeId(0)], vec![NodeId(1), NodeId(2)]];
        let mut fib = Fib::new(0);
        fib.ensure_built(&adj, &rev_adj);
        let cands = fib.next_hops(NodeId(0), NodeId(3)).unwrap();
        assert_eq!(cands.len(), 2);
    }
}

//! 复合优先级队列
//!
//! 两个子队列：HI（header/ACK/NACK/PULL）与 LO（data）。两者都非空时按
//! `ratio_hi : ratio_lo` 的加权轮转决定服务谁；只有一个非空就服务它。LO
//! 入队时如果 LO 已满：
//! - 到达包的 `path_len` 小于 `max_path_len_queued`：trim（剥离成 header）一个
//!   `path_len` 更大的排队包，让到达的数据包入队。
//! - `path_len` 等于排队中最长且一次公平掷硬币判定要丢：trim 一个
//!   `path_len - 1` 或更大的包。
//! - 否则：剥离到达包本身，塞进 HI（HI 有空间的话；否则丢弃）。
//! 被 trim 的包变成 header-only，保留路由，进入 HI。用直方图
//! `path_len -> count` 懒惰地维护 `max_path_len_queued`。

use std::collections::{HashMap, VecDeque};

use crate::net::Packet;

use super::QueueDiscipline;

pub struct CompositePriorityQueue {
    hi: VecDeque<Packet>,
    lo: VecDeque<Packet>,
    hi_bytes: u64,
    lo_bytes: u64,
    hi_max_bytes: u64,
    lo_max_bytes: u64,
    ratio_hi: u32,
    ratio_lo: u32,
    served_in_round_hi: u32,
    served_in_round_lo: u32,
    path_len_histogram: HashMap<u32, u32>,
    max_path_len_queued: u32,
    num_drops: u64,
    rng_state: u64,
}

impl CompositePriorityQueue {
    pub fn new(hi_max_bytes: u64, lo_max_bytes: u64, ratio_hi: u32, ratio_lo: u32, seed: u64) -> Self {
        Self {
            hi: VecDeque::new(),
            lo: VecDeque::new(),
            hi_bytes: 0,
            lo_bytes: 0,
            hi_max_bytes,
            lo_max_bytes,
            ratio_hi: ratio_hi.max(1),
            ratio_lo: ratio_lo.max(1),
            served_in_round_hi: 0,
            served_in_round_lo: 0,
            path_len_histogram: HashMap::new(),
            max_path_len_queued: 0,
            num_drops: 0,
            rng_state: seed,
        }
    }

    fn coin_flip(&mut self) -> bool {
        self.rng_state = self.rng_state.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = self.rng_state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        ((z ^ (z >> 27)) & 1) == 0
    }

    fn note_enqueued(&mut self, path_len: u32) {
        *self.path_len_histogram.entry(path_len).or_insert(0) += 1;
        self.max_path_len_queued = self.max_path_len_queued.max(path_len);
    }

    fn note_removed(&mut self, path_len: u32) {
        if let Some(count) = self.path_len_histogram.get_mut(&path_len) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.path_len_histogram.remove(&path_len);
            }
        }
        if path_len == self.max_path_len_queued {
            self.max_path_len_queued = self.path_len_histogram.keys().copied().max().unwrap_or(0);
        }
    }

    /// 在 LO 队列里找到第一个 `path_len >= min_path_len` 的包并 trim 它
    /// （剥离负载、移入 HI）。
    fn trim_one_with_path_len_at_least(&mut self, min_path_len: u32) -> bool {
        let Some(pos) = self.lo.iter().position(|p| p.path_len >= min_path_len) else {
            return false;
        };
        let mut victim = self.lo.remove(pos).expect("position was just found");
        self.lo_bytes = self.lo_bytes.saturating_sub(victim.size as u64);
        self.note_removed(victim.path_len);
        let before = victim.size;
        victim.strip_to_header();
        self.hi_bytes = self.hi_bytes.saturating_add(victim.size as u64).saturating_sub(before as u64);
        self.hi.push_back(victim);
        true
    }

    pub fn num_drops(&self) -> u64 {
        self.num_drops
    }
}

impl QueueDiscipline for CompositePriorityQueue {
    fn admit(&mut self, mut pkt: Packet, _queue_bytes_before: u64, _max_bytes: u64) -> Result<(), Packet> {
        if pkt.is_header {
            if self.hi_bytes.saturating_add(pkt.size as u64) > self.hi_max_bytes {
                self.num_drops += 1;
                return Err(pkt);
            }
            self.hi_bytes += pkt.size as u64;
            self.hi.push_back(pkt);
            return Ok(());
        }

        if self.lo_bytes.saturating_add(pkt.size as u64) <= self.lo_max_bytes {
            self.lo_bytes += pkt.size as u64;
            self.note_enqueued(pkt.path_len);
            self.lo.push_back(pkt);
            return Ok(());
        }

        if pkt.path_len < self.max_path_len_queued {
            if self.trim_one_with_path_len_at_least(pkt.path_len + 1) {
                self.lo_bytes += pkt.size as u64;
                self.note_enqueued(pkt.path_len);
                self.lo.push_back(pkt);
                return Ok(());
            }
        } else if pkt.path_len == self.max_path_len_queued && self.coin_flip() {
            if self.trim_one_with_path_len_at_least(pkt.path_len.saturating_sub(1)) {
                self.lo_bytes += pkt.size as u64;
                self.note_enqueued(pkt.path_len);
                self.lo.push_back(pkt);
                return Ok(());
            }
        }

        pkt.strip_to_header();
        if self.hi_bytes.saturating_add(pkt.size as u64) > self.hi_max_bytes {
            self.num_drops += 1;
            return Err(pkt);
        }
        self.hi_bytes += pkt.size as u64;
        self.hi.push_back(pkt);
        Ok(())
    }

    fn pop_next(&mut self) -> Option<Packet> {
        let serve_hi = match (self.hi.is_empty(), self.lo.is_empty()) {
            (true, true) => return None,
            (true, false) => false,
            (false, true) => true,
            (false, false) => {
                if self.served_in_round_hi < self.ratio_hi {
                    true
                } else if self.served_in_round_lo < self.ratio_lo {
                    false
                } else {
                    self.served_in_round_hi = 0;
                    self.served_in_round_lo = 0;
                    true
                }
            }
        };

        if serve_hi {
            self.served_in_round_hi += 1;
            let pkt = self.hi.pop_front()?;
            self.hi_bytes = self.hi_bytes.saturating_sub(pkt.size as u64);
            Some(pkt)
        } else {
            self.served_in_round_lo += 1;
            let pkt = self.lo.pop_front()?;
            self.lo_bytes = self.lo_bytes.saturating_sub(pkt.size as u64);
            self.note_removed(pkt.path_len);
            Some(pkt)
        }
    }

    fn len(&self) -> usize {
        self.hi.len() + self.lo.len()
    }

    fn bytes(&self) -> u64 {
        self.hi_bytes + self.lo_bytes
    }

    fn peek_next(&self) -> Option<&Packet> {
        self.hi.front().or_else(|| self.lo.front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{PacketKind, PacketPool, Route};

    fn lo_pkt(pool: &mut PacketPool, size: u32, path_len: u32) -> Packet {
        let mut pkt = pool.alloc(PacketKind::TcpData);
        pkt.size = size;
        pkt.path_len = path_len;
        pkt.set_route(Route::new(Vec::new()));
        pkt
    }

    #[test]
    fn trims_longer_path_to_admit_shorter_when_full() {
        let mut q = CompositePriorityQueue::new(9000, 1000, 1, 1, 5);
        let mut pool = PacketPool::default();
        q.admit(lo_pkt(&mut pool, 1000, 5), 0, 0).unwrap();
        let short = lo_pkt(&mut pool, 500, 1);
        assert!(q.admit(short, 0, 0).is_ok());
        assert_eq!(q.hi.len(), 1);
        assert!(q.hi.front().unwrap().is_header);
    }

    #[test]
    fn serves_only_nonempty_side() {
        let mut q = CompositePriorityQueue::new(9000, 9000, 1, 1, 1);
        let mut pool = PacketPool::default();
        q.admit(lo_pkt(&mut pool, 500, 0), 0, 0).unwrap();
        let served = q.pop_next().unwrap();
        assert_eq!(served.size, 500);
    }
}

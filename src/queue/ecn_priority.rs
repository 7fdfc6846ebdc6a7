//! ECN 优先级队列
//!
//! 两个类（HI、LO），各自独立的 `max_bytes` 和 `ecn_thresh`。准入在最后一个
//! 槽位上做概率性的 tie-break 以减少相位效应。当某个类*开始*服务时，如果
//! 该类当前 `queue_bytes > ecn_thresh`，在这次服务完成时给被发送的包打上
//! ECN-CE。

use std::collections::VecDeque;

use crate::net::{Flags, Packet, Priority};

use super::QueueDiscipline;

struct Class {
    q: VecDeque<Packet>,
    max_bytes: u64,
    bytes: u64,
    ecn_thresh: u64,
}

pub struct EcnPriorityQueue {
    hi: Class,
    lo: Class,
    num_drops: u64,
    rng_state: u64,
}

impl EcnPriorityQueue {
    pub fn new(hi_max_bytes: u64, lo_max_bytes: u64, hi_ecn_thresh: u64, lo_ecn_thresh: u64, seed: u64) -> Self {
        Self {
            hi: Class {
                q: VecDeque::new(),
                max_bytes: hi_max_bytes,
                bytes: 0,
                ecn_thresh: hi_ecn_thresh,
            },
            lo: Class {
                q: VecDeque::new(),
                max_bytes: lo_max_bytes,
                bytes: 0,
                ecn_thresh: lo_ecn_thresh,
            },
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

    pub fn num_drops(&self) -> u64 {
        self.num_drops
    }

    fn class_for(&mut self, prio: Priority) -> &mut Class {
        if prio == Priority::Hi {
            &mut self.hi
        } else {
            &mut self.lo
        }
    }
}

impl QueueDiscipline for EcnPriorityQueue {
    fn admit(&mut self, pkt: Packet, _queue_bytes_before: u64, _max_bytes: u64) -> Result<(), Packet> {
        let prio = pkt.kind.priority();
        let last_slot = {
            let class = self.class_for(prio);
            class.bytes.saturating_add(pkt.size as u64) == class.max_bytes
        };
        if last_slot && self.coin_flip() {
            self.num_drops += 1;
            return Err(pkt);
        }
        let class = self.class_for(prio);
        if class.bytes.saturating_add(pkt.size as u64) > class.max_bytes {
            self.num_drops += 1;
            return Err(pkt);
        }
        class.bytes += pkt.size as u64;
        class.q.push_back(pkt);
        Ok(())
    }

    fn pop_next(&mut self) -> Option<Packet> {
        for class in [&mut self.hi, &mut self.lo] {
            if let Some(mut pkt) = class.q.pop_front() {
                class.bytes = class.bytes.saturating_sub(pkt.size as u64);
                if class.bytes > class.ecn_thresh {
                    pkt.flags.insert(Flags::ECN_CE);
                }
                return Some(pkt);
            }
        }
        None
    }

    fn len(&self) -> usize {
        self.hi.q.len() + self.lo.q.len()
    }

    fn bytes(&self) -> u64 {
        self.hi.bytes + self.lo.bytes
    }

    fn peek_next(&self) -> Option<&Packet> {
        self.hi.q.front().or_else(|| self.lo.q.front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{PacketKind, PacketPool, Route};

    #[test]
    fn marks_ecn_when_class_above_threshold_on_service_start() {
        let mut q = EcnPriorityQueue::new(9000, 9000, 1000, 1000, 7);
        let mut pool = PacketPool::default();
        for _ in 0..3 {
            let mut pkt = pool.alloc(PacketKind::TcpData);
            pkt.size = 1000;
            pkt.set_route(Route::new(Vec::new()));
            q.admit(pkt, 0, 0).unwrap();
        }
        let served = q.pop_next().unwrap();
        assert!(served.flags.contains(Flags::ECN_CE));
    }
}

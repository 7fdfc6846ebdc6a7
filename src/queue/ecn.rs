//! ECN 队列
//!
//! 收到包时如果 `queue_bytes >= mark_threshold` 就在包的标志位里置
//! ECN-CE；其余行为与 FIFO drop-tail 相同。

use std::collections::VecDeque;

use crate::net::{Flags, Packet};

use super::QueueDiscipline;

pub struct EcnQueue {
    q: VecDeque<Packet>,
    mark_threshold: u64,
    num_drops: u64,
    num_marked: u64,
}

impl EcnQueue {
    pub fn new(mark_threshold: u64) -> Self {
        Self {
            q: VecDeque::new(),
            mark_threshold,
            num_drops: 0,
            num_marked: 0,
        }
    }

    pub fn num_marked(&self) -> u64 {
        self.num_marked
    }
    pub fn num_drops(&self) -> u64 {
        self.num_drops
    }
}

impl QueueDiscipline for EcnQueue {
    fn admit(&mut self, mut pkt: Packet, queue_bytes_before: u64, max_bytes: u64) -> Result<(), Packet> {
        if queue_bytes_before.saturating_add(pkt.size as u64) > max_bytes {
            self.num_drops += 1;
            return Err(pkt);
        }
        if queue_bytes_before >= self.mark_threshold {
            pkt.flags.insert(Flags::ECN_CE);
            self.num_marked += 1;
        }
        self.q.push_back(pkt);
        Ok(())
    }

    fn pop_next(&mut self) -> Option<Packet> {
        self.q.pop_front()
    }

    fn len(&self) -> usize {
        self.q.len()
    }

    fn bytes(&self) -> u64 {
        self.q.iter().map(|p| p.size as u64).sum()
    }

    fn peek_next(&self) -> Option<&Packet> {
        self.q.front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{PacketKind, PacketPool, Route};

    #[test]
    fn marks_ecn_ce_at_or_above_threshold() {
        let mut q = EcnQueue::new(5000);
        let mut pool = PacketPool::default();
        let mut pkt = pool.alloc(PacketKind::TcpData);
        pkt.size = 1500;
        pkt.set_route(Route::new(Vec::new()));
        q.admit(pkt, 5000, 9000).unwrap();
        assert_eq!(q.num_marked(), 1);
        let head = q.peek_next().unwrap();
        assert!(head.flags.contains(Flags::ECN_CE));
    }

    #[test]
    fn does_not_mark_below_threshold() {
        let mut q = EcnQueue::new(5000);
        let mut pool = PacketPool::default();
        let mut pkt = pool.alloc(PacketKind::TcpData);
        pkt.size = 1500;
        pkt.set_route(Route::new(Vec::new()));
        q.admit(pkt, 1000, 9000).unwrap();
        assert_eq!(q.num_marked(), 0);
    }
}

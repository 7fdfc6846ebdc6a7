//! FIFO / 基础 Queue（尾丢弃）
//!
//! 如果 `queue_bytes + size > max_bytes` 就丢弃并计数；否则入队。

use std::collections::VecDeque;

use crate::net::Packet;

use super::QueueDiscipline;

#[derive(Default)]
pub struct FifoQueue {
    q: VecDeque<Packet>,
    num_drops: u64,
}

impl FifoQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_drops(&self) -> u64 {
        self.num_drops
    }
}

impl QueueDiscipline for FifoQueue {
    fn admit(&mut self, pkt: Packet, queue_bytes_before: u64, max_bytes: u64) -> Result<(), Packet> {
        if queue_bytes_before.saturating_add(pkt.size as u64) > max_bytes {
            self.num_drops += 1;
            return Err(pkt);
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
    fn drops_when_over_capacity() {
        let mut q = FifoQueue::new();
        let mut pool = PacketPool::default();
        let mut pkt = pool.alloc(PacketKind::TcpData);
        pkt.size = 1500;
        pkt.set_route(Route::new(Vec::new()));
        assert!(q.admit(pkt, 9000, 9000).is_err());
        assert_eq!(q.num_drops(), 1);
    }
}

//! N 级优先级队列
//!
//! 两个或更多优先级类，各自有独立的 FIFO 和容量。准入时包的 `Priority`
//! 选中它的类；类满则丢弃。服务时总是从最高优先级的非空类里出队。

use std::collections::VecDeque;

use crate::net::{Packet, Priority};

use super::QueueDiscipline;

struct Class {
    q: VecDeque<Packet>,
    max_bytes: u64,
    bytes: u64,
}

impl Class {
    fn new(max_bytes: u64) -> Self {
        Self {
            q: VecDeque::new(),
            max_bytes,
            bytes: 0,
        }
    }
}

/// 类按 `Priority::Hi, Mid, Lo, None` 的顺序排列（索引 0 最先被服务）。
pub struct PriorityQueue {
    classes: Vec<Class>,
    num_drops: u64,
}

const CLASS_ORDER: [Priority; 4] = [Priority::Hi, Priority::Mid, Priority::Lo, Priority::None];

impl PriorityQueue {
    /// `max_bytes_per_class` 必须和 `CLASS_ORDER` 对齐（4 个元素：Hi/Mid/Lo/None）。
    pub fn new(max_bytes_per_class: [u64; 4]) -> Self {
        Self {
            classes: max_bytes_per_class.into_iter().map(Class::new).collect(),
            num_drops: 0,
        }
    }

    fn class_index(prio: Priority) -> usize {
        CLASS_ORDER.iter().position(|&p| p == prio).unwrap_or(3)
    }

    pub fn num_drops(&self) -> u64 {
        self.num_drops
    }
}

impl QueueDiscipline for PriorityQueue {
    fn admit(&mut self, pkt: Packet, _queue_bytes_before: u64, _max_bytes: u64) -> Result<(), Packet> {
        let idx = Self::class_index(pkt.kind.priority());
        let class = &mut self.classes[idx];
        if class.bytes.saturating_add(pkt.size as u64) > class.max_bytes {
            self.num_drops += 1;
            return Err(pkt);
        }
        class.bytes += pkt.size as u64;
        class.q.push_back(pkt);
        Ok(())
    }

    fn pop_next(&mut self) -> Option<Packet> {
        for class in &mut self.classes {
            if let Some(pkt) = class.q.pop_front() {
                class.bytes = class.bytes.saturating_sub(pkt.size as u64);
                return Some(pkt);
            }
        }
        None
    }

    fn len(&self) -> usize {
        self.classes.iter().map(|c| c.q.len()).sum()
    }

    fn bytes(&self) -> u64 {
        self.classes.iter().map(|c| c.bytes).sum()
    }

    fn peek_next(&self) -> Option<&Packet> {
        self.classes.iter().find_map(|c| c.q.front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{PacketKind, PacketPool, Route};

    #[test]
    fn hi_priority_drains_before_lo() {
        let mut q = PriorityQueue::new([9000, 9000, 9000, 9000]);
        let mut pool = PacketPool::default();

        let mut data = pool.alloc(PacketKind::TcpData);
        data.size = 1000;
        data.set_route(Route::new(Vec::new()));
        q.admit(data, 0, 0).unwrap();

        let mut ack = pool.alloc(PacketKind::TcpAck);
        ack.size = 40;
        ack.set_route(Route::new(Vec::new()));
        q.admit(ack, 0, 0).unwrap();

        let first = q.pop_next().unwrap();
        assert_eq!(first.kind, PacketKind::TcpAck);
    }
}

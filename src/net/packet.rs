//! 数据包模型
//!
//! `Packet` 是一个封闭的带标签变体（tagged variant），按 kind 分组的 free-list
//! 池摊薄分配开销。本文件同时承载 `Route`（共享的有序 sink 列表，可携带
//! 反向路由用于 `bounce`）与 `PacketFlow`（流标识）。

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use super::id::NodeId;

/// 包种类。TCP/DCTCP/MPTCP 的数据与 ACK 是一等公民；NDP/RoCE/HPCC/EQDS/STRACK
/// 之类的变体只作为不透明标签保留字符串化的"SWIFT"怪癖，本仓库不驱动它们的
/// 发送/接收逻辑。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    TcpData,
    TcpAck,
    DctcpData,
    DctcpAck,
    MptcpData,
    MptcpAck,
    EthPause,
    /// 超出本仓库驱动范围的包种类（NDP/RoCE/HPCC/EQDS/STRACK），标签是它们
    /// 在原始实现里的名字。
    Other(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    None,
    Lo,
    Mid,
    Hi,
}

impl PacketKind {
    pub fn priority(self) -> Priority {
        match self {
            PacketKind::TcpAck | PacketKind::DctcpAck | PacketKind::MptcpAck => Priority::Hi,
            PacketKind::EthPause => Priority::Hi,
            PacketKind::TcpData | PacketKind::DctcpData | PacketKind::MptcpData => Priority::Lo,
            PacketKind::Other(_) => Priority::Mid,
        }
    }

    /// 字符串表示；保留源码里 STRACK/STRACKACK 渲染为 "SWIFT"/"SWIFTACK" 的怪癖
    /// （冻结的接口行为，不是 bug）。
    pub fn label(self) -> &'static str {
        match self {
            PacketKind::TcpData => "TCP",
            PacketKind::TcpAck => "TCPACK",
            PacketKind::DctcpData => "DCTCP",
            PacketKind::DctcpAck => "DCTCPACK",
            PacketKind::MptcpData => "MPTCP",
            PacketKind::MptcpAck => "MPTCPACK",
            PacketKind::EthPause => "PAUSE",
            PacketKind::Other("STRACK") => "SWIFT",
            PacketKind::Other("STRACKACK") => "SWIFTACK",
            PacketKind::Other(tag) => tag,
        }
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// 包标志位（ECN-Echo/ECN-CE/SYN/ACK + 保留位）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(pub u8);

impl Flags {
    pub const ECN_ECHO: Flags = Flags(1 << 0);
    pub const ECN_CE: Flags = Flags(1 << 1);
    pub const SYN: Flags = Flags(1 << 2);
    pub const ACK: Flags = Flags(1 << 3);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }
    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// 数据包方向：最多发生一次 NONE→UP→DOWN 转换，永远不会在 DOWN 之后回到 UP。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    None,
    Up,
    Down,
}

impl Direction {
    fn assert_transition_allowed(self, next: Direction) {
        assert!(
            !(self == Direction::Down && next == Direction::Up),
            "packet direction cannot transition DOWN -> UP"
        );
    }
}

/// 路由：一个共享的、有序的 sink（`NodeId`）列表，可选携带反向路由供 `bounce` 使用。
/// 从传输层的角度看，构造完成后不可变。
#[derive(Clone)]
pub struct Route(Rc<RouteInner>);

struct RouteInner {
    hops: Vec<NodeId>,
    reverse: Option<Route>,
}

impl Route {
    pub fn new(hops: Vec<NodeId>) -> Route {
        Route(Rc::new(RouteInner { hops, reverse: None }))
    }

    /// 构造一对互为反向的路由（典型用法：TCP 正向数据路由 + 反向 ACK 路由）。
    pub fn with_reverse(forward: Vec<NodeId>, reverse: Vec<NodeId>) -> (Route, Route) {
        let rev = Route::new(reverse);
        let fwd = Route(Rc::new(RouteInner {
            hops: forward,
            reverse: Some(rev.clone()),
        }));
        (fwd, rev)
    }

    pub fn len(&self) -> usize {
        self.0.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.hops.is_empty()
    }

    pub fn hop(&self, index: usize) -> Option<NodeId> {
        self.0.hops.get(index).copied()
    }

    pub fn hops(&self) -> &[NodeId] {
        &self.0.hops
    }

    pub fn reverse_route(&self) -> Option<Route> {
        self.0.reverse.clone()
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.0.hops.iter()).finish()
    }
}

/// 流标识符 + 可选的流量日志引用。动态分配的 ID 位于
/// [`crate::sim::DYNAMIC_FLOW_ID_BASE`, ∞)，用户指定的 ID 位于其下的区间。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketFlow(pub u64);

/// 每种传输协议携带的简化载荷。
#[derive(Debug, Clone)]
pub enum TransportPayload {
    None,
    TcpData { seqno: u64, data_seqno: u64, ts: u64 },
    TcpAck { ackno: u64, data_ackno: u64, ts: u64 },
    DctcpData { seqno: u64, ts: u64 },
    DctcpAck { ackno: u64, ts: u64 },
    MptcpData { seqno: u64, data_seqno: u64, ts: u64 },
    MptcpAck { ackno: u64, data_ackno: u64, ts: u64 },
}

/// 默认 MTU；header-only 包使用 `HEADER_ONLY_BYTES`。
pub const DEFAULT_MTU_BYTES: u32 = 1500;
pub const HEADER_ONLY_BYTES: u32 = 64;

/// 网络数据包：一个封闭的带标签变体，由 [`PacketPool`] 按 kind 回收复用。
#[derive(Debug, Clone)]
pub struct Packet {
    pub id: u64,
    pub kind: PacketKind,
    pub flags: Flags,
    pub size: u32,
    pub flow_id: u64,
    pub route: Route,
    pub next_hop_index: usize,
    pub is_header: bool,
    pub bounced: bool,
    pub direction: Direction,
    pub path_id: u64,
    pub dst: NodeId,
    /// 数据包已经走过的跳数；trim/composite-priority 队列据此比较"路径长度"。
    /// 在分配时固定为 0，由转发路径上首个递增它的 sink（交换机在出向时）负责推进。
    pub path_len: u32,
    pub ref_count: u32,
    pub transport: TransportPayload,
}

impl Packet {
    fn fresh(kind: PacketKind) -> Packet {
        Packet {
            id: 0,
            kind,
            flags: Flags::default(),
            size: 0,
            flow_id: 0,
            route: Route::new(Vec::new()),
            next_hop_index: 0,
            is_header: false,
            bounced: false,
            direction: Direction::default(),
            path_id: 0,
            dst: NodeId(0),
            path_len: 0,
            ref_count: 1,
            transport: TransportPayload::None,
        }
    }

    /// 重置 flow/size/id，为复用做准备；不会动 route/position（那是 `set_route` 的事）。
    pub fn set_attrs(&mut self, flow_id: u64, size: u32, id: u64) {
        self.flow_id = flow_id;
        self.size = size;
        self.id = id;
    }

    /// 关联一条路由，并把位置复位到起点。
    pub fn set_route(&mut self, route: Route) {
        self.route = route;
        self.next_hop_index = 0;
    }

    pub fn set_route_full(&mut self, flow_id: u64, route: Route, size: u32, id: u64) {
        self.set_attrs(flow_id, size, id);
        self.set_route(route);
    }

    /// 若还有下一跳，推进位置并返回它；否则返回 `None`（包已到达路由终点）。
    pub fn send_on(&mut self) -> Option<NodeId> {
        if self.next_hop_index < self.route.len() {
            let hop = self.route.hop(self.next_hop_index);
            self.next_hop_index += 1;
            hop
        } else {
            None
        }
    }

    pub fn has_next(&self) -> bool {
        self.next_hop_index < self.route.len()
    }

    /// 反弹：沿路由的反向视图走，位置映射为 `route.len() - next_hop_index`；
    /// 强制变为 header-only。断言尚未被反弹过，且反向路由存在。
    pub fn bounce(&mut self) {
        assert!(!self.bounced, "Packet::bounce called on an already-bounced packet");
        let len = self.route.len();
        let mapped_index = len
            .checked_sub(self.next_hop_index)
            .expect("next_hop_index must not exceed route length when bouncing");
        let reverse = self
            .route
            .reverse_route()
            .expect("bounce requires the route to carry a reverse view");
        self.route = reverse;
        self.next_hop_index = mapped_index;
        self.is_header = true;
        self.bounced = true;
    }

    /// 撤销反弹效果：恢复大小，清除 header/bounced 标志，位置归零。
    pub fn unbounce(&mut self, new_size: u32) {
        self.size = new_size;
        self.is_header = false;
        self.bounced = false;
        self.next_hop_index = 0;
    }

    pub fn set_direction(&mut self, next: Direction) {
        self.direction.assert_transition_allowed(next);
        self.direction = next;
    }

    /// 把当前包变成 header-only（composite-priority 队列 trim 一个被挤出的
    /// 排队包时使用）：剥离负载，保留路由与流标识。
    pub fn strip_to_header(&mut self) {
        self.size = HEADER_ONLY_BYTES;
        self.is_header = true;
    }

    pub fn inc_ref(&mut self) {
        self.ref_count = self.ref_count.saturating_add(1);
    }
}

/// 每个 kind 一个 free-list 的数据包池。
#[derive(Default)]
pub struct PacketPool {
    free_by_kind: HashMap<PacketKind, Vec<Packet>>,
    data_packet_size: Cell<Option<u32>>,
    data_packet_size_locked: Cell<bool>,
}

impl PacketPool {
    /// `alloc(kind)`：复用一个已释放的实例（保留除 kind/ref_count 外的字段，
    /// 直到调用方显式地 `set_attrs`/`set_route` 覆盖它们——这是源码里的"warm
    /// reuse"行为，不是未初始化 bug），或者创建一个新的（`ref_count=1`）。
    pub fn alloc(&mut self, kind: PacketKind) -> Packet {
        if let Some(list) = self.free_by_kind.get_mut(&kind) {
            if let Some(mut pkt) = list.pop() {
                pkt.ref_count = 1;
                pkt.kind = kind;
                pkt.bounced = false;
                return pkt;
            }
        }
        Packet::fresh(kind)
    }

    pub fn inc_ref(pkt: &mut Packet) {
        pkt.inc_ref();
    }

    /// `dec_ref`/`free`：减少引用计数，归零时物归原池。
    pub fn dec_ref(&mut self, mut pkt: Packet) {
        assert!(pkt.ref_count > 0, "dec_ref on a packet with ref_count == 0");
        pkt.ref_count -= 1;
        if pkt.ref_count == 0 {
            self.free_by_kind.entry(pkt.kind).or_default().push(pkt);
        }
    }

    pub fn free(&mut self, pkt: Packet) {
        self.dec_ref(pkt);
    }

    /// 全局数据包大小；第一次读取后锁定，后续 `set_data_packet_size` 是编程错误。
    pub fn set_data_packet_size(&self, bytes: u32) {
        assert!(
            !self.data_packet_size_locked.get(),
            "Packet::data_packet_size cannot be reconfigured after first read"
        );
        self.data_packet_size.set(Some(bytes));
    }

    pub fn data_packet_size(&self) -> u32 {
        self.data_packet_size_locked.set(true);
        self.data_packet_size.get().unwrap_or(DEFAULT_MTU_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route_pair() -> (Route, Route) {
        Route::with_reverse(vec![NodeId(0), NodeId(1), NodeId(2)], vec![NodeId(2), NodeId(1), NodeId(0)])
    }

    #[test]
    fn bounce_then_unbounce_round_trips() {
        let (fwd, _rev) = route_pair();
        let mut pkt = Packet::fresh(PacketKind::TcpData);
        pkt.set_route(fwd);
        pkt.send_on();
        pkt.send_on();
        pkt.bounce();
        assert!(pkt.is_header);
        assert!(pkt.bounced);
        pkt.unbounce(1460);
        assert!(!pkt.is_header);
        assert_eq!(pkt.next_hop_index, 0);
        assert_eq!(pkt.size, 1460);
    }

    #[test]
    #[should_panic(expected = "already-bounced")]
    fn double_bounce_panics() {
        let (fwd, _rev) = route_pair();
        let mut pkt = Packet::fresh(PacketKind::TcpData);
        pkt.set_route(fwd);
        pkt.bounce();
        pkt.bounce();
    }

    #[test]
    #[should_panic(expected = "DOWN -> UP")]
    fn direction_cannot_go_up_after_down() {
        let mut pkt = Packet::fresh(PacketKind::TcpData);
        pkt.set_direction(Direction::Up);
        pkt.set_direction(Direction::Down);
        pkt.set_direction(Direction::Up);
    }

    #[test]
    fn pool_reuses_freed_packet_of_same_kind() {
        let mut pool = PacketPool::default();
        let pkt = pool.alloc(PacketKind::TcpData);
        let id_before = pkt as *const _ as usize as u64; // irrelevant, just to use pkt
        let _ = id_before;
        pool.free(pkt);
        let pkt2 = pool.alloc(PacketKind::TcpData);
        assert_eq!(pkt2.ref_count, 1);
    }

    #[test]
    fn strack_renders_as_swift() {
        assert_eq!(PacketKind::Other("STRACK").label(), "SWIFT");
        assert_eq!(PacketKind::Other("STRACKACK").label(), "SWIFTACK");
    }

    #[test]
    #[should_panic(expected = "cannot be reconfigured")]
    fn data_packet_size_locks_after_first_read() {
        let pool = PacketPool::default();
        pool.set_data_packet_size(1000);
        assert_eq!(pool.data_packet_size(), 1000);
        pool.set_data_packet_size(1400);
    }
}

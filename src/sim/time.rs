//! 仿真时间：皮秒精度的 `SimTime`
//!
//! 整个仿真核心只使用一种时间单位——皮秒（picosecond, 1e-12s）。这与原始
//! htsim 实现（`simtime_picosec`）保持一致，避免了纳秒/毫秒混用导致的取整误差，
//! 尤其是在 RTO 抖动、链路 drain time 这类对精度敏感的计算里。

use std::time::Duration;

/// 皮秒级仿真时刻/时长。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SimTime(pub u64);

const PS_PER_NS: u64 = 1_000;
const PS_PER_US: u64 = 1_000_000;
const PS_PER_MS: u64 = 1_000_000_000;
const PS_PER_S: u64 = 1_000_000_000_000;

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);
    /// 表示"永不超时"的哨兵值，对应 TCP sender 的 `rto_deadline == ∞`。
    pub const INFINITY: SimTime = SimTime(u64::MAX);

    pub const fn from_ps(ps: u64) -> Self {
        SimTime(ps)
    }

    pub const fn from_nanos(ns: u64) -> Self {
        SimTime(ns.saturating_mul(PS_PER_NS))
    }

    pub const fn from_micros(us: u64) -> Self {
        SimTime(us.saturating_mul(PS_PER_US))
    }

    pub const fn from_millis(ms: u64) -> Self {
        SimTime(ms.saturating_mul(PS_PER_MS))
    }

    pub const fn from_secs(s: u64) -> Self {
        SimTime(s.saturating_mul(PS_PER_S))
    }

    pub fn from_secs_f64(s: f64) -> Self {
        SimTime((s * PS_PER_S as f64).round() as u64)
    }

    pub const fn as_ps(self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / PS_PER_S as f64
    }

    pub fn as_millis_f64(self) -> f64 {
        self.0 as f64 / PS_PER_MS as f64
    }

    pub const fn is_infinite(self) -> bool {
        self.0 == u64::MAX
    }

    pub fn saturating_add(self, rhs: SimTime) -> SimTime {
        SimTime(self.0.saturating_add(rhs.0))
    }

    pub fn saturating_sub(self, rhs: SimTime) -> SimTime {
        SimTime(self.0.saturating_sub(rhs.0))
    }

    pub fn checked_sub(self, rhs: SimTime) -> Option<SimTime> {
        self.0.checked_sub(rhs.0).map(SimTime)
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;
    fn add(self, rhs: SimTime) -> SimTime {
        self.saturating_add(rhs)
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;
    fn sub(self, rhs: SimTime) -> SimTime {
        self.saturating_sub(rhs)
    }
}

impl From<SimTime> for Duration {
    fn from(t: SimTime) -> Duration {
        Duration::from_nanos(t.0 / PS_PER_NS)
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_infinite() {
            write!(f, "+inf")
        } else {
            write!(f, "{:.3}ms", self.as_millis_f64())
        }
    }
}

/// 由带宽（bit/s）与报文字节数计算发送/drain 所需的时间（皮秒）。
///
/// `ceil(bytes * 8 * 1e12 / bitrate_bps)`，用 u128 避免中间值溢出。
pub fn drain_time(size_bytes: u32, bitrate_bps: u64) -> SimTime {
    if bitrate_bps == 0 {
        return SimTime::INFINITY;
    }
    let bits = (size_bytes as u128) * 8;
    let ps = bits * (PS_PER_S as u128);
    let bitrate = bitrate_bps as u128;
    let ps = ps.div_ceil(bitrate);
    SimTime(ps.min(u64::MAX as u128) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_round_trip() {
        assert_eq!(SimTime::from_millis(1).as_ps(), PS_PER_MS);
        assert_eq!(SimTime::from_secs(1), SimTime::from_millis(1000));
        assert_eq!(SimTime::from_micros(1000), SimTime::from_millis(1));
    }

    #[test]
    fn drain_time_matches_testable_property_4() {
        // 1500B over a 1 Gbps link: 1500*8 / 1e9 s = 12us.
        let t = drain_time(1500, 1_000_000_000);
        assert_eq!(t, SimTime::from_micros(12));
    }

    #[test]
    fn infinity_never_elapses() {
        let inf = SimTime::INFINITY;
        assert!(inf.is_infinite());
        assert!(SimTime::from_secs(1000) < inf);
    }
}

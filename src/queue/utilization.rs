//! 滑动窗口忙时利用率跟踪器
//!
//! 喂给自适应路由用的 `average_utilization()` 与量化到 2 bit 的
//! `quantized_utilization()`/`quantized_queuesize()`。跟踪器只关心"这段时间
//! 里有多少比例在忙"，不关心具体服务了哪些包。

use crate::sim::SimTime;

#[derive(Debug, Clone, Copy)]
pub struct UtilizationTracker {
    window: SimTime,
    window_start: SimTime,
    busy_ps_in_window: u64,
    busy_since: Option<SimTime>,
}

impl UtilizationTracker {
    pub fn new(window: SimTime) -> Self {
        Self {
            window,
            window_start: SimTime::ZERO,
            busy_ps_in_window: 0,
            busy_since: None,
        }
    }

    fn roll_window(&mut self, now: SimTime) {
        if now.saturating_sub(self.window_start) >= self.window {
            self.window_start = now;
            self.busy_ps_in_window = 0;
        }
    }

    pub fn on_service_start(&mut self, now: SimTime) {
        self.roll_window(now);
        self.busy_since = Some(now);
    }

    pub fn on_service_end(&mut self, now: SimTime) {
        self.roll_window(now);
        if let Some(start) = self.busy_since.take() {
            let elapsed = now.saturating_sub(start.max(self.window_start));
            self.busy_ps_in_window = self.busy_ps_in_window.saturating_add(elapsed.as_ps());
        }
    }

    /// 0.0（完全空闲）到 1.0（持续忙碌）的窗口内平均利用率。
    pub fn average_utilization(&self, now: SimTime) -> f64 {
        let elapsed = now.saturating_sub(self.window_start).as_ps().max(1);
        let busy = if let Some(start) = self.busy_since {
            self.busy_ps_in_window + now.saturating_sub(start.max(self.window_start)).as_ps()
        } else {
            self.busy_ps_in_window
        };
        (busy as f64 / elapsed as f64).min(1.0)
    }

    /// 把利用率量化到 2 bit（4 档）：0=<25%, 1=<50%, 2=<75%, 3=>=75%。
    pub fn quantized_utilization(&self, now: SimTime) -> u8 {
        quantize_fraction(self.average_utilization(now))
    }
}

pub fn quantize_fraction(frac: f64) -> u8 {
    if frac >= 0.75 {
        3
    } else if frac >= 0.5 {
        2
    } else if frac >= 0.25 {
        1
    } else {
        0
    }
}

pub fn quantized_queuesize(queue_bytes: u64, max_bytes: u64) -> u8 {
    if max_bytes == 0 {
        return 0;
    }
    quantize_fraction(queue_bytes as f64 / max_bytes as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fully_idle_window_has_zero_utilization() {
        let tracker = UtilizationTracker::new(SimTime::from_millis(1));
        assert_eq!(tracker.quantized_utilization(SimTime::from_millis(1)), 0);
    }

    #[test]
    fn continuously_busy_window_saturates() {
        let mut tracker = UtilizationTracker::new(SimTime::from_millis(1));
        tracker.on_service_start(SimTime::ZERO);
        let now = SimTime::from_micros(900);
        assert!(tracker.average_utilization(now) > 0.75);
    }

    #[test]
    fn queuesize_quantization_buckets() {
        assert_eq!(quantized_queuesize(10, 100), 0);
        assert_eq!(quantized_queuesize(30, 100), 1);
        assert_eq!(quantized_queuesize(60, 100), 2);
        assert_eq!(quantized_queuesize(90, 100), 3);
    }
}

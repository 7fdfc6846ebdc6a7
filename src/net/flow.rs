//! 流标识与日志钩子
//!
//! 一个 flow 只是一个稳定的数字身份；把字节/包的进度记到哪里是可选的，
//! 由 `FlowLogger` 决定（测试里常用一个把事件攒进 `Vec` 的哈希实现）。

use super::packet::PacketFlow;

/// 流相关的可观测事件。现阶段只覆盖终点交付与丢弃，其余统计（RTT 采样、
/// 拥塞窗口轨迹）留给 `proto::tcp`/`proto::dctcp` 自己的 trace 埋点。
#[derive(Debug, Clone, Copy)]
pub enum FlowEvent {
    Delivered { bytes: u32 },
    Dropped { bytes: u32 },
}

/// 可插拔的流量记录器：`Network` 在交付/丢弃数据包时调用它。
pub trait FlowLogger {
    fn log(&mut self, flow: PacketFlow, event: FlowEvent);
}

/// 默认空实现：不记录任何东西。
#[derive(Debug, Default)]
pub struct NullFlowLogger;

impl FlowLogger for NullFlowLogger {
    fn log(&mut self, _flow: PacketFlow, _event: FlowEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingLogger(Vec<(u64, u32, bool)>);
    impl FlowLogger for RecordingLogger {
        fn log(&mut self, flow: PacketFlow, event: FlowEvent) {
            match event {
                FlowEvent::Delivered { bytes } => self.0.push((flow.0, bytes, true)),
                FlowEvent::Dropped { bytes } => self.0.push((flow.0, bytes, false)),
            }
        }
    }

    #[test]
    fn recording_logger_captures_events_in_order() {
        let mut log = RecordingLogger::default();
        log.log(PacketFlow(1), FlowEvent::Delivered { bytes: 1500 });
        log.log(PacketFlow(1), FlowEvent::Dropped { bytes: 1500 });
        assert_eq!(log.0, vec![(1, 1500, true), (1, 1500, false)]);
    }
}

use crate::core::{DecoderState, Packet, PlaybackClock, StreamConfig, StreamType, SubmitStatus};
use crate::player::transfer_pump::DecoderSink;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Default)]
struct StreamSlot {
    config: Option<StreamConfig>,
    /// 已接收但尚未到播放时刻的数据包 DTS
    in_flight: VecDeque<Duration>,
    submitted: u64,
    eos: bool,
}

struct DecoderInner {
    state: DecoderState,
    streams: [StreamSlot; StreamType::COUNT],
}

/// 进程内模拟解码器
///
/// - 未启动前返回 `NotPrepared`
/// - 每个流最多缓存 `capacity` 个未播放的数据包，超出返回 `Full`
/// - 时钟由 `PlaybackClock` 按墙上时间推进，到达 DTS 的数据包视为已播放
pub struct SimulatedDecoder {
    capacity: usize,
    clock: PlaybackClock,
    inner: Mutex<DecoderInner>,
}

impl SimulatedDecoder {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            clock: PlaybackClock::new(),
            inner: Mutex::new(DecoderInner {
                state: DecoderState::Idle,
                streams: Default::default(),
            }),
        }
    }

    /// 已接收的数据包数
    pub fn submitted(&self, stream: StreamType) -> u64 {
        self.inner.lock().streams[stream.index()].submitted
    }

    pub fn is_eos(&self, stream: StreamType) -> bool {
        self.inner.lock().streams[stream.index()].eos
    }

    pub fn in_flight(&self, stream: StreamType) -> usize {
        self.inner.lock().streams[stream.index()].in_flight.len()
    }

    fn render_until(slot: &mut StreamSlot, clock: Option<Duration>) {
        let Some(clock) = clock else {
            return;
        };
        while slot.in_flight.front().map_or(false, |&dts| dts <= clock) {
            slot.in_flight.pop_front();
        }
    }
}

impl DecoderSink for SimulatedDecoder {
    fn submit_packet(&self, packet: &Packet) -> SubmitStatus {
        if !packet.contains_data() || packet.is_encrypted() {
            warn!("{}: 模拟解码器只接受明文数据包", packet.stream);
            return SubmitStatus::InvalidPacket;
        }

        let clock = self.clock.now();
        let mut inner = self.inner.lock();
        if inner.state == DecoderState::Idle {
            return SubmitStatus::NotPrepared;
        }

        let slot = &mut inner.streams[packet.stream.index()];
        if slot.config.is_none() {
            return SubmitStatus::NotPrepared;
        }
        Self::render_until(slot, clock);
        if slot.in_flight.len() >= self.capacity {
            return SubmitStatus::Full;
        }

        slot.in_flight.push_back(packet.dts);
        slot.submitted += 1;
        debug!("{}: 接收数据包 DTS {:?}", packet.stream, packet.dts);
        SubmitStatus::Success
    }

    fn submit_eos(&self, stream: StreamType) -> SubmitStatus {
        let mut inner = self.inner.lock();
        if inner.state == DecoderState::Idle {
            return SubmitStatus::NotPrepared;
        }
        inner.streams[stream.index()].eos = true;
        info!("{}: 模拟解码器收到 EOS", stream);
        SubmitStatus::Success
    }

    fn read_clock(&self) -> Option<Duration> {
        self.clock.now()
    }

    fn set_stream_config(&self, config: &StreamConfig) -> bool {
        let stream = config.stream_type();
        let mut inner = self.inner.lock();
        let slot = &mut inner.streams[stream.index()];
        info!("{}: 设置流配置 {:?}", stream, config);
        slot.config = Some(config.clone());
        slot.in_flight.clear();
        true
    }

    fn start(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != DecoderState::Idle {
            return false;
        }
        inner.state = DecoderState::Playing;
        self.clock.play();
        info!("▶ 模拟解码器启动");
        true
    }

    fn pause(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != DecoderState::Playing {
            return false;
        }
        inner.state = DecoderState::Paused;
        self.clock.pause();
        info!("⏸ 模拟解码器暂停");
        true
    }

    fn resume(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != DecoderState::Paused {
            return false;
        }
        inner.state = DecoderState::Playing;
        self.clock.play();
        info!("▶ 模拟解码器恢复");
        true
    }

    fn stop(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.state = DecoderState::Idle;
        for slot in inner.streams.iter_mut() {
            slot.in_flight.clear();
            slot.eos = false;
        }
        self.clock.reset();
        info!("🛑 模拟解码器停止");
        true
    }

    fn seek(&self, position: Duration) -> bool {
        let mut inner = self.inner.lock();
        for slot in inner.streams.iter_mut() {
            slot.in_flight.clear();
            slot.eos = false;
        }
        self.clock.set_time(position);
        info!("⏩ 模拟解码器 Seek 到 {:?}", position);
        true
    }

    fn state(&self) -> DecoderState {
        self.inner.lock().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_config() -> StreamConfig {
        StreamConfig::Audio {
            codec: "aac".to_string(),
            sample_rate: 44_100,
            channels: 2,
            bitrate: 128_000,
        }
    }

    fn packet(ms: u64) -> Packet {
        Packet::data(StreamType::Audio, Duration::from_millis(ms), vec![0; 16])
    }

    #[test]
    fn test_not_prepared_until_started() {
        let decoder = SimulatedDecoder::new(4);
        decoder.set_stream_config(&audio_config());
        assert_eq!(decoder.submit_packet(&packet(0)), SubmitStatus::NotPrepared);
        assert_eq!(decoder.read_clock(), None);

        assert!(decoder.start());
        assert_eq!(decoder.submit_packet(&packet(0)), SubmitStatus::Success);
        assert!(decoder.read_clock().is_some());
    }

    #[test]
    fn test_full_when_capacity_reached() {
        let decoder = SimulatedDecoder::new(2);
        decoder.set_stream_config(&audio_config());
        decoder.start();
        decoder.pause();

        // 暂停时时钟停在 0 附近，远期数据包不会被消耗
        assert_eq!(decoder.submit_packet(&packet(10_000)), SubmitStatus::Success);
        assert_eq!(decoder.submit_packet(&packet(10_020)), SubmitStatus::Success);
        assert_eq!(decoder.submit_packet(&packet(10_040)), SubmitStatus::Full);
        assert_eq!(decoder.submitted(StreamType::Audio), 2);

        decoder.seek(Duration::from_secs(20));
        decoder.resume();
        // Seek 丢弃了已排队的数据包
        assert_eq!(decoder.in_flight(StreamType::Audio), 0);
        assert_eq!(decoder.submit_packet(&packet(20_500)), SubmitStatus::Success);
        assert_eq!(decoder.in_flight(StreamType::Audio), 1);
        assert_eq!(decoder.submitted(StreamType::Audio), 3);
    }

    #[test]
    fn test_unconfigured_stream_not_prepared() {
        let decoder = SimulatedDecoder::new(4);
        decoder.start();
        let video = Packet::key_frame(StreamType::Video, Duration::ZERO, vec![0]);
        assert_eq!(decoder.submit_packet(&video), SubmitStatus::NotPrepared);
        assert_eq!(decoder.submit_eos(StreamType::Video), SubmitStatus::Success);
        assert!(decoder.is_eos(StreamType::Video));
    }

    #[test]
    fn test_pause_resume_state() {
        let decoder = SimulatedDecoder::new(4);
        assert!(!decoder.pause());
        decoder.start();
        assert!(decoder.pause());
        assert_eq!(decoder.state(), DecoderState::Paused);
        assert!(decoder.resume());
        assert_eq!(decoder.state(), DecoderState::Playing);
        decoder.stop();
        assert_eq!(decoder.state(), DecoderState::Idle);
        assert_eq!(decoder.read_clock(), None);
    }
}

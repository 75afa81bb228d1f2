use crate::core::{
    BufferReport, CancelToken, DataEvent, DataRequest, EventBus, Packet, PipelineConfig, Result,
    StreamType,
};
use crate::player::job_channel::{Job, JobPriority, JobSender, PriorityJobChannel};
use crate::player::stream_buffer::{BufferGauge, StreamBuffer};
use crossbeam_channel::{after, bounded, select, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 缓冲聚合器任务
pub enum AggregatorJob {
    PacketIn { stream: StreamType, dts: Duration, eos: bool },
    PacketOut { stream: StreamType, dts: Duration },
    /// 重置所有缓冲；`done` 在重置完成后被丢弃（等待方据此返回）
    Reset { flush: bool, done: Option<Sender<()>> },
    /// 设置最大缓冲时长，首次设置时创建流缓冲
    SetBufferConfig { stream: StreamType, max_duration: Duration },
    SetAllowedEvents(DataEvent),
    SetReportMode { stream: StreamType, report_full: bool },
    PeriodicTick,
}

impl Job for AggregatorJob {
    fn priority(&self) -> JobPriority {
        match self {
            // 重置与数据包进出按提交顺序执行
            AggregatorJob::PacketIn { .. }
            | AggregatorJob::PacketOut { .. }
            | AggregatorJob::Reset { .. } => JobPriority::Normal,
            _ => JobPriority::High,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            AggregatorJob::PacketIn { .. } => "PacketIn",
            AggregatorJob::PacketOut { .. } => "PacketOut",
            AggregatorJob::Reset { .. } => "Reset",
            AggregatorJob::SetBufferConfig { .. } => "SetBufferConfig",
            AggregatorJob::SetAllowedEvents(_) => "SetAllowedEvents",
            AggregatorJob::SetReportMode { .. } => "SetReportMode",
            AggregatorJob::PeriodicTick => "PeriodicTick",
        }
    }
}

/// 已见数据包
struct ObservedPacket {
    seen_at: Instant,
    consumed: bool,
}

type Gauges = Arc<Mutex<[Option<BufferGauge>; StreamType::COUNT]>>;
type Reports = Arc<Mutex<[Option<BufferReport>; StreamType::COUNT]>>;

/// 聚合器内部状态（仅在任务通道线程上访问）
struct AggregatorState {
    buffers: [Option<StreamBuffer>; StreamType::COUNT],
    observed: HashMap<(StreamType, Duration), ObservedPacket>,
    allowed: DataEvent,
    buffering: bool,
    data_request_threshold: Duration,
    discontinuity_threshold: Duration,
    observed_ttl: Duration,
    data_requests: EventBus<DataRequest>,
    buffering_bus: EventBus<bool>,
    gauges: Gauges,
    reports: Reports,
}

impl AggregatorState {
    fn handle(&mut self, job: AggregatorJob) {
        match job {
            AggregatorJob::PacketIn { stream, dts, eos } => self.packet_in(stream, dts, eos),
            AggregatorJob::PacketOut { stream, dts } => self.packet_out(stream, dts),
            AggregatorJob::Reset { flush, done } => {
                self.reset(flush);
                drop(done);
            }
            AggregatorJob::SetBufferConfig { stream, max_duration } => {
                self.set_buffer_config(stream, max_duration)
            }
            AggregatorJob::SetAllowedEvents(events) => {
                info!("允许的缓冲事件: {} -> {}", self.allowed, events);
                self.allowed = events;
            }
            AggregatorJob::SetReportMode { stream, report_full } => match self.buffer(stream) {
                Some(buffer) if report_full => buffer.report_full_buffer(),
                Some(buffer) => buffer.report_actual_buffer(),
                None => warn!("{}: 流缓冲未初始化，忽略报告模式切换", stream),
            },
            AggregatorJob::PeriodicTick => self.tick(Instant::now()),
        }
    }

    fn buffer(&mut self, stream: StreamType) -> Option<&mut StreamBuffer> {
        self.buffers[stream.index()].as_mut()
    }

    fn packet_in(&mut self, stream: StreamType, dts: Duration, eos: bool) {
        let Some(buffer) = self.buffers[stream.index()].as_mut() else {
            warn!("{}: 流缓冲未初始化，丢弃 PacketIn {:?}", stream, dts);
            return;
        };

        if eos {
            buffer.mark_eos();
            return;
        }

        if self.observed.contains_key(&(stream, dts)) {
            debug!("{}: 重复数据包 {:?}，忽略", stream, dts);
            return;
        }
        self.observed.insert(
            (stream, dts),
            ObservedPacket {
                seen_at: Instant::now(),
                consumed: false,
            },
        );
        buffer.data_in(dts);
    }

    fn packet_out(&mut self, stream: StreamType, dts: Duration) {
        let Some(buffer) = self.buffers[stream.index()].as_mut() else {
            warn!("{}: 流缓冲未初始化，丢弃 PacketOut {:?}", stream, dts);
            return;
        };

        match self.observed.get_mut(&(stream, dts)) {
            Some(packet) if !packet.consumed => {
                packet.consumed = true;
                buffer.data_out(dts);
            }
            Some(_) => debug!("{}: 数据包 {:?} 已送出，忽略", stream, dts),
            None => debug!("{}: 未登记的数据包 {:?}，忽略 PacketOut", stream, dts),
        }
    }

    fn reset(&mut self, flush: bool) {
        for buffer in self.buffers.iter_mut().flatten() {
            buffer.reset(flush);
        }
        self.observed.clear();
        self.refresh_reports();
    }

    fn set_buffer_config(&mut self, stream: StreamType, max_duration: Duration) {
        match self.buffers[stream.index()].as_mut() {
            Some(buffer) => buffer.update_max_duration(max_duration),
            None => {
                let buffer = StreamBuffer::new(stream, max_duration, self.discontinuity_threshold);
                self.gauges.lock()[stream.index()] = Some(buffer.gauge());
                self.buffers[stream.index()] = Some(buffer);
            }
        }
        self.refresh_reports();
    }

    fn refresh_reports(&self) {
        let mut reports = self.reports.lock();
        for (slot, buffer) in reports.iter_mut().zip(self.buffers.iter()) {
            *slot = buffer.as_ref().map(StreamBuffer::report);
        }
    }

    fn tick(&mut self, now: Instant) {
        let ttl = self.observed_ttl;
        // 未送出的数据包保留到重置，避免暂停期间丢失登记
        self.observed.retain(|_, packet| {
            !packet.consumed || now.saturating_duration_since(packet.seen_at) < ttl
        });
        self.refresh_reports();

        if self.allowed.allows(DataEvent::DATA_REQUEST) {
            for request in self.pending_requests() {
                self.data_requests.publish(request);
            }
        }

        if self.allowed.allows(DataEvent::BUFFERING) {
            let buffering = self
                .buffers
                .iter()
                .flatten()
                .any(StreamBuffer::is_buffer_empty);
            if buffering != self.buffering {
                info!("缓冲状态: {}", if buffering { "开始缓冲" } else { "缓冲结束" });
                self.buffering = buffering;
                self.buffering_bus.publish(buffering);
            }
        }
    }

    /// 需要补充数据的流
    fn pending_requests(&self) -> Vec<DataRequest> {
        self.buffers
            .iter()
            .flatten()
            .filter(|buffer| !buffer.is_data_complete())
            .filter_map(|buffer| {
                let state = buffer.data_request();
                let buffered = buffer.gauge().buffered();
                if state.requested_duration.is_zero() || buffered >= self.data_request_threshold {
                    return None;
                }
                Some(DataRequest {
                    stream: buffer.stream(),
                    requested_duration: state.requested_duration,
                    max_duration: buffer.max_duration(),
                })
            })
            .collect()
    }
}

/// 数据包进出通知端（可克隆，供生产者和传输线程使用）
#[derive(Clone)]
pub struct BufferFeed {
    sender: JobSender<AggregatorJob>,
}

impl BufferFeed {
    /// 数据包进入管线（EOS 记录结束位置，配置包不计时）
    pub fn packet_in(&self, packet: &Packet) -> Result<()> {
        if !packet.contains_data() && !packet.is_eos() {
            return Ok(());
        }
        self.sender.send(AggregatorJob::PacketIn {
            stream: packet.stream,
            dts: packet.dts,
            eos: packet.is_eos(),
        })
    }

    /// 数据包已提交到解码器
    pub fn packet_out(&self, packet: &Packet) -> Result<()> {
        if !packet.contains_data() {
            return Ok(());
        }
        self.sender.send(AggregatorJob::PacketOut {
            stream: packet.stream,
            dts: packet.dts,
        })
    }
}

/// 缓冲聚合器
///
/// 所有流缓冲的状态只在任务通道线程上修改；周期任务由独立的
/// 定时线程投递，`SetAllowedEvents` 会提前唤醒定时线程。
pub struct BufferAggregator {
    channel: PriorityJobChannel<AggregatorJob>,
    buffer_duration: Duration,
    ticker: Option<JoinHandle<()>>,
    ticker_token: CancelToken,
    wake_tx: Sender<()>,
    data_requests: EventBus<DataRequest>,
    buffering: EventBus<bool>,
    gauges: Gauges,
    reports: Reports,
}

impl BufferAggregator {
    pub fn new(config: &PipelineConfig) -> Self {
        let data_requests = EventBus::new();
        let buffering = EventBus::new();
        let gauges: Gauges = Arc::new(Mutex::new([None, None]));
        let reports: Reports = Arc::new(Mutex::new([None, None]));

        let mut state = AggregatorState {
            buffers: [None, None],
            observed: HashMap::new(),
            allowed: DataEvent::NONE,
            buffering: false,
            data_request_threshold: config.data_request_threshold(),
            discontinuity_threshold: config.discontinuity_threshold(),
            observed_ttl: config.observed_packet_ttl(),
            data_requests: data_requests.clone(),
            buffering_bus: buffering.clone(),
            gauges: Arc::clone(&gauges),
            reports: Arc::clone(&reports),
        };
        let channel = PriorityJobChannel::start("buffer-aggregator", move |job: AggregatorJob| {
            state.handle(job)
        });

        let (wake_tx, wake_rx) = bounded::<()>(1);
        let ticker_token = CancelToken::new();
        let ticker = {
            let sender = channel.sender();
            let token = ticker_token.clone();
            let interval = config.publish_interval();
            thread::spawn(move || Self::ticker_loop(sender, wake_rx, token, interval))
        };

        Self {
            channel,
            buffer_duration: config.buffer_duration(),
            ticker: Some(ticker),
            ticker_token,
            wake_tx,
            data_requests,
            buffering,
            gauges,
            reports,
        }
    }

    fn ticker_loop(
        sender: JobSender<AggregatorJob>,
        wake_rx: Receiver<()>,
        token: CancelToken,
        interval: Duration,
    ) {
        info!("{} ⏱ 缓冲统计定时线程启动 (周期 {:?})", log_ctx(), interval);
        loop {
            select! {
                recv(token.signal()) -> _ => break,
                recv(wake_rx) -> msg => {
                    if msg.is_err() {
                        break;
                    }
                }
                recv(after(interval)) -> _ => {}
            }
            if sender.send(AggregatorJob::PeriodicTick).is_err() {
                break;
            }
        }
        info!("{} 🛑 缓冲统计定时线程退出", log_ctx());
    }

    /// 以默认缓冲时长创建流缓冲
    pub fn initialize_stream(&self, stream: StreamType) -> Result<()> {
        self.set_buffer_config(stream, self.buffer_duration)
    }

    pub fn set_buffer_config(&self, stream: StreamType, max_duration: Duration) -> Result<()> {
        self.channel
            .enqueue(AggregatorJob::SetBufferConfig { stream, max_duration })
    }

    pub fn feed(&self) -> BufferFeed {
        BufferFeed {
            sender: self.channel.sender(),
        }
    }

    pub fn packet_in(&self, packet: &Packet) -> Result<()> {
        self.feed().packet_in(packet)
    }

    pub fn packet_out(&self, packet: &Packet) -> Result<()> {
        self.feed().packet_out(packet)
    }

    /// 重置所有流缓冲，等待任务线程执行完毕
    pub fn reset(&self, flush: bool) -> Result<()> {
        let (done_tx, done_rx) = bounded::<()>(0);
        self.channel.enqueue(AggregatorJob::Reset {
            flush,
            done: Some(done_tx),
        })?;
        // 发送端被丢弃即表示完成
        let _ = done_rx.recv();
        Ok(())
    }

    pub fn set_allowed_events(&self, events: DataEvent) -> Result<()> {
        self.channel.enqueue(AggregatorJob::SetAllowedEvents(events))?;
        let _ = self.wake_tx.try_send(());
        Ok(())
    }

    pub fn report_full_buffer(&self, stream: StreamType) -> Result<()> {
        self.channel.enqueue(AggregatorJob::SetReportMode {
            stream,
            report_full: true,
        })
    }

    pub fn report_actual_buffer(&self, stream: StreamType) -> Result<()> {
        self.channel.enqueue(AggregatorJob::SetReportMode {
            stream,
            report_full: false,
        })
    }

    pub fn subscribe_data_requests(&self) -> Receiver<DataRequest> {
        self.data_requests.subscribe()
    }

    pub fn subscribe_buffering(&self) -> Receiver<bool> {
        self.buffering.subscribe()
    }

    /// 缓冲填充百分比（实时）
    pub fn buffer_fill(&self, stream: StreamType) -> f64 {
        self.gauges.lock()[stream.index()]
            .as_ref()
            .map(BufferGauge::fill_percent)
            .unwrap_or(0.0)
    }

    /// 最近一次周期统计的缓冲报告
    pub fn buffer_report(&self, stream: StreamType) -> Option<BufferReport> {
        self.reports.lock()[stream.index()]
    }

    pub fn stop(&mut self) {
        self.ticker_token.cancel();
        if let Some(handle) = self.ticker.take() {
            let _ = handle.join();
        }
        self.channel.stop();
    }
}

impl Drop for BufferAggregator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 缓冲事件防抖
///
/// 开始缓冲需持续 `hold` 才生效，缓冲结束立即生效。
pub struct BufferingDebouncer {
    hold: Duration,
    pending_since: Option<Instant>,
    active: bool,
}

impl BufferingDebouncer {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            pending_since: None,
            active: false,
        }
    }

    /// 输入原始缓冲状态，返回需要立即生效的状态
    pub fn update(&mut self, buffering: bool, now: Instant) -> Option<bool> {
        if buffering {
            if !self.active && self.pending_since.is_none() {
                self.pending_since = Some(now);
            }
            return self.poll(now);
        }

        self.pending_since = None;
        if self.active {
            self.active = false;
            return Some(false);
        }
        None
    }

    /// 检查挂起的缓冲开始是否已到期
    pub fn poll(&mut self, now: Instant) -> Option<bool> {
        let since = self.pending_since?;
        if now.saturating_duration_since(since) >= self.hold {
            self.pending_since = None;
            self.active = true;
            return Some(true);
        }
        None
    }

    /// 挂起的缓冲开始的到期时刻
    pub fn deadline(&self) -> Option<Instant> {
        self.pending_since.map(|since| since + self.hold)
    }

    pub fn reset(&mut self) {
        self.pending_since = None;
        self.active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            publish_interval_ms: 10,
            ..PipelineConfig::default()
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_buffering_follows_empty_buffer() {
        let aggregator = BufferAggregator::new(&test_config());
        let buffering = aggregator.subscribe_buffering();
        aggregator.initialize_stream(StreamType::Audio).unwrap();
        aggregator.set_allowed_events(DataEvent::ALL).unwrap();

        for s in 0..=3 {
            let packet = Packet::data(StreamType::Audio, secs(s), vec![0; 4]);
            aggregator.packet_in(&packet).unwrap();
            aggregator.packet_out(&packet).unwrap();
        }
        assert_eq!(buffering.recv_timeout(secs(5)), Ok(true));

        let packet = Packet::data(StreamType::Audio, secs(4), vec![0; 4]);
        aggregator.packet_in(&packet).unwrap();
        assert_eq!(buffering.recv_timeout(secs(5)), Ok(false));
    }

    #[test]
    fn test_events_gated_by_mask() {
        let aggregator = BufferAggregator::new(&test_config());
        let requests = aggregator.subscribe_data_requests();
        aggregator.initialize_stream(StreamType::Video).unwrap();

        assert!(requests.recv_timeout(Duration::from_millis(100)).is_err());

        aggregator.set_allowed_events(DataEvent::DATA_REQUEST).unwrap();
        let request = requests.recv_timeout(secs(5)).unwrap();
        assert_eq!(request.stream, StreamType::Video);
        assert_eq!(request.requested_duration, secs(10));
        assert_eq!(request.max_duration, secs(10));
    }

    #[test]
    fn test_no_requests_above_threshold_or_when_reporting_full() {
        let aggregator = BufferAggregator::new(&test_config());
        aggregator.initialize_stream(StreamType::Audio).unwrap();
        for s in 0..=8 {
            let packet = Packet::data(StreamType::Audio, secs(s), vec![0; 4]);
            aggregator.packet_in(&packet).unwrap();
        }
        assert!(wait_until(|| aggregator
            .buffer_report(StreamType::Audio)
            .map_or(false, |r| r.buffered == secs(8))));

        let requests = aggregator.subscribe_data_requests();
        aggregator.set_allowed_events(DataEvent::ALL).unwrap();
        assert!(requests.recv_timeout(Duration::from_millis(100)).is_err());

        aggregator.report_full_buffer(StreamType::Audio).unwrap();
        aggregator.reset(true).unwrap();
        assert!(requests.recv_timeout(Duration::from_millis(100)).is_err());

        aggregator.report_actual_buffer(StreamType::Audio).unwrap();
        assert_eq!(
            requests.recv_timeout(secs(5)).map(|r| r.requested_duration),
            Ok(secs(10))
        );
    }

    #[test]
    fn test_duplicate_packets_ignored() {
        let aggregator = BufferAggregator::new(&test_config());
        aggregator.initialize_stream(StreamType::Audio).unwrap();

        for s in [0, 1, 2, 1, 3] {
            let packet = Packet::data(StreamType::Audio, secs(s), vec![0; 4]);
            aggregator.packet_in(&packet).unwrap();
        }
        // 未登记的数据包不计入送出
        let unknown = Packet::data(StreamType::Audio, secs(5), vec![0; 4]);
        aggregator.packet_out(&unknown).unwrap();

        assert!(wait_until(|| aggregator
            .buffer_report(StreamType::Audio)
            .map_or(false, |r| r.clock_in == Some(secs(3)))));
        let report = aggregator.buffer_report(StreamType::Audio).unwrap();
        assert_eq!(report.buffered, secs(3));
        assert_eq!(report.clock_out, None);
        assert_eq!(aggregator.buffer_fill(StreamType::Audio), 30.0);
    }

    #[test]
    fn test_eos_stops_data_requests() {
        let aggregator = BufferAggregator::new(&test_config());
        aggregator.initialize_stream(StreamType::Audio).unwrap();
        aggregator
            .packet_in(&Packet::data(StreamType::Audio, secs(1), vec![0; 4]))
            .unwrap();
        aggregator.packet_in(&Packet::eos(StreamType::Audio)).unwrap();

        let requests = aggregator.subscribe_data_requests();
        aggregator.set_allowed_events(DataEvent::ALL).unwrap();
        assert!(requests.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_reset_applies_after_queued_packets() {
        let aggregator = BufferAggregator::new(&test_config());
        aggregator.initialize_stream(StreamType::Audio).unwrap();

        // 大量积压的 PacketIn 必须在重置之前执行
        for i in 0..50_000u64 {
            let packet = Packet::data(StreamType::Audio, Duration::from_micros(i * 10), vec![]);
            aggregator.packet_in(&packet).unwrap();
        }
        aggregator.reset(true).unwrap();

        let report = aggregator.buffer_report(StreamType::Audio).unwrap();
        assert_eq!(report.clock_in, None);
        assert_eq!(report.buffered, Duration::ZERO);
        assert_eq!(aggregator.buffer_fill(StreamType::Audio), 0.0);
    }

    #[test]
    fn test_buffering_requires_all_streams_non_empty() {
        let aggregator = BufferAggregator::new(&test_config());
        let buffering = aggregator.subscribe_buffering();
        aggregator.initialize_stream(StreamType::Audio).unwrap();
        aggregator.initialize_stream(StreamType::Video).unwrap();

        // 音频已送空，视频仍有数据
        for s in 0..=2 {
            let packet = Packet::data(StreamType::Audio, secs(s), vec![0; 4]);
            aggregator.packet_in(&packet).unwrap();
            aggregator.packet_out(&packet).unwrap();
        }
        for s in 0..=4 {
            let packet = Packet::key_frame(StreamType::Video, secs(s), vec![0; 4]);
            aggregator.packet_in(&packet).unwrap();
        }
        aggregator.set_allowed_events(DataEvent::ALL).unwrap();

        assert_eq!(buffering.recv_timeout(secs(5)), Ok(true));
        // 视频非空不能结束缓冲
        assert!(buffering.recv_timeout(Duration::from_millis(100)).is_err());

        let packet = Packet::data(StreamType::Audio, secs(3), vec![0; 4]);
        aggregator.packet_in(&packet).unwrap();
        assert_eq!(buffering.recv_timeout(secs(5)), Ok(false));
    }

    #[test]
    fn test_debouncer_holds_start_and_releases_immediately() {
        let hold = Duration::from_secs(1);
        let mut debouncer = BufferingDebouncer::new(hold);
        let t0 = Instant::now();

        assert_eq!(debouncer.update(true, t0), None);
        assert_eq!(debouncer.deadline(), Some(t0 + hold));
        assert_eq!(debouncer.poll(t0 + Duration::from_millis(500)), None);

        // 持续时间不足时恢复，不产生任何事件
        assert_eq!(debouncer.update(false, t0 + Duration::from_millis(600)), None);
        assert_eq!(debouncer.deadline(), None);

        let t1 = t0 + Duration::from_secs(2);
        assert_eq!(debouncer.update(true, t1), None);
        assert_eq!(debouncer.poll(t1 + hold), Some(true));
        assert_eq!(debouncer.update(true, t1 + hold * 2), None);
        assert_eq!(debouncer.update(false, t1 + hold * 3), Some(false));
    }
}

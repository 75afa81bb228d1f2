use crate::core::{
    BufferReport, CancelToken, DataEvent, DataRequest, DecoderState, EventBus, Packet,
    PipelineConfig, PipelineEvent, PlayerError, Result, StreamConfig, StreamType,
    SynchronizationPhase,
};
use crate::player::buffer_aggregator::{BufferAggregator, BufferingDebouncer};
use crate::player::clock_source::{ClockReader, PlayerClockSource};
use crate::player::packet_storage::PacketStorage;
use crate::player::suspend_resume::SuspendResumeArbiter;
use crate::player::synchronizer::DataSynchronizer;
use crate::player::transfer_pump::{
    DecoderSink, Decryptor, PumpContext, PumpEvent, RetryPolicy, TransferPump,
};
use crossbeam_channel::{after, never, select, Receiver};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

struct Shared {
    config: PipelineConfig,
    decoder: Arc<dyn DecoderSink>,
    storage: Arc<PacketStorage>,
    aggregator: BufferAggregator,
    clock_source: Mutex<PlayerClockSource>,
    synchronizer: Arc<DataSynchronizer>,
    arbiter: Arc<SuspendResumeArbiter>,
    pump_ctx: PumpContext,
    pumps: Mutex<[Option<TransferPump>; StreamType::COUNT]>,
    initialized: [AtomicBool; StreamType::COUNT],
    ended: [AtomicBool; StreamType::COUNT],
    completed: AtomicBool,
    started: AtomicBool,
    stopped: AtomicBool,
    events: EventBus<PipelineEvent>,
    token: CancelToken,
}

/// ES 管线控制器
///
/// 生产者通过 `add_packet` 送入数据包，每个流的传输线程在同步门放行后
/// 提交给解码器；缓冲聚合器向上游发布数据请求与缓冲状态。
/// 所有方法只需 `&self`，可放入 `Arc` 跨线程共享。
pub struct EsPipeline {
    shared: Arc<Shared>,
    event_thread: Mutex<Option<JoinHandle<()>>>,
}

impl EsPipeline {
    pub fn new(
        config: PipelineConfig,
        decoder: Arc<dyn DecoderSink>,
        decryptor: Option<Arc<dyn Decryptor>>,
    ) -> Result<Self> {
        config.validate()?;
        info!("{} 🎮 创建 ES 管线...", log_ctx());

        let reader: ClockReader = {
            let decoder = Arc::clone(&decoder);
            Arc::new(move || decoder.read_clock())
        };
        let clock_source = PlayerClockSource::new(reader, config.clock_interval());
        let synchronizer = Arc::new(DataSynchronizer::new(&config, clock_source.handle()));
        let storage = Arc::new(PacketStorage::new());
        let aggregator = BufferAggregator::new(&config);
        let arbiter = Arc::new(SuspendResumeArbiter::new(Arc::clone(&decoder)));

        let pump_ctx = PumpContext {
            storage: Arc::clone(&storage),
            synchronizer: Arc::clone(&synchronizer),
            buffer_feed: aggregator.feed(),
            decoder: Arc::clone(&decoder),
            decryptor,
            events: EventBus::new(),
            retry: RetryPolicy::from_config(&config),
        };

        let pump_rx = pump_ctx.events.subscribe();
        let buffering_rx = aggregator.subscribe_buffering();
        let progress_rx = arbiter.subscribe_progress();

        let shared = Arc::new(Shared {
            config,
            decoder,
            storage,
            aggregator,
            clock_source: Mutex::new(clock_source),
            synchronizer,
            arbiter,
            pump_ctx,
            pumps: Mutex::new([None, None]),
            initialized: [AtomicBool::new(false), AtomicBool::new(false)],
            ended: [AtomicBool::new(false), AtomicBool::new(false)],
            completed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            events: EventBus::new(),
            token: CancelToken::new(),
        });

        let event_thread = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || shared.event_loop(pump_rx, buffering_rx, progress_rx))
        };

        info!("{} ✅ ES 管线创建完成", log_ctx());
        Ok(Self {
            shared,
            event_thread: Mutex::new(Some(event_thread)),
        })
    }

    /// 初始化（或替换）一个流：存储队列、流缓冲、同步门、解码器配置与传输线程
    pub fn initialize_stream(&self, config: StreamConfig) -> Result<()> {
        let shared = &self.shared;
        shared.ensure_running()?;
        let stream = config.stream_type();
        info!("{} {}: 初始化流 ({})", log_ctx(), stream, config.codec());

        shared.storage.initialize(stream);
        shared.aggregator.initialize_stream(stream)?;
        shared.synchronizer.initialize(stream);
        if !shared.decoder.set_stream_config(&config) {
            return Err(PlayerError::Config(format!(
                "{}: 解码器拒绝配置 {}",
                stream,
                config.codec()
            )));
        }

        let mut pump = TransferPump::new(stream, shared.pump_ctx.clone());
        pump.set_config(config);
        if shared.started.load(Ordering::SeqCst) {
            pump.start();
        }
        shared.pumps.lock()[stream.index()] = Some(pump);
        shared.initialized[stream.index()].store(true, Ordering::SeqCst);
        shared.ended[stream.index()].store(false, Ordering::SeqCst);
        Ok(())
    }

    /// 生产者送入数据包（每个流按 DTS 非递减）
    pub fn add_packet(&self, packet: Packet) -> Result<()> {
        let shared = &self.shared;
        shared.ensure_running()?;
        shared.storage.check_writable(packet.stream)?;
        // 先登记再入队，保证 PacketOut 不会早于 PacketIn
        shared.aggregator.packet_in(&packet)?;
        shared.storage.add_packet(packet)
    }

    /// 开始播放；已开始时作为用户恢复请求
    pub fn play(&self) -> Result<()> {
        let shared = &self.shared;
        shared.ensure_running()?;

        if shared.started.swap(true, Ordering::SeqCst) {
            shared.arbiter.request_play();
            return Ok(());
        }

        info!("{} ▶ 开始播放", log_ctx());
        if !shared.decoder.start() {
            warn!("{} 解码器启动失败，传输线程将重试", log_ctx());
        }
        shared.clock_source.lock().start();
        shared.aggregator.set_allowed_events(DataEvent::ALL)?;
        for pump in shared.pumps.lock().iter_mut().flatten() {
            pump.start();
        }
        Ok(())
    }

    /// 用户暂停
    pub fn pause(&self) -> Result<()> {
        self.shared.ensure_running()?;
        self.shared.arbiter.request_pause();
        Ok(())
    }

    /// 跳转到 `position`
    ///
    /// 清空所有流的数据后只允许数据请求（预填充），阻塞到每个流的首个
    /// 数据包提交到解码器；返回后允许的事件为 None，调用
    /// `start_after_seek` 恢复播放。
    pub fn seek(&self, position: Duration) -> Result<()> {
        let shared = &self.shared;
        shared.ensure_running()?;
        info!("{} ⏩ Seek 到 {:?}", log_ctx(), position);

        shared.arbiter.set_async_op_running(true);
        shared.aggregator.set_allowed_events(DataEvent::NONE)?;

        for pump in shared.pumps.lock().iter_mut().flatten() {
            pump.stop();
        }
        let streams = shared.initialized_streams();
        for &stream in &streams {
            shared.storage.disable(stream);
            shared.storage.empty(stream);
            shared.ended[stream.index()].store(false, Ordering::SeqCst);
        }
        shared.completed.store(false, Ordering::SeqCst);
        shared.aggregator.reset(true)?;
        shared.synchronizer.reset();

        let mut clock_source = shared.clock_source.lock();
        clock_source.stop();
        clock_source.reset();
        if shared.decoder.state() == DecoderState::Playing {
            shared.decoder.pause();
        }
        shared.decoder.seek(position);

        // 所有状态清空后才重新开放写入
        for &stream in &streams {
            shared.storage.enable(stream);
        }

        if !shared.started.load(Ordering::SeqCst) {
            // 尚未播放：只清空数据，由 play 启动传输
            drop(clock_source);
            shared.arbiter.set_async_op_running(false);
            shared.aggregator.set_allowed_events(DataEvent::DATA_REQUEST)?;
            return Ok(());
        }
        clock_source.start();
        drop(clock_source);

        let pump_rx = shared.pump_ctx.events.subscribe();
        shared.aggregator.set_allowed_events(DataEvent::DATA_REQUEST)?;
        for pump in shared.pumps.lock().iter_mut().flatten() {
            pump.request_first_data_packet_notification();
            pump.start();
        }

        shared.wait_first_data_packets(&pump_rx, streams)?;
        shared.aggregator.set_allowed_events(DataEvent::NONE)?;
        info!("{} ✅ Seek 预填充完成", log_ctx());
        Ok(())
    }

    /// Seek 完成后恢复播放（执行被推迟的恢复并开放所有事件）
    pub fn start_after_seek(&self) -> Result<()> {
        let shared = &self.shared;
        shared.ensure_running()?;
        info!("{} ▶ Seek 后恢复", log_ctx());
        shared.arbiter.finish_async_op();
        shared.aggregator.set_allowed_events(DataEvent::ALL)
    }

    /// 停止管线（不可重新启动）
    pub fn stop(&self) {
        if !self.shared.stop() {
            return;
        }
        if let Some(handle) = self.event_thread.lock().take() {
            info!("{} ⏳ 等待事件线程退出...", log_ctx());
            if handle.join().is_err() {
                error!("{} 事件线程 panic", log_ctx());
            }
        }
        info!("{} ✅ ES 管线已停止", log_ctx());
    }

    pub fn set_buffer_config(&self, stream: StreamType, max_duration: Duration) -> Result<()> {
        self.shared.aggregator.set_buffer_config(stream, max_duration)
    }

    /// 上游已送完可用数据时按满缓冲上报，避免触发缓冲
    pub fn report_full_buffer(&self, stream: StreamType) -> Result<()> {
        self.shared.aggregator.report_full_buffer(stream)
    }

    pub fn report_actual_buffer(&self, stream: StreamType) -> Result<()> {
        self.shared.aggregator.report_actual_buffer(stream)
    }

    pub fn subscribe_data_requests(&self) -> Receiver<DataRequest> {
        self.shared.aggregator.subscribe_data_requests()
    }

    /// 原始缓冲状态（未经防抖）
    pub fn subscribe_buffering(&self) -> Receiver<bool> {
        self.shared.aggregator.subscribe_buffering()
    }

    pub fn subscribe_events(&self) -> Receiver<PipelineEvent> {
        self.shared.events.subscribe()
    }

    pub fn buffer_fill(&self, stream: StreamType) -> f64 {
        self.shared.aggregator.buffer_fill(stream)
    }

    pub fn buffer_report(&self, stream: StreamType) -> Option<BufferReport> {
        self.shared.aggregator.buffer_report(stream)
    }

    pub fn sync_phase(&self) -> SynchronizationPhase {
        self.shared.synchronizer.phase()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.arbiter.is_paused()
    }

    pub fn decoder_state(&self) -> DecoderState {
        self.shared.decoder.state()
    }
}

impl Drop for EsPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(PlayerError::Other("管线已停止".to_string()));
        }
        Ok(())
    }

    fn initialized_streams(&self) -> Vec<StreamType> {
        StreamType::ALL
            .iter()
            .copied()
            .filter(|stream| self.initialized[stream.index()].load(Ordering::SeqCst))
            .collect()
    }

    /// 阻塞直到每个流提交首个数据包（或已结束），`stop` 可中断
    fn wait_first_data_packets(
        &self,
        pump_rx: &Receiver<PumpEvent>,
        mut waiting: Vec<StreamType>,
    ) -> Result<()> {
        while !waiting.is_empty() {
            select! {
                recv(self.token.signal()) -> _ => return Err(PlayerError::Cancelled),
                recv(pump_rx) -> event => match event {
                    Ok(PumpEvent::FirstDataPacket(stream)) | Ok(PumpEvent::Ended(stream)) => {
                        waiting.retain(|&s| s != stream);
                    }
                    Ok(PumpEvent::Error { stream, message }) => {
                        return Err(PlayerError::Other(format!("{}: {}", stream, message)));
                    }
                    Ok(PumpEvent::Reconfigure(_)) => {}
                    Err(_) => return Err(PlayerError::ChannelClosed),
                },
            }
        }
        Ok(())
    }

    fn event_loop(
        self: Arc<Self>,
        pump_rx: Receiver<PumpEvent>,
        buffering_rx: Receiver<bool>,
        progress_rx: Receiver<u8>,
    ) {
        info!("{} ▶ 管线事件线程启动", log_ctx());
        let mut debouncer = BufferingDebouncer::new(self.config.buffering_hold());

        loop {
            let timeout = match debouncer.deadline() {
                Some(deadline) => after(deadline.saturating_duration_since(Instant::now())),
                None => never(),
            };

            select! {
                recv(self.token.signal()) -> _ => break,
                recv(pump_rx) -> event => match event {
                    Ok(event) => self.handle_pump_event(event),
                    Err(_) => break,
                },
                recv(buffering_rx) -> msg => match msg {
                    Ok(buffering) => {
                        if let Some(buffering) = debouncer.update(buffering, Instant::now()) {
                            self.arbiter.request_buffering(buffering);
                        }
                    }
                    Err(_) => break,
                },
                recv(progress_rx) -> msg => {
                    if let Ok(progress) = msg {
                        self.events.publish(PipelineEvent::BufferingProgress(progress));
                    }
                }
                recv(timeout) -> _ => {
                    if let Some(buffering) = debouncer.poll(Instant::now()) {
                        self.arbiter.request_buffering(buffering);
                    }
                }
            }
        }
        info!("{} 🛑 管线事件线程退出", log_ctx());
    }

    fn handle_pump_event(&self, event: PumpEvent) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        match event {
            PumpEvent::Reconfigure(stream) => self.restart_stream(stream),
            PumpEvent::Ended(stream) => self.stream_ended(stream),
            PumpEvent::Error { stream, message } => self.fail(stream, message),
            PumpEvent::FirstDataPacket(stream) => debug!("{}: 首个数据包已提交", stream),
        }
    }

    /// 不兼容的配置变更：停止传输线程，重新配置解码器后重启
    fn restart_stream(&self, stream: StreamType) {
        let mut pumps = self.pumps.lock();
        let Some(pump) = pumps[stream.index()].as_mut() else {
            return;
        };
        pump.stop();
        let Some(config) = pump.take_pending_config() else {
            warn!("{}: 没有待应用的配置，直接重启传输线程", stream);
            pump.start();
            return;
        };

        info!("{} 🔄 {}: 重新配置解码器 ({})", log_ctx(), stream, config.codec());
        if !self.decoder.set_stream_config(&config) {
            drop(pumps);
            self.fail(stream, format!("解码器拒绝配置 {}", config.codec()));
            return;
        }
        pump.set_config(config);
        pump.start();
        drop(pumps);
        self.events.publish(PipelineEvent::StreamReconfigured(stream));
    }

    fn stream_ended(&self, stream: StreamType) {
        info!("{} 🏁 {}: 流结束", log_ctx(), stream);
        self.ended[stream.index()].store(true, Ordering::SeqCst);
        self.events.publish(PipelineEvent::StreamEnded(stream));

        let all_ended = self
            .initialized_streams()
            .iter()
            .all(|stream| self.ended[stream.index()].load(Ordering::SeqCst));
        if all_ended && !self.completed.swap(true, Ordering::SeqCst) {
            info!("{} ✅ 所有流播放完成", log_ctx());
            self.events.publish(PipelineEvent::PlaybackCompleted);
        }
    }

    /// 任一流的致命错误停止整条管线的数据传输
    fn fail(&self, stream: StreamType, message: String) {
        error!("{} ❌ {}: 播放错误: {}", log_ctx(), stream, message);
        if let Err(e) = self.aggregator.set_allowed_events(DataEvent::NONE) {
            warn!("关闭缓冲事件失败: {}", e);
        }
        for pump in self.pumps.lock().iter_mut().flatten() {
            pump.stop();
        }
        for stream in self.initialized_streams() {
            self.storage.disable(stream);
        }
        self.events
            .publish(PipelineEvent::PlaybackError { stream, message });
    }

    /// 返回是否由本次调用完成停止
    fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("{} 🛑 停止 ES 管线...", log_ctx());
        self.token.cancel();

        if let Err(e) = self.aggregator.set_allowed_events(DataEvent::NONE) {
            debug!("关闭缓冲事件失败: {}", e);
        }
        self.synchronizer.release_all();
        for pump in self.pumps.lock().iter_mut().flatten() {
            pump.stop();
        }
        self.clock_source.lock().stop();
        self.synchronizer.reset();
        self.decoder.stop();
        self.arbiter.reset();

        for stream in self.initialized_streams() {
            self.storage.disable(stream);
            self.storage.empty(stream);
        }
        if let Err(e) = self.aggregator.reset(true) {
            debug!("重置缓冲失败: {}", e);
        }
        true
    }
}

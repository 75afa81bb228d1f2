use crate::core::{
    CancelToken, Packet, PipelineConfig, Result, StreamType, SynchronizationPhase,
};
use crate::player::clock_source::ClockHandle;
use crossbeam_channel::{after, select, Receiver};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 等待期间检查取消令牌的间隔
const WAIT_SLICE: Duration = Duration::from_millis(20);

struct GateState {
    clock: Duration,
    reference: Duration,
    halt_on: Duration,
    halt_off: Duration,
    synchronized: bool,
}

/// 时钟同步门（带迟滞）
///
/// - 数据时钟更新时：`clock - reference >= halt_on` 则关闭
/// - 参考时钟更新时：`clock - reference <= halt_off` 则打开
pub struct ClockGate {
    stream: StreamType,
    state: Mutex<GateState>,
    condvar: Condvar,
}

impl ClockGate {
    pub fn new(stream: StreamType, halt_on: Duration, halt_off: Duration) -> Self {
        Self {
            stream,
            state: Mutex::new(GateState {
                clock: Duration::ZERO,
                reference: Duration::ZERO,
                halt_on,
                halt_off,
                synchronized: true,
            }),
            condvar: Condvar::new(),
        }
    }

    /// 设置阈值并放行所有等待者
    pub fn set_thresholds(&self, halt_on: Duration, halt_off: Duration) {
        let mut state = self.state.lock();
        state.halt_on = halt_on;
        state.halt_off = halt_off;
        state.synchronized = true;
        self.condvar.notify_all();
    }

    pub fn thresholds(&self) -> (Duration, Duration) {
        let state = self.state.lock();
        (state.halt_on, state.halt_off)
    }

    pub fn data_in(&self, clock: Duration) {
        let mut state = self.state.lock();
        state.clock = clock;
        if state.synchronized && clock >= state.reference + state.halt_on {
            debug!("{}: 时钟 {:?} 超前参考 {:?}，暂停", self.stream, clock, state.reference);
            state.synchronized = false;
        }
    }

    pub fn reference_in(&self, reference: Duration) {
        let mut state = self.state.lock();
        state.reference = reference;
        if !state.synchronized && state.clock <= reference + state.halt_off {
            debug!("{}: 参考 {:?} 追上时钟 {:?}，恢复", self.stream, reference, state.clock);
            state.synchronized = true;
            self.condvar.notify_all();
        }
    }

    /// 无条件放行
    pub fn release(&self) {
        let mut state = self.state.lock();
        if !state.synchronized {
            state.synchronized = true;
            self.condvar.notify_all();
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.clock = Duration::ZERO;
        state.reference = Duration::ZERO;
        state.synchronized = true;
        self.condvar.notify_all();
    }

    pub fn is_synchronized(&self) -> bool {
        self.state.lock().synchronized
    }

    pub fn clock(&self) -> Duration {
        self.state.lock().clock
    }

    pub fn reference(&self) -> Duration {
        self.state.lock().reference
    }

    /// 阻塞直到放行；返回是否发生了等待
    pub fn wait(&self, token: &CancelToken) -> Result<bool> {
        let mut state = self.state.lock();
        if state.synchronized {
            return Ok(false);
        }

        info!(
            "{}: 同步等待 clock {:?} reference {:?}",
            self.stream, state.clock, state.reference
        );
        while !state.synchronized {
            token.check()?;
            self.condvar.wait_for(&mut state, WAIT_SLICE);
        }
        Ok(true)
    }
}

struct SyncState {
    phase: SynchronizationPhase,
    active: [bool; StreamType::COUNT],
    ended: [bool; StreamType::COUNT],
    last_dts: [Option<Duration>; StreamType::COUNT],
}

impl SyncState {
    fn new() -> Self {
        Self {
            phase: SynchronizationPhase::StreamRelative,
            active: [false; StreamType::COUNT],
            ended: [false; StreamType::COUNT],
            last_dts: [None; StreamType::COUNT],
        }
    }

    /// 其他未结束流中最近送入的最小 DTS
    fn sibling_reference(&self, stream: StreamType) -> Option<Duration> {
        StreamType::ALL
            .iter()
            .filter(|&&other| other != stream && self.contributes(other))
            .filter_map(|other| self.last_dts[other.index()])
            .min()
    }

    fn has_siblings(&self, stream: StreamType) -> bool {
        StreamType::ALL
            .iter()
            .any(|&other| other != stream && self.contributes(other))
    }

    fn contributes(&self, stream: StreamType) -> bool {
        self.active[stream.index()] && !self.ended[stream.index()]
    }
}

struct Sampler {
    token: CancelToken,
    handle: JoinHandle<()>,
}

/// 数据同步器
///
/// 两阶段时钟同步：
/// 1. 流间同步（StreamRelative）：每个流以其他流最近送入的 DTS 为参考，阈值较紧
/// 2. 播放器时钟同步（PlayerRelative）：视频送入首个关键帧后切换，
///    参考取播放器时钟（不低于切换时的下限），阈值放宽
pub struct DataSynchronizer {
    gates: Arc<[ClockGate; StreamType::COUNT]>,
    state: Mutex<SyncState>,
    clock: ClockHandle,
    stream_thresholds: (Duration, Duration),
    player_thresholds: (Duration, Duration),
    sample_interval: Duration,
    sampler: Mutex<Option<Sampler>>,
}

impl DataSynchronizer {
    pub fn new(config: &PipelineConfig, clock: ClockHandle) -> Self {
        let (on, off) = config.stream_thresholds();
        Self {
            gates: Arc::new([
                ClockGate::new(StreamType::Audio, on, off),
                ClockGate::new(StreamType::Video, on, off),
            ]),
            state: Mutex::new(SyncState::new()),
            clock,
            stream_thresholds: config.stream_thresholds(),
            player_thresholds: config.player_thresholds(),
            sample_interval: config.clock_sample_interval(),
            sampler: Mutex::new(None),
        }
    }

    fn gate(&self, stream: StreamType) -> &ClockGate {
        &self.gates[stream.index()]
    }

    pub fn initialize(&self, stream: StreamType) {
        info!("{}: 初始化时钟同步", stream);
        self.state.lock().active[stream.index()] = true;
    }

    pub fn phase(&self) -> SynchronizationPhase {
        self.state.lock().phase
    }

    pub fn reference(&self, stream: StreamType) -> Duration {
        self.gate(stream).reference()
    }

    pub fn thresholds(&self, stream: StreamType) -> (Duration, Duration) {
        self.gate(stream).thresholds()
    }

    pub fn is_synchronized(&self, stream: StreamType) -> bool {
        self.gate(stream).is_synchronized()
    }

    /// 数据包已提交到解码器
    pub fn data_in(&self, packet: &Packet) {
        let stream = packet.stream;
        let mut state = self.state.lock();
        if !state.active[stream.index()] {
            warn!("{}: 时钟同步未初始化，忽略 {:?}", stream, packet.dts);
            return;
        }

        if packet.is_eos() {
            self.mark_ended(&mut state, stream);
            return;
        }
        if !packet.contains_data() {
            return;
        }

        let dts = packet.dts;
        let gate = self.gate(stream);
        let first = state.last_dts[stream.index()].is_none();
        state.last_dts[stream.index()] = Some(dts);

        if state.phase == SynchronizationPhase::PlayerRelative {
            gate.data_in(dts);
            return;
        }

        if first || !state.has_siblings(stream) {
            gate.reference_in(dts);
        } else if let Some(reference) = state.sibling_reference(stream) {
            gate.reference_in(reference);
        }
        gate.data_in(dts);

        // 其他流的参考跟随本流
        for other in StreamType::ALL {
            if other == stream || !state.contributes(other) {
                continue;
            }
            if let Some(reference) = state.sibling_reference(other) {
                self.gate(other).reference_in(reference);
            }
        }

        if stream == StreamType::Video && packet.is_key_frame {
            self.switch_to_player_clock(&mut state, dts);
        }
    }

    fn mark_ended(&self, state: &mut SyncState, stream: StreamType) {
        info!("{}: EOS，不再作为同步参考", stream);
        state.ended[stream.index()] = true;
        self.gate(stream).release();

        if state.phase == SynchronizationPhase::PlayerRelative {
            return;
        }
        for other in StreamType::ALL {
            if state.contributes(other) && !state.has_siblings(other) {
                self.gate(other).release();
            }
        }
    }

    fn switch_to_player_clock(&self, state: &mut SyncState, key_frame_dts: Duration) {
        let floor = match self.clock.last_clock() {
            Some(clock) => clock.max(key_frame_dts),
            None => key_frame_dts,
        };
        info!(
            "{} 🔀 视频关键帧 {:?}，切换到播放器时钟同步 (下限 {:?})",
            log_ctx(),
            key_frame_dts,
            floor
        );

        state.phase = SynchronizationPhase::PlayerRelative;

        let (on, off) = self.player_thresholds;
        for gate in self.gates.iter() {
            gate.set_thresholds(on, off);
            gate.reference_in(floor);
        }

        self.start_sampler(floor);
    }

    fn start_sampler(&self, floor: Duration) {
        let mut sampler = self.sampler.lock();
        if sampler.is_some() {
            return;
        }

        let token = CancelToken::new();
        let worker_token = token.clone();
        let clock_rx = self.clock.subscribe();
        let gates = Arc::clone(&self.gates);
        let interval = self.sample_interval;

        let handle = thread::spawn(move || {
            Self::sample_loop(gates, clock_rx, worker_token, interval, floor);
        });
        *sampler = Some(Sampler { token, handle });
    }

    fn sample_loop(
        gates: Arc<[ClockGate; StreamType::COUNT]>,
        clock_rx: Receiver<Duration>,
        token: CancelToken,
        interval: Duration,
        floor: Duration,
    ) {
        info!("{} ⏰ 播放器时钟采样启动 (周期 {:?})", log_ctx(), interval);
        let mut applied: Option<Duration> = None;
        loop {
            select! {
                recv(token.signal()) -> _ => break,
                recv(after(interval)) -> _ => {}
            }

            let Some(clock) = clock_rx.try_iter().last() else {
                continue;
            };
            let reference = clock.max(floor);
            if applied == Some(reference) {
                continue;
            }
            applied = Some(reference);
            for gate in gates.iter() {
                gate.reference_in(reference);
            }
        }
        info!("{} 🛑 播放器时钟采样退出", log_ctx());
    }

    fn stop_sampler(&self) {
        if let Some(sampler) = self.sampler.lock().take() {
            sampler.token.cancel();
            let _ = sampler.handle.join();
        }
    }

    /// 等待本流的同步门放行
    pub fn wait(&self, stream: StreamType, token: &CancelToken) -> Result<bool> {
        self.gate(stream).wait(token)
    }

    /// 回到流间同步阶段（Seek/停止时调用），放行所有等待者
    pub fn reset(&self) {
        info!("重置时钟同步");
        self.stop_sampler();

        let mut state = self.state.lock();
        let active = state.active;
        *state = SyncState::new();
        state.active = active;

        let (on, off) = self.stream_thresholds;
        for gate in self.gates.iter() {
            gate.reset();
            gate.set_thresholds(on, off);
        }
    }

    /// 放行所有流（停止管线时使用）
    pub fn release_all(&self) {
        for gate in self.gates.iter() {
            gate.release();
        }
    }
}

impl Drop for DataSynchronizer {
    fn drop(&mut self) {
        self.stop_sampler();
    }
}

use crate::core::{
    CancelToken, DecoderState, EventBus, Packet, PacketPayload, PipelineConfig, PlayerError,
    Result, StreamConfig, StreamType, SubmitStatus,
};
use crate::player::buffer_aggregator::BufferFeed;
use crate::player::packet_storage::PacketStorage;
use crate::player::synchronizer::DataSynchronizer;
use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 解码器（数据包接收端）
pub trait DecoderSink: Send + Sync {
    fn submit_packet(&self, packet: &Packet) -> SubmitStatus;

    fn submit_eos(&self, stream: StreamType) -> SubmitStatus;

    /// 解码器当前播放时钟，尚无时钟时返回 None
    fn read_clock(&self) -> Option<Duration>;

    /// 设置流配置（初始化或重新配置时调用）
    fn set_stream_config(&self, config: &StreamConfig) -> bool;

    fn start(&self) -> bool;

    fn pause(&self) -> bool;

    fn resume(&self) -> bool;

    fn stop(&self) -> bool;

    /// 丢弃已排队的数据，时钟从 `position` 重新开始
    fn seek(&self, position: Duration) -> bool;

    fn state(&self) -> DecoderState;
}

/// 解密协作方
pub trait Decryptor: Send + Sync {
    /// 解密得到新的明文数据包，失败对该流是致命的
    fn decrypt(&self, packet: &Packet) -> Result<Packet>;
}

/// 传输线程事件
#[derive(Debug, Clone, PartialEq)]
pub enum PumpEvent {
    /// 不兼容的配置变更，传输线程已退出，待控制器重新配置
    Reconfigure(StreamType),
    /// EOS 已提交
    Ended(StreamType),
    /// 致命错误，传输线程已退出且输入已关闭
    Error { stream: StreamType, message: String },
    /// 启动后第一个数据包已提交
    FirstDataPacket(StreamType),
}

/// 送包重试策略
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub not_prepared: Duration,
    pub full: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            not_prepared: config.not_prepared_retry(),
            full: config.full_retry(),
        }
    }

    /// 可重试状态返回等待时长，其余返回 None
    pub fn delay(&self, status: SubmitStatus) -> Option<Duration> {
        match status {
            SubmitStatus::NotPrepared => Some(self.not_prepared),
            SubmitStatus::Full => Some(self.full),
            _ => None,
        }
    }
}

/// 带重试地提交，返回提交次数
pub fn submit_with_retry<F>(
    stream: StreamType,
    policy: &RetryPolicy,
    token: &CancelToken,
    mut submit: F,
) -> Result<u32>
where
    F: FnMut() -> SubmitStatus,
{
    let mut attempts = 0;
    loop {
        let status = submit();
        attempts += 1;
        if status == SubmitStatus::Success {
            return Ok(attempts);
        }
        match policy.delay(status) {
            Some(delay) => {
                if status == SubmitStatus::NotPrepared {
                    info!("{}: 解码器未就绪，{:?} 后重试", stream, delay);
                } else {
                    debug!("{}: 解码器已满，{:?} 后重试", stream, delay);
                }
                token.sleep(delay)?;
            }
            None => return Err(PlayerError::Submit { stream, status }),
        }
    }
}

/// 传输线程共享的协作方
#[derive(Clone)]
pub struct PumpContext {
    pub storage: Arc<PacketStorage>,
    pub synchronizer: Arc<DataSynchronizer>,
    pub buffer_feed: BufferFeed,
    pub decoder: Arc<dyn DecoderSink>,
    pub decryptor: Option<Arc<dyn Decryptor>>,
    pub events: EventBus<PumpEvent>,
    pub retry: RetryPolicy,
}

/// 单个流的配置状态
#[derive(Default)]
struct StreamConfigs {
    current: Option<StreamConfig>,
    pending: Option<StreamConfig>,
}

/// 数据包传输线程（每个流一个）
///
/// 循环：等待同步门 → 取包 → 提交解码器（Full/NotPrepared 时退避重试）
pub struct TransferPump {
    stream: StreamType,
    ctx: PumpContext,
    configs: Arc<Mutex<StreamConfigs>>,
    first_packet_requested: Arc<AtomicBool>,
    token: Option<CancelToken>,
    worker: Option<JoinHandle<()>>,
}

impl TransferPump {
    pub fn new(stream: StreamType, ctx: PumpContext) -> Self {
        Self {
            stream,
            ctx,
            configs: Arc::new(Mutex::new(StreamConfigs::default())),
            first_packet_requested: Arc::new(AtomicBool::new(false)),
            token: None,
            worker: None,
        }
    }

    pub fn stream(&self) -> StreamType {
        self.stream
    }

    pub fn subscribe(&self) -> Receiver<PumpEvent> {
        self.ctx.events.subscribe()
    }

    pub fn set_config(&self, config: StreamConfig) {
        self.configs.lock().current = Some(config);
    }

    pub fn current_config(&self) -> Option<StreamConfig> {
        self.configs.lock().current.clone()
    }

    /// 取出待应用的不兼容配置
    pub fn take_pending_config(&self) -> Option<StreamConfig> {
        self.configs.lock().pending.take()
    }

    /// 请求在下一个数据包提交后发送 `FirstDataPacket`
    pub fn request_first_data_packet_notification(&self) {
        info!("{}: 请求首个数据包通知", self.stream);
        self.first_packet_requested.store(true, Ordering::SeqCst);
    }

    /// 启动传输线程（已在运行时忽略）
    pub fn start(&mut self) {
        if self.is_running() {
            info!("{}: 传输线程已在运行", self.stream);
            return;
        }
        self.join_finished();

        let token = CancelToken::new();
        let worker = PumpWorker {
            stream: self.stream,
            ctx: self.ctx.clone(),
            configs: Arc::clone(&self.configs),
            first_packet_requested: Arc::clone(&self.first_packet_requested),
            token: token.clone(),
        };
        self.worker = Some(thread::spawn(move || worker.run()));
        self.token = Some(token);
    }

    /// 取消并等待传输线程退出
    pub fn stop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        if let Some(handle) = self.worker.take() {
            info!("{} ⏳ 等待 {} 传输线程退出...", log_ctx(), self.stream);
            if handle.join().is_err() {
                error!("{} {} 传输线程 panic", log_ctx(), self.stream);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    fn join_finished(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        self.token = None;
    }
}

impl Drop for TransferPump {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PumpWorker {
    stream: StreamType,
    ctx: PumpContext,
    configs: Arc<Mutex<StreamConfigs>>,
    first_packet_requested: Arc<AtomicBool>,
    token: CancelToken,
}

impl PumpWorker {
    fn run(self) {
        info!("{} ▶ {} 传输线程启动", log_ctx(), self.stream);
        let mut submitted: u64 = 0;

        let result = loop {
            if let Err(e) = self.ctx.synchronizer.wait(self.stream, &self.token) {
                break Err(e);
            }
            let packet = match self.ctx.storage.get_packet(self.stream, &self.token) {
                Ok(packet) => packet,
                Err(e) => break Err(e),
            };
            match self.process(packet) {
                Ok(true) => submitted += 1,
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        match result {
            Ok(()) => {}
            Err(PlayerError::Cancelled) => {
                info!("{} {} 传输线程已取消", log_ctx(), self.stream);
                self.ctx.storage.disable(self.stream);
            }
            Err(e) => {
                error!("{} ❌ {} 传输失败: {}", log_ctx(), self.stream, e);
                self.ctx.storage.disable(self.stream);
                self.ctx.events.publish(PumpEvent::Error {
                    stream: self.stream,
                    message: e.to_string(),
                });
            }
        }
        info!("{} 🛑 {} 传输线程退出（共提交 {} 个数据包）", log_ctx(), self.stream, submitted);
    }

    /// 处理一个数据包，返回是否继续传输
    fn process(&self, packet: Packet) -> Result<bool> {
        match &packet.payload {
            PacketPayload::Eos => {
                info!("{}: 提交 EOS", self.stream);
                self.submit(|| self.ctx.decoder.submit_eos(self.stream))?;
                self.ctx.synchronizer.data_in(&packet);
                self.ctx.events.publish(PumpEvent::Ended(self.stream));
                Ok(false)
            }
            PacketPayload::Config(config) => Ok(self.apply_config(config)),
            PacketPayload::Encrypted(_) => {
                let decryptor = self.ctx.decryptor.as_ref().ok_or_else(|| PlayerError::Decrypt {
                    stream: self.stream,
                    reason: "未配置解密器".to_string(),
                })?;
                let decrypted = decryptor.decrypt(&packet).map_err(|e| PlayerError::Decrypt {
                    stream: self.stream,
                    reason: e.to_string(),
                })?;
                self.submit(|| self.ctx.decoder.submit_packet(&decrypted))?;
                self.submitted(&packet);
                Ok(true)
            }
            PacketPayload::Data(_) => {
                self.submit(|| self.ctx.decoder.submit_packet(&packet))?;
                self.submitted(&packet);
                Ok(true)
            }
        }
    }

    fn submit<F: FnMut() -> SubmitStatus>(&self, submit: F) -> Result<u32> {
        submit_with_retry(self.stream, &self.ctx.retry, &self.token, submit)
    }

    /// 兼容的配置直接生效；不兼容时保存待处理配置并退出
    fn apply_config(&self, config: &StreamConfig) -> bool {
        let mut configs = self.configs.lock();
        let compatible = configs
            .current
            .as_ref()
            .map_or(true, |current| current.is_compatible(config));

        if compatible {
            info!("{}: 配置变更兼容，直接生效 ({})", self.stream, config.codec());
            configs.current = Some(config.clone());
            return true;
        }

        warn!("{}: 配置变更不兼容，需要重新配置 ({})", self.stream, config.codec());
        configs.pending = Some(config.clone());
        drop(configs);
        self.ctx.events.publish(PumpEvent::Reconfigure(self.stream));
        false
    }

    fn submitted(&self, packet: &Packet) {
        if let Err(e) = self.ctx.buffer_feed.packet_out(packet) {
            debug!("{}: 缓冲统计已停止: {}", self.stream, e);
        }
        self.ctx.synchronizer.data_in(packet);

        if self.first_packet_requested.swap(false, Ordering::SeqCst) {
            info!("{}: 首个数据包已提交 {:?}", self.stream, packet.dts);
            self.ctx.events.publish(PumpEvent::FirstDataPacket(self.stream));
        }
    }
}

use anyhow::{Context, Result};
use crossbeam_channel::{select, tick, Receiver};
use log::{info, warn};
use myy_es_core::core::{
    CancelToken, DataRequest, Packet, PipelineConfig, PipelineEvent, StreamConfig, StreamType,
};
use myy_es_core::player::{EsPipeline, SimulatedDecoder};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// 合成内容总时长
const CONTENT_DURATION: Duration = Duration::from_secs(8);
/// 视频关键帧间隔（帧）
const GOP_SIZE: u64 = 25;
const RUN_TIMEOUT: Duration = Duration::from_secs(30);

/// 合成的基本流
struct SyntheticStream {
    stream: StreamType,
    frame_duration: Duration,
    frames: u64,
    ended: bool,
}

impl SyntheticStream {
    fn new(stream: StreamType, frame_duration: Duration) -> Self {
        Self {
            stream,
            frame_duration,
            frames: 0,
            ended: false,
        }
    }

    fn next_dts(&self) -> Duration {
        self.frame_duration * self.frames as u32
    }

    fn next_packet(&mut self) -> Packet {
        let dts = self.next_dts();
        let payload = vec![(self.frames & 0xff) as u8; 188];
        let packet = match self.stream {
            StreamType::Video if self.frames % GOP_SIZE == 0 => {
                Packet::key_frame(self.stream, dts, payload)
            }
            _ => Packet::data(self.stream, dts, payload),
        };
        self.frames += 1;
        packet
    }

    /// 按请求时长送入数据，内容结束时送入 EOS
    fn fill(&mut self, pipeline: &EsPipeline, requested: Duration) -> Result<()> {
        if self.ended {
            return Ok(());
        }

        let until = (self.next_dts() + requested).min(CONTENT_DURATION);
        let mut sent = 0;
        while self.next_dts() < until {
            pipeline.add_packet(self.next_packet())?;
            sent += 1;
        }
        info!("{}: 送入 {} 个数据包，下一个 DTS {:?}", self.stream, sent, self.next_dts());

        if self.next_dts() >= CONTENT_DURATION {
            pipeline.add_packet(Packet::eos(self.stream))?;
            self.ended = true;
            info!("{}: 内容结束，已送入 EOS", self.stream);
        }
        Ok(())
    }
}

/// 应答数据请求的生产者
fn producer_loop(pipeline: Arc<EsPipeline>, requests: Receiver<DataRequest>, token: CancelToken) {
    let mut streams = [
        SyntheticStream::new(StreamType::Audio, Duration::from_millis(23)),
        SyntheticStream::new(StreamType::Video, Duration::from_millis(40)),
    ];

    loop {
        select! {
            recv(token.signal()) -> _ => break,
            recv(requests) -> request => {
                let Ok(request) = request else {
                    break;
                };
                let stream = &mut streams[request.stream.index()];
                if let Err(e) = stream.fill(&pipeline, request.requested_duration) {
                    warn!("{}: 送入数据失败: {}", request.stream, e);
                }
            }
        }
    }
    info!("🛑 生产者退出");
}

fn main() -> Result<()> {
    // 初始化日志
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("🎬 MYY ES 管线演示启动");

    let config = match std::env::args().nth(1) {
        Some(path) => PipelineConfig::from_json_file(&path)
            .with_context(|| format!("加载配置失败: {}", path))?,
        None => PipelineConfig::default(),
    };

    let decoder = Arc::new(SimulatedDecoder::new(64));
    let pipeline = Arc::new(EsPipeline::new(config, decoder.clone(), None)?);
    pipeline.initialize_stream(StreamConfig::Audio {
        codec: "aac".to_string(),
        sample_rate: 44_100,
        channels: 2,
        bitrate: 128_000,
    })?;
    pipeline.initialize_stream(StreamConfig::Video {
        codec: "h264".to_string(),
        width: 1920,
        height: 1080,
        fps: 25.0,
    })?;

    let events = pipeline.subscribe_events();
    let producer_token = CancelToken::new();
    let producer = {
        let pipeline = Arc::clone(&pipeline);
        let requests = pipeline.subscribe_data_requests();
        let token = producer_token.clone();
        thread::spawn(move || producer_loop(pipeline, requests, token))
    };

    pipeline.play()?;

    let started = Instant::now();
    let ticker = tick(Duration::from_secs(1));
    loop {
        select! {
            recv(events) -> event => match event {
                Ok(PipelineEvent::PlaybackCompleted) => {
                    info!("✅ 播放完成，用时 {:?}", started.elapsed());
                    break;
                }
                Ok(PipelineEvent::PlaybackError { stream, message }) => {
                    warn!("❌ {} 播放错误: {}", stream, message);
                    break;
                }
                Ok(event) => info!("📣 管线事件: {:?}", event),
                Err(_) => break,
            },
            recv(ticker) -> _ => {
                for stream in StreamType::ALL {
                    info!("📊 {}: 缓冲 {:.2}%", stream, pipeline.buffer_fill(stream));
                }
                if started.elapsed() >= RUN_TIMEOUT {
                    warn!("⏱ 超时，停止演示");
                    break;
                }
            }
        }
    }

    producer_token.cancel();
    pipeline.stop();
    if producer.join().is_err() {
        warn!("生产者线程 panic");
    }

    info!(
        "📦 解码器共接收: 音频 {} 个，视频 {} 个",
        decoder.submitted(StreamType::Audio),
        decoder.submitted(StreamType::Video)
    );
    Ok(())
}

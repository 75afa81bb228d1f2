use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// 基本流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Audio,
    Video,
}

impl StreamType {
    /// 流类型数量（用于按流类型索引的数组）
    pub const COUNT: usize = 2;

    /// 所有流类型
    pub const ALL: [StreamType; StreamType::COUNT] = [StreamType::Audio, StreamType::Video];

    /// 数组下标
    pub fn index(self) -> usize {
        match self {
            StreamType::Audio => 0,
            StreamType::Video => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Audio => "Audio",
            StreamType::Video => "Video",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 流配置（编码参数）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StreamConfig {
    Audio {
        codec: String,
        sample_rate: u32,
        channels: u16,
        bitrate: u32,
    },
    Video {
        codec: String,
        width: u32,
        height: u32,
        fps: f64,
    },
}

impl StreamConfig {
    pub fn stream_type(&self) -> StreamType {
        match self {
            StreamConfig::Audio { .. } => StreamType::Audio,
            StreamConfig::Video { .. } => StreamType::Video,
        }
    }

    pub fn codec(&self) -> &str {
        match self {
            StreamConfig::Audio { codec, .. } | StreamConfig::Video { codec, .. } => codec,
        }
    }

    /// 判断新配置能否在不重建解码器流的情况下直接生效
    ///
    /// - 音频：编码、采样率、声道布局必须一致（码率可变）
    /// - 视频：编码一致即可（分辨率/帧率变化由解码器自行适配）
    pub fn is_compatible(&self, other: &StreamConfig) -> bool {
        match (self, other) {
            (
                StreamConfig::Audio { codec, sample_rate, channels, .. },
                StreamConfig::Audio {
                    codec: other_codec,
                    sample_rate: other_rate,
                    channels: other_channels,
                    ..
                },
            ) => codec == other_codec && sample_rate == other_rate && channels == other_channels,
            (StreamConfig::Video { codec, .. }, StreamConfig::Video { codec: other_codec, .. }) => {
                codec == other_codec
            }
            _ => false,
        }
    }
}

/// 加密数据（由解密协作方处理）
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedData {
    pub key_id: Vec<u8>,
    pub iv: Vec<u8>,
    pub data: Vec<u8>,
}

/// 数据包负载
#[derive(Debug, Clone, PartialEq)]
pub enum PacketPayload {
    /// 明文数据
    Data(Vec<u8>),
    /// 加密数据，送解码器前需先解密
    Encrypted(EncryptedData),
    /// 流结束标记
    Eos,
    /// 配置变更
    Config(StreamConfig),
}

/// 基本流数据包
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub stream: StreamType,
    pub pts: Duration,
    pub dts: Duration,
    pub is_key_frame: bool,
    pub payload: PacketPayload,
}

impl Packet {
    pub fn data(stream: StreamType, dts: Duration, data: Vec<u8>) -> Self {
        Self {
            stream,
            pts: dts,
            dts,
            is_key_frame: false,
            payload: PacketPayload::Data(data),
        }
    }

    pub fn key_frame(stream: StreamType, dts: Duration, data: Vec<u8>) -> Self {
        Self {
            is_key_frame: true,
            ..Self::data(stream, dts, data)
        }
    }

    pub fn encrypted(stream: StreamType, dts: Duration, data: EncryptedData) -> Self {
        Self {
            stream,
            pts: dts,
            dts,
            is_key_frame: false,
            payload: PacketPayload::Encrypted(data),
        }
    }

    pub fn eos(stream: StreamType) -> Self {
        Self {
            stream,
            pts: Duration::ZERO,
            dts: Duration::ZERO,
            is_key_frame: false,
            payload: PacketPayload::Eos,
        }
    }

    pub fn config(config: StreamConfig) -> Self {
        Self {
            stream: config.stream_type(),
            pts: Duration::ZERO,
            dts: Duration::ZERO,
            is_key_frame: false,
            payload: PacketPayload::Config(config),
        }
    }

    /// 是否携带时钟（数据包或加密包）
    pub fn contains_data(&self) -> bool {
        matches!(self.payload, PacketPayload::Data(_) | PacketPayload::Encrypted(_))
    }

    pub fn is_eos(&self) -> bool {
        matches!(self.payload, PacketPayload::Eos)
    }

    pub fn is_config_change(&self) -> bool {
        matches!(self.payload, PacketPayload::Config(_))
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.payload, PacketPayload::Encrypted(_))
    }

    pub fn size(&self) -> usize {
        match &self.payload {
            PacketPayload::Data(data) => data.len(),
            PacketPayload::Encrypted(enc) => enc.data.len(),
            _ => 0,
        }
    }
}

/// 解码器送包结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitStatus {
    Success,
    /// 解码器已满，稍后重试
    Full,
    /// 解码器未就绪，稍后重试
    NotPrepared,
    /// 不可恢复的错误
    InvalidPacket,
    OutOfMemory,
    Fatal,
}

/// 解码器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderState {
    Idle,
    Ready,
    Playing,
    Paused,
}

/// 时钟同步阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SynchronizationPhase {
    /// 流间同步：参考时钟取其他流最近送入的 DTS
    StreamRelative,
    /// 播放器时钟同步：参考时钟取解码器时钟
    PlayerRelative,
}

/// 数据请求（发往上游生产者）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequest {
    pub stream: StreamType,
    /// 还可以接收的数据时长
    pub requested_duration: Duration,
    pub max_duration: Duration,
}

/// 单个流的缓冲状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDataState {
    pub requested_duration: Duration,
    pub is_buffer_empty: bool,
}

/// 允许发布的缓冲事件（位掩码）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DataEvent(u8);

impl DataEvent {
    pub const NONE: DataEvent = DataEvent(0);
    pub const DATA_REQUEST: DataEvent = DataEvent(0b01);
    pub const BUFFERING: DataEvent = DataEvent(0b10);
    pub const ALL: DataEvent = DataEvent(0b11);

    /// `self` 是否包含 `event` 的所有位
    pub fn allows(self, event: DataEvent) -> bool {
        self.0 & event.0 == event.0
    }
}

impl std::ops::BitOr for DataEvent {
    type Output = DataEvent;

    fn bitor(self, rhs: DataEvent) -> DataEvent {
        DataEvent(self.0 | rhs.0)
    }
}

impl fmt::Display for DataEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DataEvent::NONE => f.write_str("None"),
            DataEvent::DATA_REQUEST => f.write_str("DataRequest"),
            DataEvent::BUFFERING => f.write_str("Buffering"),
            _ => f.write_str("All"),
        }
    }
}

/// 缓冲状态报告（用于监控和调试）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BufferReport {
    pub stream: StreamType,
    /// 已缓冲时长
    pub buffered: Duration,
    /// 最大缓冲时长
    pub max_duration: Duration,
    /// 填充百分比 (0.0 - 100.0)
    pub fill_percent: f64,
    pub clock_in: Option<Duration>,
    pub clock_out: Option<Duration>,
}

/// 管线对外事件
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// 流需要重新配置（不兼容的配置变更）
    StreamReconfigured(StreamType),
    /// 流已送完 EOS
    StreamEnded(StreamType),
    /// 所有流结束
    PlaybackCompleted,
    /// 缓冲进度 (0 = 开始缓冲, 100 = 缓冲完成)
    BufferingProgress(u8),
    /// 播放错误（整条管线已停止）
    PlaybackError { stream: StreamType, message: String },
}

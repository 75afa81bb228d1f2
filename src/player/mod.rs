// 播放器核心模块：缓冲统计、时钟同步、数据包传输

pub mod job_channel;
pub mod stream_buffer;
pub mod buffer_aggregator;
pub mod clock_source;
pub mod synchronizer;
pub mod packet_storage;
pub mod transfer_pump;
pub mod suspend_resume;
pub mod sim_decoder;
pub mod pipeline;

pub use job_channel::{Job, JobPriority, JobSender, PriorityJobChannel};
pub use stream_buffer::{BufferGauge, StreamBuffer};
pub use buffer_aggregator::{BufferAggregator, BufferFeed, BufferingDebouncer};
pub use clock_source::{ClockHandle, ClockReader, PlayerClockSource};
pub use synchronizer::{ClockGate, DataSynchronizer};
pub use packet_storage::PacketStorage;
pub use transfer_pump::{DecoderSink, Decryptor, PumpEvent, RetryPolicy, TransferPump};
pub use suspend_resume::{SuspendReason, SuspendResumeArbiter};
pub use sim_decoder::SimulatedDecoder;
pub use pipeline::EsPipeline;

// 核心数据结构和类型定义

pub mod types;
pub mod clock;
pub mod error;
pub mod config;
pub mod events;
pub mod cancel;

pub use types::*;
pub use clock::*;
pub use error::*;
pub use config::PipelineConfig;
pub use events::EventBus;
pub use cancel::CancelToken;

use crate::core::types::{StreamType, SubmitStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("{stream}: 送包失败 ({status:?})")]
    Submit { stream: StreamType, status: SubmitStatus },

    #[error("{stream}: 解密失败: {reason}")]
    Decrypt { stream: StreamType, reason: String },

    #[error("操作已取消")]
    Cancelled,

    #[error("{0}: 数据包存储已关闭")]
    StorageDisabled(StreamType),

    #[error("{0}: 流未初始化")]
    StreamNotInitialized(StreamType),

    #[error("任务通道已关闭")]
    ChannelClosed,

    #[error("配置错误: {0}")]
    Config(String),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON 错误: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("其他错误: {0}")]
    Other(String),
}

impl PlayerError {
    /// 是否为取消（正常退出路径，不上报）
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PlayerError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;

use crate::core::error::{PlayerError, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 管线配置
///
/// 所有时间字段单位均为毫秒，可从 JSON 文件加载，缺省字段使用默认值。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 每个流的最大缓冲时长
    pub buffer_duration_ms: u64,
    /// 已缓冲时长低于该值时发布数据请求
    pub data_request_threshold_ms: u64,
    /// 缓冲状态发布周期
    pub publish_interval_ms: u64,
    /// 解码器时钟轮询周期
    pub clock_interval_ms: u64,
    /// 播放器时钟同步阶段的采样周期
    pub clock_sample_interval_ms: u64,
    /// 流间同步阶段：暂停阈值
    pub stream_halt_on_ms: u64,
    /// 流间同步阶段：恢复阈值
    pub stream_halt_off_ms: u64,
    /// 播放器时钟同步阶段：暂停阈值
    pub player_halt_on_ms: u64,
    /// 播放器时钟同步阶段：恢复阈值
    pub player_halt_off_ms: u64,
    /// DTS 跳变超过该值视为不连续（重新定基准）
    pub discontinuity_threshold_ms: u64,
    /// 解码器未就绪时的重试间隔
    pub not_prepared_retry_ms: u64,
    /// 解码器满时的重试间隔
    pub full_retry_ms: u64,
    /// 缓冲开始事件的防抖时间
    pub buffering_hold_ms: u64,
    /// 已见数据包登记表的保留时间
    pub observed_packet_ttl_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_duration_ms: 10_000,
            data_request_threshold_ms: 7_000,
            publish_interval_ms: 250,
            clock_interval_ms: 50,
            clock_sample_interval_ms: 100,
            stream_halt_on_ms: 500,
            stream_halt_off_ms: 250,
            player_halt_on_ms: 2_000,
            player_halt_off_ms: 1_000,
            discontinuity_threshold_ms: 5_000,
            not_prepared_retry_ms: 1_000,
            full_retry_ms: 500,
            buffering_hold_ms: 1_000,
            observed_packet_ttl_ms: 30_000,
        }
    }
}

impl PipelineConfig {
    /// 从 JSON 文件加载配置
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("📄 加载管线配置: {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// 从 JSON 字符串解析配置
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// 检查阈值关系
    pub fn validate(&self) -> Result<()> {
        if self.stream_halt_off_ms >= self.stream_halt_on_ms {
            return Err(PlayerError::Config(format!(
                "stream_halt_off_ms ({}) 必须小于 stream_halt_on_ms ({})",
                self.stream_halt_off_ms, self.stream_halt_on_ms
            )));
        }
        if self.player_halt_off_ms >= self.player_halt_on_ms {
            return Err(PlayerError::Config(format!(
                "player_halt_off_ms ({}) 必须小于 player_halt_on_ms ({})",
                self.player_halt_off_ms, self.player_halt_on_ms
            )));
        }
        if self.buffer_duration_ms == 0 {
            return Err(PlayerError::Config("buffer_duration_ms 不能为 0".to_string()));
        }
        for (name, value) in [
            ("publish_interval_ms", self.publish_interval_ms),
            ("clock_interval_ms", self.clock_interval_ms),
            ("clock_sample_interval_ms", self.clock_sample_interval_ms),
        ] {
            if value == 0 {
                return Err(PlayerError::Config(format!("{} 不能为 0", name)));
            }
        }
        Ok(())
    }

    pub fn buffer_duration(&self) -> Duration {
        Duration::from_millis(self.buffer_duration_ms)
    }

    pub fn data_request_threshold(&self) -> Duration {
        Duration::from_millis(self.data_request_threshold_ms)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    pub fn clock_interval(&self) -> Duration {
        Duration::from_millis(self.clock_interval_ms)
    }

    pub fn clock_sample_interval(&self) -> Duration {
        Duration::from_millis(self.clock_sample_interval_ms)
    }

    /// 流间同步阈值 (halt_on, halt_off)
    pub fn stream_thresholds(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.stream_halt_on_ms),
            Duration::from_millis(self.stream_halt_off_ms),
        )
    }

    /// 播放器时钟同步阈值 (halt_on, halt_off)
    pub fn player_thresholds(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.player_halt_on_ms),
            Duration::from_millis(self.player_halt_off_ms),
        )
    }

    pub fn discontinuity_threshold(&self) -> Duration {
        Duration::from_millis(self.discontinuity_threshold_ms)
    }

    pub fn not_prepared_retry(&self) -> Duration {
        Duration::from_millis(self.not_prepared_retry_ms)
    }

    pub fn full_retry(&self) -> Duration {
        Duration::from_millis(self.full_retry_ms)
    }

    pub fn buffering_hold(&self) -> Duration {
        Duration::from_millis(self.buffering_hold_ms)
    }

    pub fn observed_packet_ttl(&self) -> Duration {
        Duration::from_millis(self.observed_packet_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = PipelineConfig::from_json_str(r#"{ "buffer_duration_ms": 4000 }"#).unwrap();
        assert_eq!(config.buffer_duration(), Duration::from_secs(4));
        assert_eq!(config.full_retry(), Duration::from_millis(500));
    }

    #[test]
    fn test_rejects_inverted_hysteresis() {
        let result = PipelineConfig::from_json_str(
            r#"{ "player_halt_on_ms": 1000, "player_halt_off_ms": 1000 }"#,
        );
        assert!(matches!(result, Err(PlayerError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "clock_interval_ms": 20, "stream_halt_on_ms": 800 }}"#).unwrap();
        let config = PipelineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.clock_interval(), Duration::from_millis(20));
        assert_eq!(config.stream_thresholds().0, Duration::from_millis(800));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = PipelineConfig::from_json_file("/nonexistent/pipeline.json");
        assert!(matches!(result, Err(PlayerError::IoError(_))));
    }
}

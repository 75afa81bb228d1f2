use crate::core::{BufferReport, StreamDataState, StreamType};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn to_ticks(duration: Duration) -> i64 {
    duration.as_micros().min(i64::MAX as u128) as i64
}

fn from_ticks(ticks: i64) -> Duration {
    Duration::from_micros(ticks.max(0) as u64)
}

/// 缓冲量计数器（原子，可跨线程读取）
///
/// 单位为微秒。数据进入时减少、数据送出时增加，
/// 与 `StreamBuffer` 共享，用于诊断读取填充率。
#[derive(Clone, Debug)]
pub struct BufferGauge {
    stream: StreamType,
    available: Arc<AtomicI64>,
    max: Arc<AtomicI64>,
}

impl BufferGauge {
    fn new(stream: StreamType, max_duration: Duration) -> Self {
        let max = to_ticks(max_duration);
        Self {
            stream,
            available: Arc::new(AtomicI64::new(max)),
            max: Arc::new(AtomicI64::new(max)),
        }
    }

    pub fn stream(&self) -> StreamType {
        self.stream
    }

    /// 剩余可用时长（微秒，可能为负）
    pub fn available_ticks(&self) -> i64 {
        self.available.load(Ordering::SeqCst)
    }

    pub fn max_duration(&self) -> Duration {
        from_ticks(self.max.load(Ordering::SeqCst))
    }

    /// 已缓冲时长
    pub fn buffered(&self) -> Duration {
        from_ticks(self.max.load(Ordering::SeqCst) - self.available_ticks())
    }

    /// 缓冲填充百分比 (0.0 - 100.0)，保留两位小数
    pub fn fill_percent(&self) -> f64 {
        let max = self.max.load(Ordering::SeqCst);
        if max <= 0 {
            return 0.0;
        }
        let fill = (max - self.available_ticks()) as f64 / max as f64 * 100.0;
        (fill * 100.0).round() / 100.0
    }
}

/// 单个基本流的缓冲统计
///
/// 通过送入/送出数据包的 DTS 推算缓冲时长：
/// `available = max_duration - (clock_in - clock_out)`
pub struct StreamBuffer {
    stream: StreamType,
    gauge: BufferGauge,
    clock_in: Option<Duration>,
    clock_out: Option<Duration>,
    eos_dts: Option<Duration>,
    report_full: AtomicBool,
    discontinuity_threshold: Duration,
}

impl StreamBuffer {
    pub fn new(stream: StreamType, max_duration: Duration, discontinuity_threshold: Duration) -> Self {
        info!("{}: 缓冲区大小 {:?}", stream, max_duration);
        Self {
            stream,
            gauge: BufferGauge::new(stream, max_duration),
            clock_in: None,
            clock_out: None,
            eos_dts: None,
            report_full: AtomicBool::new(false),
            discontinuity_threshold,
        }
    }

    pub fn stream(&self) -> StreamType {
        self.stream
    }

    pub fn gauge(&self) -> BufferGauge {
        self.gauge.clone()
    }

    pub fn clock_in(&self) -> Option<Duration> {
        self.clock_in
    }

    pub fn clock_out(&self) -> Option<Duration> {
        self.clock_out
    }

    pub fn eos_dts(&self) -> Option<Duration> {
        self.eos_dts
    }

    pub fn available_ticks(&self) -> i64 {
        self.gauge.available_ticks()
    }

    pub fn max_duration(&self) -> Duration {
        self.gauge.max_duration()
    }

    /// 计算时钟增量；首包或不连续时返回 None
    fn clock_step(&self, last: Option<Duration>, dts: Duration, direction: &str) -> Option<Duration> {
        let last = last?;
        if dts < last || dts - last > self.discontinuity_threshold {
            warn!(
                "{}: DTS 不连续! last DTS {} {:?} packet DTS {:?}，重新定基准",
                self.stream, direction, last, dts
            );
            return None;
        }
        Some(dts - last)
    }

    /// 数据包进入缓冲
    pub fn data_in(&mut self, dts: Duration) {
        if let Some(step) = self.clock_step(self.clock_in, dts, "in") {
            self.gauge.available.fetch_sub(to_ticks(step), Ordering::SeqCst);
        }
        self.clock_in = Some(dts);
    }

    /// 数据包送出缓冲（已提交到解码器）
    pub fn data_out(&mut self, dts: Duration) {
        if let Some(step) = self.clock_step(self.clock_out, dts, "out") {
            self.gauge.available.fetch_add(to_ticks(step), Ordering::SeqCst);
        }
        self.clock_out = Some(dts);
    }

    /// 记录 EOS 位置
    pub fn mark_eos(&mut self) {
        self.eos_dts = self.clock_in;
        info!("{}: EOS DTS {:?}", self.stream, self.eos_dts);
    }

    /// 当前数据需求
    pub fn data_request(&self) -> StreamDataState {
        let requested = if self.report_full.load(Ordering::SeqCst) {
            Duration::ZERO
        } else {
            from_ticks(self.available_ticks())
        };

        StreamDataState {
            requested_duration: requested,
            is_buffer_empty: self.is_buffer_empty(),
        }
    }

    /// 缓冲区已空：送出追上送入，且不是停在 EOS 上
    ///
    /// 尚未收到任何数据包时不视为空。
    pub fn is_buffer_empty(&self) -> bool {
        self.clock_in.is_some() && self.clock_in == self.clock_out && self.eos_dts != self.clock_out
    }

    /// EOS 已进入且剩余数据都在缓冲范围内，无需再请求数据
    pub fn is_data_complete(&self) -> bool {
        match (self.eos_dts, self.clock_out) {
            (Some(eos), Some(out)) => eos.saturating_sub(out) <= self.max_duration(),
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// 对外报告缓冲已满（Seek 预填充期间抑制数据请求）
    pub fn report_full_buffer(&self) {
        info!("{}: 报告缓冲已满", self.stream);
        self.report_full.store(true, Ordering::SeqCst);
    }

    /// 恢复报告实际缓冲量
    pub fn report_actual_buffer(&self) {
        info!("{}: 报告实际缓冲量", self.stream);
        self.report_full.store(false, Ordering::SeqCst);
    }

    pub fn is_reporting_full(&self) -> bool {
        self.report_full.load(Ordering::SeqCst)
    }

    /// 调整最大缓冲时长，保持已缓冲量不变
    pub fn update_max_duration(&mut self, new_duration: Duration) {
        let previous = self.gauge.max.swap(to_ticks(new_duration), Ordering::SeqCst);
        let delta = to_ticks(new_duration) - previous;
        let available = self.gauge.available.fetch_add(delta, Ordering::SeqCst) + delta;
        info!(
            "{}: 缓冲区大小 {:?} -> {:?}，可用 {:?}",
            self.stream,
            from_ticks(previous),
            new_duration,
            from_ticks(available)
        );
    }

    /// 重置缓冲统计
    ///
    /// `flush == false` 时保留 EOS 位置（非冲刷型重置）
    pub fn reset(&mut self, flush: bool) {
        info!("{}: 重置缓冲 (flush: {})", self.stream, flush);
        let max = self.gauge.max.load(Ordering::SeqCst);
        self.gauge.available.store(max, Ordering::SeqCst);
        self.clock_in = None;
        self.clock_out = None;
        if flush {
            self.eos_dts = None;
        }
    }

    pub fn report(&self) -> BufferReport {
        BufferReport {
            stream: self.stream,
            buffered: self.gauge.buffered(),
            max_duration: self.max_duration(),
            fill_percent: self.gauge.fill_percent(),
            clock_in: self.clock_in,
            clock_out: self.clock_out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn buffer() -> StreamBuffer {
        StreamBuffer::new(StreamType::Audio, secs(10), secs(5))
    }

    #[test]
    fn test_fill_to_zero() {
        let mut buffer = buffer();
        for dts in 0..=10 {
            buffer.data_in(secs(dts));
        }
        assert_eq!(buffer.available_ticks(), 0);
        assert_eq!(buffer.data_request().requested_duration, Duration::ZERO);
        assert_eq!(buffer.report().fill_percent, 100.0);

        // 超出最大缓冲后仍报告 0
        buffer.data_in(secs(11));
        assert!(buffer.available_ticks() < 0);
        assert_eq!(buffer.data_request().requested_duration, Duration::ZERO);
    }

    #[test]
    fn test_conservation_over_random_walk() {
        let mut rng = rand::thread_rng();
        let mut buffer = buffer();
        let max = to_ticks(secs(10));
        let mut dts_in = Duration::ZERO;
        let mut dts_out = Duration::ZERO;
        buffer.data_in(dts_in);
        buffer.data_out(dts_out);

        for _ in 0..1_000 {
            if rng.gen_bool(0.5) {
                dts_in += Duration::from_millis(rng.gen_range(0..200));
                buffer.data_in(dts_in);
            } else if dts_out < dts_in {
                let step = Duration::from_millis(rng.gen_range(0..200)).min(dts_in - dts_out);
                dts_out += step;
                buffer.data_out(dts_out);
            }
            let expected = max - to_ticks(buffer.clock_in().unwrap() - buffer.clock_out().unwrap());
            assert_eq!(buffer.available_ticks(), expected);
        }
    }

    #[test]
    fn test_backward_dts_reseeds_without_accounting() {
        let mut buffer = buffer();
        buffer.data_in(secs(5));
        buffer.data_in(secs(6));
        let before = buffer.available_ticks();

        buffer.data_in(secs(1));
        assert_eq!(buffer.available_ticks(), before);
        assert_eq!(buffer.clock_in(), Some(secs(1)));

        buffer.data_in(secs(2));
        assert_eq!(buffer.available_ticks(), before - to_ticks(secs(1)));
    }

    #[test]
    fn test_large_forward_jump_is_discontinuity() {
        let mut buffer = buffer();
        buffer.data_in(secs(0));
        buffer.data_in(secs(60));
        assert_eq!(buffer.available_ticks(), to_ticks(secs(10)));
        assert_eq!(buffer.clock_in(), Some(secs(60)));
    }

    #[test]
    fn test_buffer_empty_predicate() {
        let mut buffer = buffer();
        assert!(!buffer.is_buffer_empty());

        buffer.data_in(secs(1));
        assert!(!buffer.is_buffer_empty());

        buffer.data_out(secs(1));
        assert!(buffer.is_buffer_empty());

        buffer.data_in(secs(2));
        assert!(!buffer.is_buffer_empty());

        // 停在 EOS 上不算缓冲不足
        buffer.mark_eos();
        buffer.data_out(secs(2));
        assert!(!buffer.is_buffer_empty());
        assert!(buffer.is_data_complete());
    }

    #[test]
    fn test_report_full_suppresses_request() {
        let buffer = buffer();
        assert_eq!(buffer.data_request().requested_duration, secs(10));
        buffer.report_full_buffer();
        assert_eq!(buffer.data_request().requested_duration, Duration::ZERO);
        buffer.report_actual_buffer();
        assert_eq!(buffer.data_request().requested_duration, secs(10));
    }

    #[test]
    fn test_update_max_duration_keeps_buffered() {
        let mut buffer = buffer();
        buffer.data_in(secs(0));
        buffer.data_in(secs(4));
        assert_eq!(buffer.gauge().buffered(), secs(4));

        buffer.update_max_duration(secs(20));
        assert_eq!(buffer.gauge().buffered(), secs(4));
        assert_eq!(buffer.data_request().requested_duration, secs(16));
        assert_eq!(buffer.report().fill_percent, 20.0);
    }

    #[test]
    fn test_reset_keeps_eos_unless_flushed() {
        let mut buffer = buffer();
        buffer.data_in(secs(3));
        buffer.mark_eos();

        buffer.reset(false);
        assert_eq!(buffer.eos_dts(), Some(secs(3)));
        assert_eq!(buffer.clock_in(), None);
        assert_eq!(buffer.available_ticks(), to_ticks(secs(10)));

        buffer.reset(true);
        assert_eq!(buffer.eos_dts(), None);
    }
}

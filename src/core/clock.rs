use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 播放时钟 - 以墙上时间推进的解码器时钟
///
/// 未启动前返回 `None`（解码器尚无时钟），启动后从 `base` 开始推进，暂停时冻结。
#[derive(Clone)]
pub struct PlaybackClock {
    inner: Arc<Mutex<ClockInner>>,
}

struct ClockInner {
    base: Duration,          // 基准时间
    base_instant: Instant,   // 基准时刻
    running: bool,
    started: bool,
    paused_at: Duration,     // 暂停时的位置
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockInner {
                base: Duration::ZERO,
                base_instant: Instant::now(),
                running: false,
                started: false,
                paused_at: Duration::ZERO,
            })),
        }
    }

    /// 获取当前时钟，未启动返回 None
    pub fn now(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        if !inner.started {
            return None;
        }
        Some(Self::now_unlocked(&inner))
    }

    /// 设置时钟位置（Seek 后使用）
    pub fn set_time(&self, position: Duration) {
        let mut inner = self.inner.lock();
        inner.base = position;
        inner.base_instant = Instant::now();
        inner.paused_at = position;
    }

    /// 开始/继续推进
    pub fn play(&self) {
        let mut inner = self.inner.lock();
        if !inner.running {
            inner.base = inner.paused_at;
            inner.base_instant = Instant::now();
            inner.running = true;
            inner.started = true;
        }
    }

    /// 暂停推进
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if inner.running {
            inner.paused_at = Self::now_unlocked(&inner);
            inner.running = false;
        }
    }

    /// 停止并回到无时钟状态
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.base = Duration::ZERO;
        inner.paused_at = Duration::ZERO;
        inner.base_instant = Instant::now();
        inner.running = false;
        inner.started = false;
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    fn now_unlocked(inner: &ClockInner) -> Duration {
        if inner.running {
            inner.base + inner.base_instant.elapsed()
        } else {
            inner.paused_at
        }
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

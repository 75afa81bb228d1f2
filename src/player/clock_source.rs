use crate::core::{CancelToken, EventBus};
use crossbeam::atomic::AtomicCell;
use crossbeam_channel::Receiver;
use log::{debug, info};
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 读取解码器时钟，解码器尚无时钟时返回 None
pub type ClockReader = Arc<dyn Fn() -> Option<Duration> + Send + Sync>;

/// 播放器时钟源
///
/// 按固定周期轮询解码器时钟，向订阅者发布单调不减的时钟值。
/// 解码器时钟缺失或回退时不发布。
pub struct PlayerClockSource {
    reader: ClockReader,
    interval: Duration,
    handle: ClockHandle,
    token: Option<CancelToken>,
    worker: Option<JoinHandle<()>>,
}

/// 时钟订阅句柄（可克隆，交给同步器等消费方）
#[derive(Clone)]
pub struct ClockHandle {
    bus: EventBus<Duration>,
    last: Arc<AtomicCell<Option<Duration>>>,
}

impl ClockHandle {
    pub fn new() -> Self {
        Self {
            bus: EventBus::new(),
            last: Arc::new(AtomicCell::new(None)),
        }
    }

    pub fn subscribe(&self) -> Receiver<Duration> {
        self.bus.subscribe()
    }

    /// 最近一次有效的时钟值
    pub fn last_clock(&self) -> Option<Duration> {
        self.last.load()
    }

    /// 提交一个时钟读数，只有前进时才发布
    pub fn offer(&self, clock: Duration) -> bool {
        match self.last.load() {
            Some(previous) if clock < previous => {
                debug!("播放器时钟回退 {:?} -> {:?}，忽略", previous, clock);
                false
            }
            Some(previous) if clock == previous => false,
            _ => {
                self.last.store(Some(clock));
                self.bus.publish(clock);
                true
            }
        }
    }

    fn reset(&self) {
        self.last.store(None);
    }
}

impl Default for ClockHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayerClockSource {
    pub fn new(reader: ClockReader, interval: Duration) -> Self {
        Self {
            reader,
            interval,
            handle: ClockHandle::new(),
            token: None,
            worker: None,
        }
    }

    /// 启动轮询线程（已启动时忽略）
    pub fn start(&mut self) {
        if self.worker.is_some() {
            return;
        }

        let token = CancelToken::new();
        let reader = Arc::clone(&self.reader);
        let handle = self.handle.clone();
        let interval = self.interval;
        let worker_token = token.clone();

        self.worker = Some(thread::spawn(move || {
            info!("{} ⏰ 播放器时钟轮询启动 (周期 {:?})", log_ctx(), interval);
            loop {
                if let Some(clock) = reader() {
                    handle.offer(clock);
                }
                if worker_token.sleep(interval).is_err() {
                    break;
                }
            }
            info!("{} 🛑 播放器时钟轮询退出", log_ctx());
        }));
        self.token = Some(token);
    }

    pub fn stop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn handle(&self) -> ClockHandle {
        self.handle.clone()
    }

    pub fn subscribe(&self) -> Receiver<Duration> {
        self.handle.subscribe()
    }

    pub fn last_clock(&self) -> Option<Duration> {
        self.handle.last_clock()
    }

    /// 清除最近值（Seek 后时钟从新位置开始）
    pub fn reset(&self) {
        self.handle.reset();
    }
}

impl Drop for PlayerClockSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_publishes_monotone_values() {
        let value = Arc::new(AtomicCell::new(None::<Duration>));
        let reader_value = Arc::clone(&value);
        let mut source = PlayerClockSource::new(Arc::new(move || reader_value.load()), ms(5));
        let clock = source.subscribe();
        source.start();

        assert!(clock.recv_timeout(ms(50)).is_err());

        value.store(Some(ms(1000)));
        assert_eq!(clock.recv_timeout(Duration::from_secs(5)), Ok(ms(1000)));

        value.store(Some(ms(500)));
        assert!(clock.recv_timeout(ms(50)).is_err());
        assert_eq!(source.last_clock(), Some(ms(1000)));

        value.store(Some(ms(2000)));
        assert_eq!(clock.recv_timeout(Duration::from_secs(5)), Ok(ms(2000)));

        source.stop();
        assert!(!source.is_running());
    }

    #[test]
    fn test_handle_offer_is_monotone() {
        let handle = ClockHandle::new();
        let rx = handle.subscribe();
        assert!(handle.offer(ms(10)));
        assert!(!handle.offer(ms(10)));
        assert!(!handle.offer(ms(5)));
        assert!(handle.offer(ms(20)));
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![ms(10), ms(20)]);
    }

    #[test]
    fn test_reset_allows_new_position() {
        let value = Arc::new(AtomicCell::new(Some(ms(3000))));
        let reader_value = Arc::clone(&value);
        let mut source = PlayerClockSource::new(Arc::new(move || reader_value.load()), ms(5));
        let clock = source.subscribe();
        source.start();
        assert_eq!(clock.recv_timeout(Duration::from_secs(5)), Ok(ms(3000)));

        source.stop();
        source.reset();
        value.store(Some(ms(100)));
        source.start();
        assert_eq!(clock.recv_timeout(Duration::from_secs(5)), Ok(ms(100)));
    }
}

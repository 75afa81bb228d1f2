use crate::core::error::{PlayerError, Result};
use crossbeam_channel::{after, bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 取消令牌
///
/// 取消时丢弃内部发送端，所有持有 `signal()` 的等待方立即被唤醒，
/// 可直接放进 `select!` 与其他通道一起等待。
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    cancelled: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(tx)),
                signal: rx,
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.trigger.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// 取消后变为就绪（断开）的接收端
    pub fn signal(&self) -> &Receiver<()> {
        &self.inner.signal
    }

    /// 已取消时返回 `Err(Cancelled)`
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PlayerError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// 可中断的睡眠
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        self.check()?;
        select! {
            recv(self.signal()) -> _ => Err(PlayerError::Cancelled),
            recv(after(duration)) -> _ => Ok(()),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

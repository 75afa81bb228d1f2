use crate::core::{DecoderState, EventBus};
use crate::player::transfer_pump::DecoderSink;
use crossbeam_channel::Receiver;
use log::info;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// 暂停原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    /// 用户暂停
    Pause,
    /// 缓冲不足
    Buffering,
}

impl fmt::Display for SuspendReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuspendReason::Pause => f.write_str("Pause"),
            SuspendReason::Buffering => f.write_str("Buffering"),
        }
    }
}

#[derive(Default)]
struct ArbiterState {
    suspend_count: u32,
    is_paused: bool,
    async_op_running: bool,
}

/// 暂停/恢复仲裁
///
/// 多个独立的暂停来源（用户暂停、缓冲）按引用计数合并：
/// 计数 0→1 时暂停解码器，1→0 时恢复解码器。
pub struct SuspendResumeArbiter {
    state: Mutex<ArbiterState>,
    decoder: Arc<dyn DecoderSink>,
    progress: EventBus<u8>,
}

impl SuspendResumeArbiter {
    pub fn new(decoder: Arc<dyn DecoderSink>) -> Self {
        Self {
            state: Mutex::new(ArbiterState::default()),
            decoder,
            progress: EventBus::new(),
        }
    }

    /// 缓冲进度（0 = 开始缓冲，100 = 缓冲完成）
    pub fn subscribe_progress(&self) -> Receiver<u8> {
        self.progress.subscribe()
    }

    pub fn suspend(&self, reason: SuspendReason) -> bool {
        let mut state = self.state.lock();
        self.suspend_locked(&mut state, reason)
    }

    pub fn resume(&self, reason: SuspendReason) -> bool {
        let mut state = self.state.lock();
        self.resume_locked(&mut state, reason)
    }

    fn suspend_locked(&self, state: &mut ArbiterState, reason: SuspendReason) -> bool {
        let decoder_state = self.decoder.state();
        info!(
            "⏸ 暂停请求 ({}): 解码器 {:?} 计数 {}",
            reason, decoder_state, state.suspend_count
        );
        match decoder_state {
            DecoderState::Playing => {
                state.suspend_count += 1;
                if state.suspend_count != 1 {
                    return false;
                }
                self.decoder.pause();
                true
            }
            DecoderState::Paused => {
                state.suspend_count += 1;
                false
            }
            _ => false,
        }
    }

    fn resume_locked(&self, state: &mut ArbiterState, reason: SuspendReason) -> bool {
        let decoder_state = self.decoder.state();
        info!(
            "▶ 恢复请求 ({}): 解码器 {:?} 计数 {}",
            reason, decoder_state, state.suspend_count
        );
        if decoder_state != DecoderState::Paused {
            return false;
        }

        state.suspend_count = state.suspend_count.saturating_sub(1);
        if state.suspend_count > 0 || state.async_op_running {
            return false;
        }
        self.decoder.resume();
        true
    }

    /// 用户暂停（已暂停时忽略）
    pub fn request_pause(&self) -> bool {
        let mut state = self.state.lock();
        if state.is_paused {
            return false;
        }
        state.is_paused = true;
        self.suspend_locked(&mut state, SuspendReason::Pause)
    }

    /// 用户播放（未暂停时忽略）
    pub fn request_play(&self) -> bool {
        let mut state = self.state.lock();
        if !state.is_paused {
            return false;
        }
        state.is_paused = false;
        self.resume_locked(&mut state, SuspendReason::Pause)
    }

    /// 缓冲开始/结束，实际发生暂停/恢复时发布缓冲进度
    pub fn request_buffering(&self, needed: bool) -> bool {
        let mut state = self.state.lock();
        if needed {
            if !self.suspend_locked(&mut state, SuspendReason::Buffering) {
                return false;
            }
            self.progress.publish(0);
            return true;
        }

        if !self.resume_locked(&mut state, SuspendReason::Buffering) {
            return false;
        }
        self.progress.publish(100);
        true
    }

    /// Seek 等异步操作期间，计数归零也不恢复解码器
    pub fn set_async_op_running(&self, running: bool) {
        self.state.lock().async_op_running = running;
    }

    /// 异步操作结束，执行期间被推迟的恢复
    pub fn finish_async_op(&self) -> bool {
        let mut state = self.state.lock();
        state.async_op_running = false;
        if state.suspend_count > 0 || self.decoder.state() != DecoderState::Paused {
            return false;
        }
        info!("▶ 异步操作结束，恢复解码器");
        self.decoder.resume();
        true
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().is_paused
    }

    pub fn suspend_count(&self) -> u32 {
        self.state.lock().suspend_count
    }

    /// 停止时清零
    pub fn reset(&self) {
        info!("重置暂停/恢复状态");
        *self.state.lock() = ArbiterState::default();
    }
}

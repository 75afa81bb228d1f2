use crate::core::{CancelToken, PlayerError, Result};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use log::{debug, info, warn};
use std::process;
use std::thread::{self, JoinHandle};

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 任务优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPriority {
    /// 控制面任务（配置、事件开关、周期统计）
    High,
    /// 数据面任务（数据包进出、重置），按提交顺序执行
    Normal,
}

/// 可投递到任务通道的任务
pub trait Job: Send + 'static {
    fn priority(&self) -> JobPriority;

    /// 日志用名称
    fn name(&self) -> &'static str;
}

/// 任务投递端（可克隆，供其他线程使用）
pub struct JobSender<J: Job> {
    high_tx: Sender<J>,
    normal_tx: Sender<J>,
}

impl<J: Job> JobSender<J> {
    pub fn send(&self, job: J) -> Result<()> {
        let tx = match job.priority() {
            JobPriority::High => &self.high_tx,
            JobPriority::Normal => &self.normal_tx,
        };
        tx.send(job).map_err(|_| PlayerError::ChannelClosed)
    }
}

impl<J: Job> Clone for JobSender<J> {
    fn clone(&self) -> Self {
        Self {
            high_tx: self.high_tx.clone(),
            normal_tx: self.normal_tx.clone(),
        }
    }
}

/// 优先级任务通道
///
/// 单消费者线程串行执行任务，顺序为（优先级，提交顺序）。
/// 每执行完一个任务都会重新检查高优先级队列。
pub struct PriorityJobChannel<J: Job> {
    name: String,
    sender: JobSender<J>,
    token: CancelToken,
    worker: Option<JoinHandle<()>>,
}

impl<J: Job> PriorityJobChannel<J> {
    /// 启动消费者线程，`handler` 在该线程上依次执行任务
    pub fn start<F>(name: &str, handler: F) -> Self
    where
        F: FnMut(J) + Send + 'static,
    {
        let (high_tx, high_rx) = unbounded::<J>();
        let (normal_tx, normal_rx) = unbounded::<J>();
        let token = CancelToken::new();

        let worker_token = token.clone();
        let worker_name = name.to_string();
        let worker = thread::spawn(move || {
            Self::worker_loop(&worker_name, handler, high_rx, normal_rx, worker_token);
        });

        Self {
            name: name.to_string(),
            sender: JobSender { high_tx, normal_tx },
            token,
            worker: Some(worker),
        }
    }

    fn worker_loop<F>(
        name: &str,
        mut handler: F,
        high_rx: Receiver<J>,
        normal_rx: Receiver<J>,
        token: CancelToken,
    ) where
        F: FnMut(J),
    {
        info!("{} 🚀 任务通道 {} 启动", log_ctx(), name);
        let mut executed: u64 = 0;

        let mut run = |job: J, executed: &mut u64| {
            debug!("{} 执行任务 {}", name, job.name());
            handler(job);
            *executed += 1;
        };

        while !token.is_cancelled() {
            // 高优先级队列先清空
            if let Ok(job) = high_rx.try_recv() {
                run(job, &mut executed);
                continue;
            }

            let normal = select! {
                recv(token.signal()) -> _ => break,
                recv(high_rx) -> job => match job {
                    Ok(job) => {
                        run(job, &mut executed);
                        continue;
                    }
                    Err(_) => break,
                },
                recv(normal_rx) -> job => match job {
                    Ok(job) => job,
                    Err(_) => break,
                },
            };

            // select 在多个通道就绪时随机选择，普通任务执行前再让出给高优先级
            while let Ok(job) = high_rx.try_recv() {
                if token.is_cancelled() {
                    break;
                }
                run(job, &mut executed);
            }
            if token.is_cancelled() {
                break;
            }
            run(normal, &mut executed);
        }

        let dropped = high_rx.len() + normal_rx.len();
        if dropped > 0 {
            warn!("{} 任务通道 {} 退出时丢弃 {} 个未执行任务", log_ctx(), name, dropped);
        }
        info!("{} 🛑 任务通道 {} 退出（共执行 {} 个任务）", log_ctx(), name, executed);
    }

    /// 投递任务；通道已停止时返回 `ChannelClosed`
    pub fn enqueue(&self, job: J) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(PlayerError::ChannelClosed);
        }
        self.sender.send(job)
    }

    pub fn sender(&self) -> JobSender<J> {
        self.sender.clone()
    }

    /// 停止消费者线程，未执行的任务被丢弃
    pub fn stop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.worker.take() {
            info!("{} ⏳ 等待任务通道 {} 退出...", log_ctx(), self.name);
            if handle.join().is_err() {
                warn!("{} 任务通道 {} 线程 panic", log_ctx(), self.name);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some() && !self.token.is_cancelled()
    }
}

impl<J: Job> Drop for PriorityJobChannel<J> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::time::Duration;

    enum TestJob {
        Block(Receiver<()>),
        Control(&'static str),
        Data(&'static str),
    }

    impl Job for TestJob {
        fn priority(&self) -> JobPriority {
            match self {
                TestJob::Control(_) => JobPriority::High,
                _ => JobPriority::Normal,
            }
        }

        fn name(&self) -> &'static str {
            match self {
                TestJob::Block(_) => "block",
                TestJob::Control(name) | TestJob::Data(name) => *name,
            }
        }
    }

    #[test]
    fn test_priority_then_fifo() {
        let (out_tx, out_rx) = unbounded::<&'static str>();
        let (started_tx, started_rx) = bounded::<()>(1);

        let mut channel = PriorityJobChannel::start("test", move |job: TestJob| match job {
            TestJob::Block(release) => {
                let _ = started_tx.send(());
                let _ = release.recv();
                let _ = out_tx.send("block");
            }
            other => {
                let _ = out_tx.send(other.name());
            }
        });

        let (release_tx, release_rx) = bounded::<()>(1);
        channel.enqueue(TestJob::Block(release_rx)).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        channel.enqueue(TestJob::Data("d1")).unwrap();
        channel.enqueue(TestJob::Control("c1")).unwrap();
        channel.enqueue(TestJob::Data("d2")).unwrap();
        channel.enqueue(TestJob::Control("c2")).unwrap();
        channel.enqueue(TestJob::Data("d3")).unwrap();
        release_tx.send(()).unwrap();

        let order: Vec<_> = (0..6)
            .map(|_| out_rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, vec!["block", "c1", "c2", "d1", "d2", "d3"]);

        channel.stop();
        assert!(!channel.is_running());
        assert!(matches!(
            channel.enqueue(TestJob::Data("late")),
            Err(PlayerError::ChannelClosed)
        ));
    }

    #[test]
    fn test_sender_from_other_thread() {
        let (out_tx, out_rx) = unbounded::<&'static str>();
        let channel = PriorityJobChannel::start("test", move |job: TestJob| {
            let _ = out_tx.send(job.name());
        });

        let sender = channel.sender();
        thread::spawn(move || sender.send(TestJob::Data("remote")).unwrap())
            .join()
            .unwrap();
        assert_eq!(out_rx.recv_timeout(Duration::from_secs(5)), Ok("remote"));
    }
}

use crate::core::{CancelToken, Packet, PlayerError, Result, StreamType};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use log::{info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct StreamQueue {
    tx: Sender<Packet>,
    rx: Receiver<Packet>,
    enabled: AtomicBool,
}

/// 数据包存储
///
/// 每条管线各自持有，按流类型划分队列。生产者写入，传输线程阻塞读取。
pub struct PacketStorage {
    queues: Mutex<[Option<Arc<StreamQueue>>; StreamType::COUNT]>,
}

impl PacketStorage {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new([None, None]),
        }
    }

    /// 创建（或替换）流队列
    pub fn initialize(&self, stream: StreamType) {
        let (tx, rx) = unbounded();
        self.queues.lock()[stream.index()] = Some(Arc::new(StreamQueue {
            tx,
            rx,
            enabled: AtomicBool::new(true),
        }));
        info!("{}: 数据包队列已创建", stream);
    }

    fn queue(&self, stream: StreamType) -> Result<Arc<StreamQueue>> {
        self.queues.lock()[stream.index()]
            .clone()
            .ok_or(PlayerError::StreamNotInitialized(stream))
    }

    /// 检查流队列可写入（已初始化且未关闭）
    pub fn check_writable(&self, stream: StreamType) -> Result<()> {
        let queue = self.queue(stream)?;
        if !queue.enabled.load(Ordering::SeqCst) {
            return Err(PlayerError::StorageDisabled(stream));
        }
        Ok(())
    }

    pub fn add_packet(&self, packet: Packet) -> Result<()> {
        let stream = packet.stream;
        let queue = self.queue(stream)?;
        if !queue.enabled.load(Ordering::SeqCst) {
            warn!("{}: 队列已关闭，丢弃数据包 {:?}", stream, packet.dts);
            return Err(PlayerError::StorageDisabled(stream));
        }
        queue.tx.send(packet).map_err(|_| PlayerError::ChannelClosed)
    }

    /// 阻塞读取下一个数据包，取消时返回 `Cancelled`
    pub fn get_packet(&self, stream: StreamType, token: &CancelToken) -> Result<Packet> {
        let queue = self.queue(stream)?;
        token.check()?;
        select! {
            recv(token.signal()) -> _ => Err(PlayerError::Cancelled),
            recv(queue.rx) -> packet => packet.map_err(|_| PlayerError::ChannelClosed),
        }
    }

    /// 关闭写入
    pub fn disable(&self, stream: StreamType) {
        if let Ok(queue) = self.queue(stream) {
            queue.enabled.store(false, Ordering::SeqCst);
            info!("{}: 数据包队列关闭写入", stream);
        }
    }

    pub fn enable(&self, stream: StreamType) {
        if let Ok(queue) = self.queue(stream) {
            queue.enabled.store(true, Ordering::SeqCst);
            info!("{}: 数据包队列开放写入", stream);
        }
    }

    pub fn is_enabled(&self, stream: StreamType) -> bool {
        self.queue(stream)
            .map(|queue| queue.enabled.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// 清空队列，返回丢弃的数据包数
    pub fn empty(&self, stream: StreamType) -> usize {
        let Ok(queue) = self.queue(stream) else {
            return 0;
        };
        let dropped = queue.rx.try_iter().count();
        if dropped > 0 {
            info!("{}: 清空队列，丢弃 {} 个数据包", stream, dropped);
        }
        dropped
    }

    pub fn count(&self, stream: StreamType) -> usize {
        self.queue(stream).map(|queue| queue.rx.len()).unwrap_or(0)
    }
}

impl Default for PacketStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn packet(stream: StreamType, ms: u64) -> Packet {
        Packet::data(stream, Duration::from_millis(ms), vec![0; 8])
    }

    #[test]
    fn test_fifo_per_stream() {
        let storage = PacketStorage::new();
        storage.initialize(StreamType::Audio);
        storage.initialize(StreamType::Video);
        let token = CancelToken::new();

        storage.add_packet(packet(StreamType::Audio, 1)).unwrap();
        storage.add_packet(packet(StreamType::Video, 5)).unwrap();
        storage.add_packet(packet(StreamType::Audio, 2)).unwrap();

        assert_eq!(storage.count(StreamType::Audio), 2);
        let first = storage.get_packet(StreamType::Audio, &token).unwrap();
        let second = storage.get_packet(StreamType::Audio, &token).unwrap();
        assert_eq!(first.dts, Duration::from_millis(1));
        assert_eq!(second.dts, Duration::from_millis(2));
        assert_eq!(storage.count(StreamType::Video), 1);
    }

    #[test]
    fn test_uninitialized_stream() {
        let storage = PacketStorage::new();
        assert!(matches!(
            storage.add_packet(packet(StreamType::Video, 0)),
            Err(PlayerError::StreamNotInitialized(StreamType::Video))
        ));
    }

    #[test]
    fn test_disabled_queue_rejects_packets() {
        let storage = PacketStorage::new();
        storage.initialize(StreamType::Audio);
        storage.disable(StreamType::Audio);
        assert!(matches!(
            storage.add_packet(packet(StreamType::Audio, 0)),
            Err(PlayerError::StorageDisabled(StreamType::Audio))
        ));
        assert_eq!(storage.count(StreamType::Audio), 0);
        assert!(storage.check_writable(StreamType::Audio).is_err());

        storage.enable(StreamType::Audio);
        assert!(storage.add_packet(packet(StreamType::Audio, 0)).is_ok());
        assert_eq!(storage.empty(StreamType::Audio), 1);
    }

    #[test]
    fn test_get_packet_cancelled() {
        let storage = Arc::new(PacketStorage::new());
        storage.initialize(StreamType::Audio);
        let token = CancelToken::new();

        let reader = Arc::clone(&storage);
        let reader_token = token.clone();
        let handle = thread::spawn(move || reader.get_packet(StreamType::Audio, &reader_token));

        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(matches!(handle.join().unwrap(), Err(PlayerError::Cancelled)));
    }
}

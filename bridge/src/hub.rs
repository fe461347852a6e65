use async_trait::async_trait;
use conductive_shared::{Event, HubConfig};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// 推送连接的写端
///
/// 由传输层（WebSocket 等）实现，推送中心只通过它写文本和关闭连接
#[async_trait]
pub trait PushSink: Send {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()>;

    async fn close(&mut self);
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Broadcast worker has stopped")]
    Closed,
}

struct Registered {
    sink: Box<dyn PushSink>,
    /// 注册时的广播序号，序号更小的事件不投递给该连接
    joined_at: u64,
}

type Registry = Arc<Mutex<HashMap<ConnectionId, Registered>>>;

struct Sequenced {
    seq: u64,
    event: Event,
}

struct Sequencer {
    next: AtomicU64,
    tx: mpsc::Sender<Sequenced>,
    // 保证序号分配与入队顺序一致
    enqueue: Mutex<()>,
}

/// 广播队列的入队端，可克隆后交给 MQTT 入口使用
#[derive(Clone)]
pub struct EventPublisher {
    sequencer: Arc<Sequencer>,
}

impl EventPublisher {
    /// 事件入队；队列满时等待，不丢弃
    pub async fn publish(&self, event: Event) -> Result<(), HubError> {
        let _guard = self.sequencer.enqueue.lock().await;
        let seq = self.sequencer.next.fetch_add(1, Ordering::SeqCst);
        self.sequencer
            .tx
            .send(Sequenced { seq, event })
            .await
            .map_err(|_| HubError::Closed)
    }
}

/// 推送中心
///
/// - 持有所有在线推送连接，注册/注销/失败移除都在同一把锁内完成
/// - 单个投递任务按 FIFO 顺序取出事件，逐个写入当前已注册的连接
/// - 写失败（或超时）的连接立即移除并关闭，不影响其他连接
pub struct FanoutHub {
    registry: Registry,
    publisher: EventPublisher,
    write_timeout: Duration,
    worker: JoinHandle<()>,
}

impl FanoutHub {
    pub fn new(queue_capacity: usize, write_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));

        let worker = tokio::spawn(run_delivery(registry.clone(), rx, write_timeout));

        Self {
            registry,
            publisher: EventPublisher {
                sequencer: Arc::new(Sequencer {
                    next: AtomicU64::new(0),
                    tx,
                    enqueue: Mutex::new(()),
                }),
            },
            write_timeout,
            worker,
        }
    }

    pub fn from_config(config: &HubConfig) -> Self {
        Self::new(
            config.queue_capacity,
            Duration::from_secs(config.write_timeout_secs),
        )
    }

    pub fn publisher(&self) -> EventPublisher {
        self.publisher.clone()
    }

    /// 注册连接，只接收注册之后入队的事件
    pub async fn register(&self, sink: Box<dyn PushSink>) -> ConnectionId {
        let id = Uuid::new_v4();
        let mut registry = self.registry.lock().await;
        let joined_at = self.publisher.sequencer.next.load(Ordering::SeqCst);
        registry.insert(id, Registered { sink, joined_at });

        info!("Push client {} registered, total clients: {}", id, registry.len());
        id
    }

    /// 注销并关闭连接；不存在时为空操作，返回是否移除
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let mut registry = self.registry.lock().await;
        match registry.remove(&id) {
            Some(mut conn) => {
                close_sink(conn.sink.as_mut(), self.write_timeout).await;
                info!("Push client {} unregistered, total clients: {}", id, registry.len());
                true
            }
            None => {
                debug!("Push client {} already unregistered", id);
                false
            }
        }
    }

    pub async fn broadcast(&self, event: Event) -> Result<(), HubError> {
        self.publisher.publish(event).await
    }

    pub async fn count(&self) -> usize {
        self.registry.lock().await.len()
    }
}

impl Drop for FanoutHub {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_delivery(
    registry: Registry,
    mut rx: mpsc::Receiver<Sequenced>,
    write_timeout: Duration,
) {
    while let Some(Sequenced { seq, event }) = rx.recv().await {
        let text = match event.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize event for topic {}: {}", event.topic, e);
                continue;
            }
        };

        let mut registry = registry.lock().await;
        let mut failed = Vec::new();

        for (id, conn) in registry.iter_mut() {
            if seq < conn.joined_at {
                continue;
            }

            match tokio::time::timeout(write_timeout, conn.sink.send_text(text.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Failed to deliver event to push client {}: {}", id, e);
                    failed.push(*id);
                }
                Err(_) => {
                    warn!("Push client {} write timed out after {:?}", id, write_timeout);
                    failed.push(*id);
                }
            }
        }

        for id in &failed {
            if let Some(mut conn) = registry.remove(id) {
                close_sink(conn.sink.as_mut(), write_timeout).await;
            }
        }

        if !failed.is_empty() {
            info!(
                "Removed {} failed push client(s), total clients: {}",
                failed.len(),
                registry.len()
            );
        }
    }

    debug!("Broadcast queue closed, delivery worker exiting");
}

async fn close_sink(sink: &mut dyn PushSink, timeout: Duration) {
    if tokio::time::timeout(timeout, sink.close()).await.is_err() {
        debug!("Timed out closing push connection");
    }
}

use async_trait::async_trait;
use conductive_shared::{Event, MqttConfig};
use rumqttc::{
    AsyncClient, ClientError, ConnectionError, EventLoop, Incoming, MqttOptions, Outgoing, QoS,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::hub::EventPublisher;

// 请求通道容量；发布使用非阻塞入队，通道满时直接报错
const REQUEST_CHANNEL_CAPACITY: usize = 100;
const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("MQTT client is not connected")]
    NotConnected,

    #[error("Invalid MQTT broker address: {0}")]
    InvalidAddress(String),

    #[error("Unsupported MQTT QoS level: {0} (expected 0 or 1)")]
    UnsupportedQos(u8),

    #[error("MQTT event loop already started")]
    AlreadyStarted,

    #[error("MQTT client error: {0}")]
    Client(#[from] ClientError),

    #[error("MQTT transport error: {0}")]
    Transport(String),

    #[error("MQTT publish not acknowledged within {0:?}")]
    AckTimeout(Duration),
}

type AckSender = oneshot::Sender<Result<(), BrokerError>>;

// 等待确认的发布
//
// rumqttc 按请求入队顺序发出 PUBLISH，Outgoing::Publish 事件与入队顺序一一对应。
// 断线时仍在请求通道中的发布会在重连后发出，对应的等待者保留在 queued 中；
// 已发出的 QoS 1 发布重连后可能以原 pkid 重发，这些 pkid 记录在 replayed 中，
// 重发事件不消耗新的等待者。
#[derive(Default)]
struct PendingPublishes {
    queued: VecDeque<AckSender>,
    in_flight: HashMap<u16, AckSender>,
    replayed: HashSet<u16>,
}

impl PendingPublishes {
    fn push(&mut self, waiter: AckSender) {
        self.queued.push_back(waiter);
    }

    // 发布请求入队失败时撤回刚加入的等待者
    fn retract_last(&mut self) {
        self.queued.pop_back();
    }

    // QoS 0 的 pkid 为 0，写出即完成
    fn on_outgoing(&mut self, pkid: u16) {
        if pkid != 0 && self.replayed.remove(&pkid) {
            debug!("Outgoing publish {} is a replay after reconnect", pkid);
            return;
        }

        let Some(waiter) = self.queued.pop_front() else {
            debug!("Outgoing publish {} has no local waiter", pkid);
            return;
        };

        if pkid == 0 {
            let _ = waiter.send(Ok(()));
        } else {
            self.in_flight.insert(pkid, waiter);
        }
    }

    fn on_puback(&mut self, pkid: u16) {
        if let Some(waiter) = self.in_flight.remove(&pkid) {
            let _ = waiter.send(Ok(()));
        }
    }

    // 连接断开：已发出的发布失败，尚未发出的继续等待重连
    fn on_connection_lost(&mut self, reason: &str) {
        for (pkid, waiter) in self.in_flight.drain() {
            self.replayed.insert(pkid);
            let _ = waiter.send(Err(BrokerError::Transport(reason.to_string())));
        }
    }

    fn fail_all(&mut self, reason: &str) {
        self.replayed.clear();
        for waiter in self.queued.drain(..).chain(self.in_flight.drain().map(|(_, w)| w)) {
            let _ = waiter.send(Err(BrokerError::Transport(reason.to_string())));
        }
    }

    fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.queued.len() + self.in_flight.len()
    }
}

// 事件循环任务共享的状态
struct LoopState {
    client: AsyncClient,
    publisher: EventPublisher,
    is_connected: Arc<RwLock<bool>>,
    pending: Arc<Mutex<PendingPublishes>>,
    topics: Arc<RwLock<Vec<String>>>,
    subscribe_qos: QoS,
    reconnect_interval: Duration,
    stopping: Arc<AtomicBool>,
}

/// MQTT 入口适配器
///
/// 进程级单例：连接 broker、订阅主题，把收到的每条消息作为 [`Event`]
/// 推入推送中心的广播队列；同时为 WebSocket 客户端提供发布能力。
/// 断线重连由 rumqttc 事件循环完成，失败后按固定间隔重试。
pub struct BrokerAdapter {
    client: AsyncClient,
    event_loop: Mutex<Option<EventLoop>>,
    config: MqttConfig,
    publish_qos: QoS,
    subscribe_qos: QoS,
    publisher: EventPublisher,
    is_connected: Arc<RwLock<bool>>,
    pending: Arc<Mutex<PendingPublishes>>,
    topics: Arc<RwLock<Vec<String>>>,
    stopping: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerAdapter {
    pub fn new(config: MqttConfig, publisher: EventPublisher) -> Result<Self, BrokerError> {
        let (host, port) = config
            .broker_endpoint()
            .map_err(|e| BrokerError::InvalidAddress(e.to_string()))?;
        let publish_qos = qos_from_level(config.publish_qos)?;
        let subscribe_qos = qos_from_level(config.subscribe_qos)?;

        let mut mqtt_options = MqttOptions::new(config.client_id.clone(), host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        mqtt_options.set_clean_session(true);

        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        Ok(Self {
            client,
            event_loop: Mutex::new(Some(event_loop)),
            config,
            publish_qos,
            subscribe_qos,
            publisher,
            is_connected: Arc::new(RwLock::new(false)),
            pending: Arc::new(Mutex::new(PendingPublishes::default())),
            topics: Arc::new(RwLock::new(Vec::new())),
            stopping: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        })
    }

    /// 启动事件循环
    ///
    /// 不等待首次连接成功：broker 不可达时只记录日志，之后按重试间隔自动重连
    pub async fn connect(&self) -> Result<(), BrokerError> {
        let event_loop = self
            .event_loop
            .lock()
            .await
            .take()
            .ok_or(BrokerError::AlreadyStarted)?;

        info!("Connecting to MQTT broker: {}", self.config.broker);
        info!("Client ID: {}", self.config.client_id);

        let state = LoopState {
            client: self.client.clone(),
            publisher: self.publisher.clone(),
            is_connected: self.is_connected.clone(),
            pending: self.pending.clone(),
            topics: self.topics.clone(),
            subscribe_qos: self.subscribe_qos,
            reconnect_interval: Duration::from_secs(self.config.reconnect_interval_secs),
            stopping: self.stopping.clone(),
        };

        let handle = tokio::spawn(run_event_loop(event_loop, state));
        *self.task.lock().await = Some(handle);

        Ok(())
    }

    /// 订阅主题（至少一次）；未连接时记录下来，连接建立后自动订阅
    pub async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        {
            let mut topics = self.topics.write().await;
            if !topics.iter().any(|t| t == topic) {
                topics.push(topic.to_string());
            }
        }

        if self.is_connected().await {
            self.client
                .subscribe(topic, self.subscribe_qos)
                .await?;
        }

        info!("Subscribing to topic: {}", topic);
        Ok(())
    }

    /// 发布消息，等待写出（QoS 0）或 PUBACK（QoS 1）
    pub async fn publish(&self, topic: &str, payload: &str) -> Result<(), BrokerError> {
        if !self.is_connected().await {
            warn!("MQTT client not connected, cannot publish");
            return Err(BrokerError::NotConnected);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.push(tx);
            if let Err(e) = self.client.try_publish(
                topic,
                self.publish_qos,
                false,
                payload.as_bytes().to_vec(),
            ) {
                pending.retract_last();
                error!("MQTT publish error: {}", e);
                return Err(e.into());
            }
        }

        let timeout = Duration::from_secs(self.config.publish_timeout_secs);
        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::Transport("publish abandoned".to_string())),
            Err(_) => Err(BrokerError::AckTimeout(timeout)),
        };

        match &result {
            Ok(()) => info!("MQTT published - Topic: {}, Message: {}", topic, payload),
            Err(e) => error!("MQTT publish error: {}", e),
        }

        result
    }

    pub async fn is_connected(&self) -> bool {
        *self.is_connected.read().await
    }

    /// 发送 DISCONNECT 并停止事件循环
    pub async fn disconnect(&self) {
        self.stopping.store(true, Ordering::SeqCst);

        if let Err(e) = self.client.try_disconnect() {
            debug!("MQTT disconnect request not queued: {}", e);
        }

        if let Some(mut handle) = self.task.lock().await.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        *self.is_connected.write().await = false;
        self.pending.lock().await.fail_all("client disconnected");
        info!("Disconnected from MQTT broker");
    }
}

/// 推送网关向 broker 转发发布请求时使用的接口
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn is_connected(&self) -> bool;

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BrokerError>;
}

#[async_trait]
impl MessagePublisher for BrokerAdapter {
    async fn is_connected(&self) -> bool {
        BrokerAdapter::is_connected(self).await
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BrokerError> {
        BrokerAdapter::publish(self, topic, payload).await
    }
}

async fn run_event_loop(mut event_loop: EventLoop, state: LoopState) {
    loop {
        match event_loop.poll().await {
            Ok(rumqttc::Event::Incoming(Incoming::Publish(publish))) => {
                let event = Event::from_bytes(publish.topic.clone(), &publish.payload);
                debug!(
                    "Received MQTT message - Topic: {}, Payload: {}",
                    event.topic, event.payload
                );

                if state.publisher.publish(event).await.is_err() {
                    warn!("Broadcast queue closed, dropping MQTT message");
                }
            }
            Ok(rumqttc::Event::Incoming(Incoming::ConnAck(_))) => {
                info!("Connected to MQTT broker");
                *state.is_connected.write().await = true;
                resubscribe(&state).await;
            }
            Ok(rumqttc::Event::Incoming(Incoming::SubAck(suback))) => {
                info!("MQTT subscription acknowledged: {:?}", suback.return_codes);
            }
            Ok(rumqttc::Event::Incoming(Incoming::PubAck(puback))) => {
                state.pending.lock().await.on_puback(puback.pkid);
            }
            Ok(rumqttc::Event::Incoming(Incoming::Disconnect)) => {
                warn!("MQTT broker sent DISCONNECT");
                *state.is_connected.write().await = false;
            }
            Ok(rumqttc::Event::Outgoing(Outgoing::Publish(pkid))) => {
                state.pending.lock().await.on_outgoing(pkid);
            }
            Ok(rumqttc::Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT DISCONNECT sent");
            }
            Ok(other) => {
                debug!("MQTT event: {:?}", other);
            }
            Err(e) => {
                if state.stopping.load(Ordering::SeqCst) {
                    break;
                }
                on_connection_error(&state, &e).await;
                tokio::time::sleep(state.reconnect_interval).await;
            }
        }

        if state.stopping.load(Ordering::SeqCst) && !*state.is_connected.read().await {
            break;
        }
    }

    debug!("MQTT event loop stopped");
}

async fn on_connection_error(state: &LoopState, e: &ConnectionError) {
    let was_connected = {
        let mut connected = state.is_connected.write().await;
        std::mem::replace(&mut *connected, false)
    };

    if was_connected {
        error!("Connection lost: {}", e);
    } else {
        error!("Error connecting to MQTT broker: {}", e);
    }

    let mut pending = state.pending.lock().await;
    if pending.in_flight() > 0 {
        warn!("Failing {} in-flight MQTT publish(es)", pending.in_flight());
    }
    pending.on_connection_lost(&e.to_string());

    info!(
        "Retrying MQTT connection in {:?}",
        state.reconnect_interval
    );
}

// clean session 下每次 ConnAck 后重新订阅
async fn resubscribe(state: &LoopState) {
    let topics = state.topics.read().await.clone();
    for topic in topics {
        match state.client.try_subscribe(topic.as_str(), state.subscribe_qos) {
            Ok(()) => info!("Successfully subscribed to topic: {}", topic),
            Err(e) => error!("Error subscribing to topic {}: {}", topic, e),
        }
    }
}

// 不处理 PUBREC/PUBCOMP，只支持 QoS 0 和 1
fn qos_from_level(level: u8) -> Result<QoS, BrokerError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        other => Err(BrokerError::UnsupportedQos(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{FanoutHub, PushSink};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    struct ChannelSink(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl PushSink for ChannelSink {
        async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
            self.0.send(text)?;
            Ok(())
        }

        async fn close(&mut self) {}
    }

    // 读取一个 MQTT 控制报文，返回首字节和剩余部分
    async fn read_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let header = stream.read_u8().await.unwrap();
        let mut remaining = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.unwrap();
            remaining |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }

        let mut body = vec![0; remaining];
        stream.read_exact(&mut body).await.unwrap();
        (header, body)
    }

    fn unreachable_config() -> MqttConfig {
        MqttConfig {
            // 端口 1 上没有 broker
            broker: "tcp://127.0.0.1:1".to_string(),
            client_id: "adapter-test".to_string(),
            topic: "suit/telemetry".to_string(),
            keep_alive_secs: 60,
            reconnect_interval_secs: 1,
            publish_timeout_secs: 1,
            publish_qos: 0,
            subscribe_qos: 1,
        }
    }

    #[test]
    fn test_pending_publish_bookkeeping() {
        let mut pending = PendingPublishes::default();
        let (qos0_tx, mut qos0_rx) = oneshot::channel();
        let (qos1_tx, mut qos1_rx) = oneshot::channel();
        pending.push(qos0_tx);
        pending.push(qos1_tx);

        pending.on_outgoing(0);
        assert!(matches!(qos0_rx.try_recv(), Ok(Ok(()))));

        pending.on_outgoing(7);
        assert!(qos1_rx.try_recv().is_err());
        assert_eq!(pending.len(), 1);

        pending.on_puback(7);
        assert!(matches!(qos1_rx.try_recv(), Ok(Ok(()))));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_pending_publish_fail_all() {
        let mut pending = PendingPublishes::default();
        let (queued_tx, mut queued_rx) = oneshot::channel();
        let (flight_tx, mut flight_rx) = oneshot::channel();
        pending.push(flight_tx);
        pending.on_outgoing(3);
        pending.push(queued_tx);

        pending.fail_all("connection reset");

        assert!(matches!(queued_rx.try_recv(), Ok(Err(BrokerError::Transport(_)))));
        assert!(matches!(flight_rx.try_recv(), Ok(Err(BrokerError::Transport(_)))));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_retract_last_keeps_order() {
        let mut pending = PendingPublishes::default();
        let (first_tx, mut first_rx) = oneshot::channel();
        let (second_tx, _second_rx) = oneshot::channel();
        pending.push(first_tx);
        pending.push(second_tx);
        pending.retract_last();

        pending.on_outgoing(0);
        assert!(matches!(first_rx.try_recv(), Ok(Ok(()))));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_waiters_survive_reconnect_in_order() {
        let mut pending = PendingPublishes::default();
        let (sent_tx, mut sent_rx) = oneshot::channel();
        let (queued_tx, mut queued_rx) = oneshot::channel();
        pending.push(sent_tx);
        pending.on_outgoing(5);
        pending.push(queued_tx);

        pending.on_connection_lost("connection reset");
        assert!(matches!(sent_rx.try_recv(), Ok(Err(BrokerError::Transport(_)))));
        assert!(queued_rx.try_recv().is_err());

        // 重连后：先重发 pkid 5，再发出断线前排队的请求，最后是新请求
        let (fresh_tx, mut fresh_rx) = oneshot::channel();
        pending.push(fresh_tx);

        pending.on_outgoing(5);
        assert_eq!(pending.len(), 2);

        pending.on_outgoing(6);
        pending.on_puback(6);
        assert!(matches!(queued_rx.try_recv(), Ok(Ok(()))));
        assert!(fresh_rx.try_recv().is_err());

        pending.on_outgoing(7);
        pending.on_puback(7);
        assert!(matches!(fresh_rx.try_recv(), Ok(Ok(()))));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_qos_above_one_rejected() {
        let hub = FanoutHub::new(10, Duration::from_secs(1));

        let mut config = unreachable_config();
        config.publish_qos = 2;
        assert!(matches!(
            BrokerAdapter::new(config, hub.publisher()),
            Err(BrokerError::UnsupportedQos(2))
        ));

        let mut config = unreachable_config();
        config.subscribe_qos = 3;
        assert!(matches!(
            BrokerAdapter::new(config, hub.publisher()),
            Err(BrokerError::UnsupportedQos(3))
        ));
    }

    #[tokio::test]
    async fn test_connected_broker_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let hub = FanoutHub::new(10, Duration::from_secs(1));
        let (tx, mut delivered) = mpsc::unbounded_channel();
        hub.register(Box::new(ChannelSink(tx))).await;

        let mut config = unreachable_config();
        config.broker = format!("tcp://{}", addr);
        let adapter = BrokerAdapter::new(config, hub.publisher()).unwrap();
        adapter.subscribe("t").await.unwrap();
        adapter.connect().await.unwrap();

        let (mut broker, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("adapter never connected")
            .unwrap();

        let (header, _) = read_packet(&mut broker).await;
        assert_eq!(header, 0x10, "expected CONNECT");
        broker.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

        // ConnAck 之后自动订阅，QoS 1
        let (header, body) = read_packet(&mut broker).await;
        assert_eq!(header, 0x82, "expected SUBSCRIBE");
        assert_eq!(&body[2..], &[0x00, 0x01, b't', 0x01]);
        broker
            .write_all(&[0x90, 0x03, body[0], body[1], 0x01])
            .await
            .unwrap();

        broker.write_all(b"\x30\x08\x00\x01thello").await.unwrap();
        let pushed = tokio::time::timeout(Duration::from_secs(2), delivered.recv())
            .await
            .expect("event never reached the hub")
            .unwrap();
        assert_eq!(pushed, r#"{"topic":"t","payload":"hello"}"#);
        assert!(adapter.is_connected().await);

        adapter.publish("suit/cmd", "start").await.unwrap();
        let (header, body) = read_packet(&mut broker).await;
        assert_eq!(header, 0x30, "expected QoS 0 PUBLISH");
        assert_eq!(body, b"\x00\x08suit/cmdstart");

        adapter.disconnect().await;
        assert!(!adapter.is_connected().await);
    }

    #[tokio::test]
    async fn test_invalid_broker_address() {
        let hub = FanoutHub::new(10, Duration::from_secs(1));
        let mut config = unreachable_config();
        config.broker = "ws://localhost:9001".to_string();

        assert!(matches!(
            BrokerAdapter::new(config, hub.publisher()),
            Err(BrokerError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let hub = FanoutHub::new(10, Duration::from_secs(1));
        let adapter = BrokerAdapter::new(unreachable_config(), hub.publisher()).unwrap();

        assert!(!adapter.is_connected().await);
        assert!(matches!(
            adapter.publish("suit/cmd", "start").await,
            Err(BrokerError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_not_fatal() {
        let hub = FanoutHub::new(10, Duration::from_secs(1));
        let adapter = BrokerAdapter::new(unreachable_config(), hub.publisher()).unwrap();

        adapter.subscribe("suit/telemetry").await.unwrap();
        adapter.connect().await.unwrap();
        assert!(matches!(adapter.connect().await, Err(BrokerError::AlreadyStarted)));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!adapter.is_connected().await);
        assert!(matches!(
            adapter.publish("suit/cmd", "start").await,
            Err(BrokerError::NotConnected)
        ));

        adapter.disconnect().await;
        assert!(!adapter.is_connected().await);
    }
}

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use conductive_bridge::{MessagePublisher, PushSink};
use conductive_shared::ClientMessage;
use futures::{
    sink::SinkExt,
    stream::{SplitSink, Stream, StreamExt},
};
use tracing::{debug, info, warn};

use crate::app_state::AppState;

// WebSocket 写端，注册到推送中心
pub struct WsSink {
    sender: SplitSink<WebSocket, Message>,
}

impl WsSink {
    pub fn new(sender: SplitSink<WebSocket, Message>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl PushSink for WsSink {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
        self.sender.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.sender.send(Message::Close(None)).await;
        let _ = self.sender.close().await;
    }
}

// 连接结束的原因
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Closed,
    Errored(String),
}

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (sender, mut receiver) = socket.split();
    let id = state.hub.register(Box::new(WsSink::new(sender))).await;

    match read_loop(&mut receiver, state.broker.as_ref()).await {
        ConnectionOutcome::Closed => info!("WebSocket connection {} closed by client", id),
        ConnectionOutcome::Errored(reason) => warn!("WebSocket connection {} error: {}", id, reason),
    }

    state.hub.unregister(id).await;
}

/// 读取客户端消息直到连接关闭或出错
///
/// 只处理 `mqtt_publish` 命令，其余合法消息丢弃；无法解析的消息终止读取
pub async fn read_loop<S>(receiver: &mut S, broker: &dyn MessagePublisher) -> ConnectionOutcome
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => return ConnectionOutcome::Errored("non UTF-8 binary frame".to_string()),
            },
            Ok(Message::Close(_)) => return ConnectionOutcome::Closed,
            // Ping/Pong 由 axum 处理
            Ok(_) => continue,
            Err(e) => return ConnectionOutcome::Errored(e.to_string()),
        };

        match ClientMessage::parse(&text) {
            Ok(ClientMessage::Publish { topic, message }) => {
                forward_publish(broker, &topic, &message).await;
            }
            Ok(ClientMessage::Ignored) => {
                debug!("Ignoring client message: {}", text);
            }
            Err(e) => return ConnectionOutcome::Errored(format!("malformed message: {}", e)),
        }
    }

    ConnectionOutcome::Closed
}

// 发布失败只记录日志，不关闭连接
async fn forward_publish(broker: &dyn MessagePublisher, topic: &str, message: &str) {
    if !broker.is_connected().await {
        warn!("MQTT client not connected, cannot publish");
        return;
    }

    if let Err(e) = broker.publish(topic, message).await {
        warn!("MQTT publish error: {}", e);
    }
}

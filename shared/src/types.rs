use serde::{Deserialize, Serialize};

// Broker 消息事件
//
// 由 MQTT 入口构造，推送给所有 WebSocket 客户端，构造后不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub payload: String,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// 从原始 MQTT 负载构造事件，非 UTF-8 字节按有损方式转换
    pub fn from_bytes(topic: impl Into<String>, payload: &[u8]) -> Self {
        Self {
            topic: topic.into(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        }
    }

    /// 推送给浏览器的 JSON 文本 `{"topic": ..., "payload": ...}`
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// 客户端控制命令名
pub const MQTT_PUBLISH_COMMAND: &str = "mqtt_publish";

// WebSocket 客户端发来的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// `{"command": "mqtt_publish", "topic": ..., "message": ...}`，topic 和 message 均非空
    Publish { topic: String, message: String },
    /// 合法 JSON 对象但不是可识别的命令，直接丢弃
    Ignored,
}

impl ClientMessage {
    /// 解析客户端文本消息
    ///
    /// 非 JSON 或非 JSON 对象视为格式错误，调用方应关闭连接
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let map = match value {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(<serde_json::Error as serde::de::Error>::custom(format!(
                    "expected a JSON object, found {}",
                    json_kind(&other)
                )))
            }
        };

        if map.get("command").and_then(|v| v.as_str()) != Some(MQTT_PUBLISH_COMMAND) {
            return Ok(ClientMessage::Ignored);
        }

        let topic = map.get("topic").and_then(|v| v.as_str()).unwrap_or_default();
        let message = map.get("message").and_then(|v| v.as_str()).unwrap_or_default();

        if topic.is_empty() || message.is_empty() {
            return Ok(ClientMessage::Ignored);
        }

        Ok(ClientMessage::Publish {
            topic: topic.to_string(),
            message: message.to_string(),
        })
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

// 注入命令参数，发往设备的 JSON 格式
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectRequest {
    /// "quick" 或 "special"
    pub mode: String,
    pub amplitude: i64,
    /// 持续时间（毫秒）
    pub duration: i64,
}

// 设备命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    GetStatus,
    Inject(InjectRequest),
    Stop,
    SetAmplitude { value: i64 },
}

impl DeviceCommand {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceCommand::GetStatus => "get_status",
            DeviceCommand::Inject(_) => "inject",
            DeviceCommand::Stop => "stop",
            DeviceCommand::SetAmplitude { .. } => "set_amplitude",
        }
    }
}

// 健康检查响应
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub broker_connected: bool,
    pub connected_push_clients: usize,
}

impl HealthStatus {
    pub fn ok(broker_connected: bool, connected_push_clients: usize) -> Self {
        Self {
            status: "ok".to_string(),
            broker_connected,
            connected_push_clients,
        }
    }
}

// 网关错误响应体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub detail: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            detail: detail.into(),
        }
    }
}

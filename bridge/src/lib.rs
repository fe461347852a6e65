//! 消息桥：MQTT 入口适配器与推送中心
//!
//! 数据流：broker 消息 -> [`BrokerAdapter`] -> [`EventPublisher`] 广播队列
//! -> [`FanoutHub`] 投递任务 -> 每个已注册的 [`PushSink`]

pub mod hub;
pub mod mqtt_client;

pub use hub::{ConnectionId, EventPublisher, FanoutHub, HubError, PushSink};
pub use mqtt_client::{BrokerAdapter, BrokerError, MessagePublisher};

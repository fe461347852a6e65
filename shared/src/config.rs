use crate::command::BoundaryPolicy;
use anyhow::{Context, Result};
use config::{Config, Environment, File};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;

pub const DEFAULT_MQTT_PORT: u16 = 1883;

// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub mqtt: MqttConfig,
    pub device: DeviceConfig,
    pub hub: HubConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

// MQTT 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// `tcp://host:port`、`mqtt://host:port` 或 `host:port`
    pub broker: String,
    pub client_id: String,
    pub topic: String,
    pub keep_alive_secs: u64,
    pub reconnect_interval_secs: u64,
    pub publish_timeout_secs: u64,
    /// 0 或 1
    pub publish_qos: u8,
    pub subscribe_qos: u8,
}

impl MqttConfig {
    /// 解析 broker 地址为 (host, port)
    pub fn broker_endpoint(&self) -> Result<(String, u16)> {
        parse_broker_address(&self.broker)
    }
}

// 设备（ESP32）访问配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// AP 模式地址（设备自身热点），优先尝试
    pub ap_address: String,
    /// Station 模式地址（设备加入的路由网络），为空则不尝试
    pub station_address: String,
    pub request_timeout_secs: u64,
    pub boundary_policy: BoundaryPolicy,
}

// 推送中心配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    pub queue_capacity: usize,
    pub write_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
            },
            mqtt: MqttConfig {
                broker: "tcp://localhost:1884".to_string(),
                client_id: "go-mqtt-client".to_string(),
                topic: "golang-webserver/topic".to_string(),
                keep_alive_secs: 60,
                reconnect_interval_secs: 5,
                publish_timeout_secs: 5,
                publish_qos: 0,
                subscribe_qos: 1,
            },
            device: DeviceConfig {
                ap_address: "192.168.4.1".to_string(),
                station_address: "20.20.20.56".to_string(),
                request_timeout_secs: 5,
                boundary_policy: BoundaryPolicy::Permissive,
            },
            hub: HubConfig {
                queue_capacity: 100,
                write_timeout_secs: 10,
            },
        }
    }
}

// 旧版环境变量 -> 配置键
const LEGACY_ENV_KEYS: &[(&str, &str)] = &[
    ("PORT", "server.port"),
    ("MQTT_BROKER", "mqtt.broker"),
    ("MQTT_CLIENT_ID", "mqtt.client_id"),
    ("MQTT_TOPIC", "mqtt.topic"),
    ("ESP32_AP_IP", "device.ap_address"),
    ("ESP32_STATION_IP", "device.station_address"),
];

pub fn load_config() -> Result<AppConfig> {
    // 加载 .env 文件
    dotenv().ok();

    let mut builder = Config::builder()
        // 内置默认值
        .add_source(Config::try_from(&AppConfig::default())?)
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            File::with_name(&format!(
                "config/{}",
                env::var("ENV").unwrap_or_else(|_| "development".to_string())
            ))
            .required(false),
        )
        // APP__MQTT__TOPIC 形式的环境变量
        .add_source(
            Environment::with_prefix("APP")
                .separator("__")
                .try_parsing(true),
        );

    // 空值视为未设置
    for (var, key) in LEGACY_ENV_KEYS {
        let value = env::var(var).ok().filter(|v| !v.is_empty());
        builder = builder.set_override_option(*key, value)?;
    }

    let config: AppConfig = builder
        .build()?
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.mqtt.broker.trim().is_empty() {
        return Err(anyhow::anyhow!("MQTT broker address cannot be empty"));
    }

    if config.mqtt.client_id.trim().is_empty() {
        return Err(anyhow::anyhow!("MQTT client id cannot be empty"));
    }

    if config.mqtt.topic.trim().is_empty() {
        return Err(anyhow::anyhow!("MQTT topic cannot be empty"));
    }

    if config.mqtt.publish_qos > 1 || config.mqtt.subscribe_qos > 1 {
        return Err(anyhow::anyhow!("MQTT QoS must be 0 or 1"));
    }

    config.mqtt.broker_endpoint()?;

    if config.hub.queue_capacity == 0 {
        return Err(anyhow::anyhow!("Hub queue capacity must be greater than zero"));
    }

    if config.device.ap_address.trim().is_empty() && config.device.station_address.trim().is_empty() {
        return Err(anyhow::anyhow!("At least one device address must be configured"));
    }

    Ok(())
}

pub fn parse_broker_address(address: &str) -> Result<(String, u16)> {
    let address = address.trim();
    let with_scheme = if address.contains("://") {
        address.to_string()
    } else {
        format!("tcp://{}", address)
    };

    let url = url::Url::parse(&with_scheme)
        .with_context(|| format!("Invalid MQTT broker address: {}", address))?;

    match url.scheme() {
        "tcp" | "mqtt" => {}
        other => return Err(anyhow::anyhow!("Unsupported MQTT broker scheme: {}", other)),
    }

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| anyhow::anyhow!("MQTT broker address has no host: {}", address))?;

    Ok((host.to_string(), url.port().unwrap_or(DEFAULT_MQTT_PORT)))
}

pub mod command;
pub mod config;
pub mod types;

pub use command::{parse_command, BoundaryPolicy, CommandKind, CommandParseError};
pub use config::{load_config, validate_config, AppConfig, DeviceConfig, HubConfig, MqttConfig, ServerConfig};
pub use types::{ClientMessage, DeviceCommand, ErrorBody, Event, HealthStatus, InjectRequest};

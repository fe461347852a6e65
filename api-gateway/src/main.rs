use anyhow::{Context, Result};
use conductive_bridge::{BrokerAdapter, FanoutHub};
use conductive_gateway::{create_app, AppState, DeviceRouter};
use conductive_shared::load_config;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    // 加载配置
    let config = load_config()?;
    info!("Configuration loaded successfully");

    // 推送中心
    let hub = Arc::new(FanoutHub::from_config(&config.hub));

    // MQTT 入口，收到的消息直接进入推送中心的广播队列
    let broker = Arc::new(
        BrokerAdapter::new(config.mqtt.clone(), hub.publisher())
            .context("Failed to create MQTT client")?,
    );
    broker.subscribe(&config.mqtt.topic).await?;
    broker.connect().await?;

    // 设备命令路由
    let device = Arc::new(
        DeviceRouter::from_config(&config.device).context("Failed to build device HTTP client")?,
    );
    for endpoint in device.endpoints() {
        info!("Device endpoint {}: {}", endpoint.name, endpoint.address);
    }

    let app_state = AppState::new(
        hub.clone(),
        broker.clone(),
        device,
        config.device.boundary_policy,
    );
    let app = create_app(app_state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.server.host, config.server.port))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("🚀 CORE gateway listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    broker.disconnect().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

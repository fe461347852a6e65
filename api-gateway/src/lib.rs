//! CORE 网关：WebSocket 推送、设备命令路由与健康检查

pub mod app_state;
pub mod device_router;
pub mod handlers;
pub mod middleware;
pub mod websocket;

use axum::{middleware as axum_middleware, routing::get, Router};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub use app_state::AppState;
pub use device_router::{DeviceError, DeviceResponse, DeviceRouter, Endpoint};

pub fn create_app(app_state: AppState) -> Router {
    // 创建中间件层
    let middleware_layer = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(axum_middleware::from_fn(middleware::request_logging));

    Router::new()
        // 健康检查
        .route("/health", get(handlers::health::health_check))
        // 设备命令
        .merge(handlers::devices::device_routes())
        // WebSocket 推送
        .route("/ws", get(websocket::websocket_handler))
        .layer(middleware_layer)
        .with_state(app_state)
}

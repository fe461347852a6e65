use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use conductive_shared::{parse_command, CommandKind, CommandParseError, DeviceCommand, ErrorBody};
use tracing::error;

use crate::app_state::AppState;
use crate::device_router::{DeviceError, DeviceResponse};

pub fn device_routes() -> Router<AppState> {
    Router::new()
        .route("/esp32/status", get(get_status))
        .route("/esp32/inject", post(inject))
        .route("/esp32/stop", post(stop))
        .route("/esp32/set_amplitude", get(set_amplitude).post(set_amplitude))
}

// 获取设备状态
pub async fn get_status(State(app_state): State<AppState>) -> Response {
    dispatch(&app_state, DeviceCommand::GetStatus, "failed to reach ESP32").await
}

// 注入命令
pub async fn inject(State(app_state): State<AppState>, body: Bytes) -> Response {
    match parse_command(CommandKind::Inject, &body, None, app_state.boundary_policy) {
        Ok(command) => dispatch(&app_state, command, "failed to reach ESP32").await,
        Err(e) => bad_request(e),
    }
}

// 停止设备
pub async fn stop(State(app_state): State<AppState>) -> Response {
    dispatch(&app_state, DeviceCommand::Stop, "failed to stop device").await
}

// 设置幅值，body 中的 value 优先于 query 参数
//
// query 按键值对列表读取，重复的 value 取第一个
pub async fn set_amplitude(
    State(app_state): State<AppState>,
    Query(query): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Response {
    let value = query
        .iter()
        .find(|(key, _)| key == "value")
        .map(|(_, value)| value.as_str());

    match parse_command(
        CommandKind::SetAmplitude,
        &body,
        value,
        app_state.boundary_policy,
    ) {
        Ok(command) => dispatch(&app_state, command, "failed to set amplitude").await,
        Err(e) => bad_request(e),
    }
}

async fn dispatch(app_state: &AppState, command: DeviceCommand, summary: &str) -> Response {
    match app_state.device.execute(&command).await {
        Ok(response) => passthrough(response),
        Err(e) => gateway_error(summary, &e),
    }
}

// 原样返回设备响应
fn passthrough(response: DeviceResponse) -> Response {
    let content_type = response
        .content_type
        .unwrap_or_else(|| "application/json".to_string());

    ([(header::CONTENT_TYPE, content_type)], response.body).into_response()
}

fn gateway_error(summary: &str, e: &DeviceError) -> Response {
    error!("{}: {}", summary, e);
    (
        StatusCode::BAD_GATEWAY,
        Json(ErrorBody::new(summary, e.to_string())),
    )
        .into_response()
}

fn bad_request(e: CommandParseError) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody::new("invalid device command", e.to_string())),
    )
        .into_response()
}

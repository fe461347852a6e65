use axum::{extract::State, response::Json};
use conductive_shared::HealthStatus;

use crate::app_state::AppState;

pub async fn health_check(State(app_state): State<AppState>) -> Json<HealthStatus> {
    let broker_connected = app_state.broker.is_connected().await;
    let connected_push_clients = app_state.hub.count().await;

    Json(HealthStatus::ok(broker_connected, connected_push_clients))
}

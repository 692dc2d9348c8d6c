use axum::{
    routing::{get, post},
    Router,
};

use crate::ws::handler::AppState;

pub mod handlers;
pub mod types;

use handlers::{device_state, list_devices, queue_commands, status};

/// UI-facing API router (JWT protected, except the health check).
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/api/queue/{device_id}", post(queue_commands))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/{device_id}", get(device_state))
        .route("/status", get(status))
}

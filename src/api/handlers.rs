use axum::{
    extract::{Path, State},
    Json,
};

use serde_json::Value;
use tracing::{info, warn};

use crate::api::types::{DeviceStateResponse, DevicesResponse, StatusResponse};
use crate::auth::session::AuthenticatedUser;
use crate::commands::QueueOutcome;
use crate::error::AppError;
use crate::model::Device;
use crate::ws::handler::AppState;

/// Queue one or more `{code: args}` commands for a device the caller owns.
/// Unacceptable codes produce a structured 422 entry in the reply, not a
/// request failure.
pub async fn queue_commands(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(device_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let device = owned_device(&state, &device_id, &claims.sub).await?;

    let mut rep = serde_json::Map::new();
    if let Some(map) = body.as_object() {
        for (cmd, args) in map {
            let Some(code) = cmd.chars().next() else {
                continue;
            };
            info!(
                device_id = device.id.as_str(),
                cmd = cmd.as_str(),
                "handling cmd from UI"
            );
            match state.commands.queue(&device, code, args).await? {
                QueueOutcome::Queued { .. } => {}
                QueueOutcome::Unacceptable { .. } => {
                    rep.insert("error".into(), Value::from(422));
                    rep.insert("cmd".into(), Value::from(cmd.clone()));
                }
            }
        }
    }
    Ok(Json(Value::Object(rep)))
}

pub async fn list_devices(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
) -> Result<Json<DevicesResponse>, AppError> {
    let devices = state.db.list_devices_for_user(&claims.sub).await?;
    Ok(Json(DevicesResponse { devices }))
}

pub async fn device_state(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceStateResponse>, AppError> {
    let device = owned_device(&state, &device_id, &claims.sub).await?;
    let position = state.db.get_position(&device.id).await?;
    Ok(Json(DeviceStateResponse {
        id: device.id,
        name: device.name,
        has_passcode: device.has_passcode,
        accepts: device.accepts,
        last_exchange: device.last_exchange,
        position,
    }))
}

/// Health check for load balancers; deliberately unauthenticated.
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok",
        version: state.config.version.clone(),
    })
}

async fn owned_device(
    state: &AppState,
    device_id: &str,
    user_id: &str,
) -> Result<Device, AppError> {
    let Some(device) = state.db.get_device(device_id).await? else {
        warn!(device_id, "request for unknown device");
        return Err(AppError::Unauthorized);
    };
    if device.user_id != user_id {
        warn!(device_id, user_id, "device not owned by caller");
        return Err(AppError::Unauthorized);
    }
    Ok(device)
}

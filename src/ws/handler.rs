use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::{response::IntoResponse, routing::get, Router};

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

use crate::auth::assertion::AssertionVerifier;
use crate::auth::sha256_hex;
use crate::commands::CommandRouter;
use crate::config::Config;
use crate::db::DBLayer;
use crate::model::Device;
use crate::registry::{ConnectionRegistry, SessionControl};

// ------------------------------------------------------------
// TYPES
// ------------------------------------------------------------
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DBLayer>,
    pub registry: ConnectionRegistry,
    pub commands: Arc<CommandRouter>,
    pub verifier: Arc<AssertionVerifier>,
    pub config: Arc<Config>,
}

/// Deregisters the session on every exit path, panics included.
struct RegistryGuard {
    registry: ConnectionRegistry,
    device_id: String,
    epoch: u64,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.device_id, self.epoch);
    }
}

// ------------------------------------------------------------
// ROUTER
// ------------------------------------------------------------
pub fn ws_router() -> Router<AppState> {
    Router::new().route("/ws/{sig}/{device_id}", get(ws_handler))
}

/// Lightweight handshake signature a device derives from what it already
/// holds. Full Hawk signing starts once the socket is up.
pub fn handshake_sig(device_id: &str, secret: &str) -> String {
    sha256_hex(&format!("{device_id}.{secret}"))
}

async fn ws_handler(
    Path((sig, device_id)): Path<(String, String)>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // Connecting -> Authenticated: resolve the device and check the
    // handshake signature before anything is upgraded.
    let device = match state.db.get_device(&device_id).await {
        Ok(Some(device)) => device,
        Ok(None) => {
            warn!(device_id = device_id.as_str(), "socket for unknown device");
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Err(err) => {
            error!(device_id = device_id.as_str(), error = %err, "could not load device for socket");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };
    if !state.config.hawk_disabled && sig != handshake_sig(&device.id, &device.secret) {
        warn!(device_id = device_id.as_str(), "bad socket handshake signature");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ws.on_upgrade(move |socket| run_session(socket, state, device))
        .into_response()
}

// ------------------------------------------------------------
// DEVICE SESSION (SPLIT SOCKET)
// ------------------------------------------------------------
async fn run_session(socket: WebSocket, state: AppState, device: Device) {
    let (mut ws_sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(32);

    // Dedicated writer task; a failed or stalled write ends the session
    // instead of retrying.
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            match timeout(Duration::from_secs(5), ws_sender.send(msg)).await {
                Ok(Ok(_)) => {}
                _ => break,
            }
        }
    });

    let (ctl_tx, mut ctl_rx) = mpsc::channel::<SessionControl>(8);
    let epoch = state.registry.add(&device.id, ctl_tx);
    let _guard = RegistryGuard {
        registry: state.registry.clone(),
        device_id: device.id.clone(),
        epoch,
    };

    info!(device_id = device.id.as_str(), "device session active");

    // Anything queued while the device was offline goes out immediately.
    let mut open = drain_pending(&state, &device.id, &out_tx).await;

    while open {
        tokio::select! {
            ctl = ctl_rx.recv() => match ctl {
                Some(SessionControl::Wake) => {
                    open = drain_pending(&state, &device.id, &out_tx).await;
                }
                Some(SessionControl::Supersede) | None => {
                    info!(device_id = device.id.as_str(), "session superseded");
                    break;
                }
            },
            frame = receiver.next() => match frame {
                Some(Ok(WsMessage::Text(raw))) => {
                    open = handle_frame(&state, &device, raw.as_str(), &out_tx).await;
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    let _ = out_tx.send(WsMessage::Pong(payload)).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Err(_)) => break,
                _ => {}
            }
        }
    }

    info!(device_id = device.id.as_str(), "device session closed");

    // Drop sender to stop the writer task.
    drop(out_tx);
    let _ = writer.await;
}

/// Push every pending envelope down the socket, oldest first. Returns false
/// when the session should terminate.
async fn drain_pending(state: &AppState, device_id: &str, out: &mpsc::Sender<WsMessage>) -> bool {
    loop {
        match state.db.take_pending(device_id).await {
            Ok(Some(envelope)) => {
                if out.send(WsMessage::Text(envelope.into())).await.is_err() {
                    return false;
                }
            }
            Ok(None) => return true,
            Err(err) => {
                error!(device_id, error = %err, "could not read pending commands");
                return false;
            }
        }
    }
}

/// An inbound frame is the same `{code: args}` report shape as the poll
/// endpoint. Returns false when the session should terminate.
async fn handle_frame(
    state: &AppState,
    device: &Device,
    raw: &str,
    out: &mpsc::Sender<WsMessage>,
) -> bool {
    let parsed: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => {
            let msg = serde_json::json!({"error": "Invalid JSON"});
            return out.send(WsMessage::Text(msg.to_string().into())).await.is_ok();
        }
    };
    let Some(map) = parsed.as_object() else {
        return true;
    };

    for (cmd, args) in map {
        let Some(code) = cmd.chars().next().map(|c| c.to_ascii_lowercase()) else {
            continue;
        };
        if !device.accepts_code(code) {
            warn!(
                device_id = device.id.as_str(),
                unacceptable = %code,
                acceptable = device.accepts.as_str(),
                "unacceptable command report"
            );
            continue;
        }
        if code == 'q' {
            // User has quit; nuke what we know, if configuration allows.
            if state.config.allow_quit {
                if let Err(err) = state.db.delete_device(&device.id).await {
                    error!(device_id = device.id.as_str(), error = %err, "could not delete device");
                }
                return false;
            }
            continue;
        }
        if let Err(err) = state.commands.handle_report(&device.id, code, args).await {
            error!(
                device_id = device.id.as_str(),
                code = %code,
                error = %err,
                "error handling report"
            );
        }
    }
    true
}

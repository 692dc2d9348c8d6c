use axum::{routing::post, Router};

use crate::ws::handler::AppState;

pub mod handlers;
pub mod types;

use handlers::{cmd, register};

/// Device-facing REST router (Hawk signed).
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/cmd/{device_id}", post(cmd))
}

use axum::{Extension, Router};
use tower_http::cors::{Any, CorsLayer};

pub mod api;
pub mod auth;
pub mod commands;
pub mod config;
pub mod db;
pub mod device_api;
pub mod error;
pub mod model;
pub mod push;
pub mod registry;
pub mod ws;

use auth::session::JwtState;
use ws::handler::AppState;

/// Assemble the full service router: live sockets, device REST and the
/// JWT-protected UI surface, sharing one AppState.
pub fn app(state: AppState, jwt: JwtState) -> Router {
    Router::new()
        // Device live connections
        .merge(ws::ws_router())
        // Device REST (Hawk signed)
        .merge(device_api::router())
        // UI REST (JWT)
        .merge(api::api_router())
        .layer(Extension(jwt))
        // CORS for frontend
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

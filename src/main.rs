use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lodestone::auth::assertion::AssertionVerifier;
use lodestone::auth::session::JwtState;
use lodestone::commands::CommandRouter;
use lodestone::config::Config;
use lodestone::db::DBLayer;
use lodestone::push::PushClient;
use lodestone::registry::ConnectionRegistry;
use lodestone::ws::handler::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // -----------------------------
    // Logging
    // -----------------------------
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("🚀 Starting lodestone device server...");

    // -----------------------------
    // Shared state / Dependencies
    // -----------------------------
    let config = Arc::new(Config::from_env());
    let db = Arc::new(DBLayer::new(&config.db_path)?);
    let registry = ConnectionRegistry::new();
    let push = PushClient::new()?;
    let verifier = Arc::new(AssertionVerifier::from_config(&config));
    let commands = Arc::new(CommandRouter::new(
        db.clone(),
        registry.clone(),
        push.clone(),
        config.clone(),
    ));

    let state = AppState {
        db,
        registry,
        commands,
        verifier,
        config: config.clone(),
    };
    let jwt = JwtState {
        secret: config.jwt_secret.clone(),
    };

    // -----------------------------
    // Routers
    // -----------------------------
    let app = lodestone::app(state, jwt);

    let addr = config.bind_addr.clone();

    println!("🌐 HTTP listening on http://{addr}");
    println!("🔌 Device sockets at ws://{addr}/ws");

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shipanion::{
    api,
    auth::{AuthConfig, JwtVerifier},
    backend::BackendConfig,
    broadcast,
    proxy::OutboundCallProxy,
    state::{AppState, SessionConfig},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist, only log if it's a different issue
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shipanion=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Shipanion broker...");

    let auth_config = AuthConfig::from_env();
    let verifier = Arc::new(JwtVerifier::new(&auth_config));

    let backend_config = BackendConfig::from_env();
    let backend = backend_config.build_backend()?;
    let proxy = OutboundCallProxy::new(backend, backend_config.call_timeout);

    let state = Arc::new(AppState::new(verifier, proxy, SessionConfig::from_env()));

    // Spawn background task for dropping idle sessions
    broadcast::spawn_session_reaper(state.clone());

    let app = api::router(state);

    let addr: SocketAddr = std::env::var("BIND_ADDR")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "0.0.0.0:8000".to_string())
        .parse()?;
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

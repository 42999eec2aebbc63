//! Multi-room audio control bridge.
//!
//! Wires the shared bus, the player pool and the routing-daemon client
//! together and serves the browser-facing HTTP surface.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use multiroom_control::adapters::mopidy::MopidyPool;
use multiroom_control::adapters::snapcast::SnapcastAdapter;
use multiroom_control::{api, bus, config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "multiroom_control=debug,tower_http=debug,axum::rejection=trace".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting multiroom-control");

    // Load configuration
    let config = config::load_config()?;
    tracing::info!(?config, "Configuration loaded");

    // Shared bus, then the clients that publish onto it
    let bus = bus::create_bus();
    let pool = Arc::new(MopidyPool::new(&config.players, &bus));
    let snapcast = SnapcastAdapter::new(&config.snapcast, bus.clone());
    tracing::info!(zones = config.players.len(), "Clients constructed");

    // Build API routes
    let app = Router::new()
        .route("/status", get(api::status_handler))
        .route("/api/settings", get(api::settings_handler))
        .route("/api/players", get(api::players_handler))
        .route("/api/streams", get(api::streams_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(api::AppState::new(&config, pool, snapcast));

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

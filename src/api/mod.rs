//! HTTP API handlers
//!
//! Read-only surface for the browser UI. Live updates flow over the bus,
//! not through these endpoints; this is the state a page needs to render
//! before (or without) subscribing.

use axum::{extract::State, Json};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::adapters::mopidy::MopidyPool;
use crate::adapters::snapcast::SnapcastAdapter;
use crate::config::{Config, PlayerConfig, SnapcastConfig};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<MopidyPool>,
    pub snapcast: Arc<SnapcastAdapter>,
    settings: Settings,
}

impl AppState {
    pub fn new(config: &Config, pool: Arc<MopidyPool>, snapcast: Arc<SnapcastAdapter>) -> Self {
        Self {
            pool,
            snapcast,
            settings: Settings {
                players: config.players.clone(),
                snapcast: config.snapcast.clone(),
            },
        }
    }
}

/// Connection info the browser fetches before opening its own sockets.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub players: Vec<PlayerConfig>,
    pub snapcast: SnapcastConfig,
}

/// General status response
#[derive(Serialize)]
pub struct StatusResponse {
    pub service: &'static str,
    pub version: &'static str,
}

/// GET /status - Service health check
pub async fn status_handler() -> Json<StatusResponse> {
    Json(StatusResponse {
        service: "multiroom-control",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /api/settings - Zone and daemon connection info
pub async fn settings_handler(State(state): State<AppState>) -> Json<Settings> {
    Json(state.settings.clone())
}

#[derive(Serialize)]
pub struct PlayerStatus {
    pub id: String,
    pub playing: bool,
}

/// GET /api/players - Configured zones with their last-known playing flag
pub async fn players_handler(State(state): State<AppState>) -> Json<Vec<PlayerStatus>> {
    Json(
        state
            .pool
            .players()
            .iter()
            .map(|player| PlayerStatus {
                id: player.id().to_string(),
                playing: player.is_playing(),
            })
            .collect(),
    )
}

/// GET /api/streams - Cached routing-daemon stream list
pub async fn streams_handler(State(state): State<AppState>) -> Json<Vec<Value>> {
    Json(state.snapcast.streams().await.unwrap_or_default())
}

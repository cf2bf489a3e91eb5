//! Application state and router assembly.

use axum::http::HeaderValue;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::commands::CommandEngine;
use crate::config::Config;
use crate::hub::LiveHub;
use crate::middleware::{metrics_handler, metrics_middleware};
use crate::pipeline::PositionPipeline;
use crate::routes::{commands, devices, events, geofences, health, osmand, positions};
use crate::services::GeofenceSync;
use crate::ws;
use domain::services::{CommandStore, DeviceStore, EventStore, PositionStore};

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Present in production; absent when the surface runs against
    /// in-memory stores.
    pub pool: Option<PgPool>,
    pub positions: Arc<dyn PositionStore>,
    pub events: Arc<dyn EventStore>,
    pub devices: Arc<dyn DeviceStore>,
    pub commands: Arc<dyn CommandStore>,
    pub hub: LiveHub,
    pub engine: CommandEngine,
    pub geofence_sync: GeofenceSync,
    pub pipeline: Arc<PositionPipeline>,
}

/// Builds the operator-facing application: REST surface, WebSocket and
/// observability endpoints.
pub fn create_app(state: AppState) -> Router {
    let cors = cors_layer(&state.config);
    let request_timeout = Duration::from_secs(state.config.server.request_timeout_secs);

    let api = Router::new()
        .route("/positions/latest", get(positions::latest))
        .route("/positions/history", get(positions::history))
        .route("/events", get(events::list))
        .route("/commands", post(commands::submit).get(commands::list))
        .route("/commands/:id/cancel", post(commands::cancel))
        .route("/commands/:id/retry", post(commands::retry))
        .route("/geofences/reload", post(geofences::reload))
        .route("/devices", get(devices::list))
        .route("/devices/:id/accumulators", post(devices::update_accumulators));

    Router::new()
        .nest("/api", api)
        .route("/ws/:user_id", get(ws::ws_handler))
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

/// Builds the OsmAnd ingestion application, served on the protocol's own
/// port.
pub fn create_osmand_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(osmand::ingest).post(osmand::ingest))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    if config.security.allowed_hosts.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .security
            .allowed_hosts
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

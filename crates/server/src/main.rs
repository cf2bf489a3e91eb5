use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

mod app;
mod commands;
mod config;
mod error;
mod events;
mod hub;
mod jobs;
mod middleware;
mod pipeline;
mod protocol;
mod routes;
mod services;
mod session;
mod ws;

use crate::commands::CommandEngine;
use crate::events::EventDispatcher;
use crate::hub::LiveHub;
use crate::pipeline::{PositionPipeline, ProcessorDeps};
use crate::protocol::listener::{IngestDeps, IngestionManager};
use crate::protocol::ProtocolRegistry;
use crate::services::GeofenceSync;
use crate::session::SessionRegistry;
use domain::services::{GeofenceCache, MockSmsGateway, SmsGateway, StaticUserAccess};
use persistence::repositories::{
    CommandRepository, DeviceRepository, EventRepository, GeofenceRepository, PositionRepository,
    UnknownDeviceRepository,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Arc::new(config::Config::load()?);

    // Initialize logging
    middleware::logging::init_logging(&config.logging);

    // Initialize Prometheus metrics
    middleware::metrics::init_metrics();

    info!("Starting TrackHub server v{}", env!("CARGO_PKG_VERSION"));

    // Create database pool
    let db_config = persistence::db::DatabaseConfig {
        url: config.database.url.clone(),
        max_connections: config.database.max_connections,
        min_connections: config.database.min_connections,
        connect_timeout_secs: config.database.connect_timeout_secs,
        idle_timeout_secs: config.database.idle_timeout_secs,
        statement_timeout_secs: config.database.statement_timeout_secs,
    };
    let pool = persistence::db::create_pool(&db_config).await?;

    // Run migrations
    info!("Running database migrations...");
    sqlx::migrate!("../persistence/src/migrations")
        .run(&pool)
        .await?;
    info!("Migrations completed");

    // Stores
    let positions = Arc::new(PositionRepository::new(pool.clone()));
    let events = Arc::new(EventRepository::new(pool.clone()));
    let devices = Arc::new(DeviceRepository::new(pool.clone()));
    let commands = Arc::new(CommandRepository::new(pool.clone()));
    let unknown_devices = Arc::new(UnknownDeviceRepository::new(pool.clone()));
    let geofence_store = Arc::new(GeofenceRepository::new(pool.clone()));

    // Geofence spatial cache, loaded before the first frame arrives
    let geofence_cache = GeofenceCache::new();
    let geofence_sync = GeofenceSync::new(
        geofence_store,
        geofence_cache.clone(),
        config.pipeline.default_geofence_buffer_m,
    );
    let loaded = geofence_sync.reload().await?;
    info!(count = loaded, "Geofence cache primed");

    // Shared collaborators
    let sessions = Arc::new(SessionRegistry::new());
    let hub = LiveHub::new(config.hub_settings());
    // Permission graph lives in the external user layer; the static graph
    // treats configured operators as admins.
    let access = Arc::new(StaticUserAccess::new());
    let dispatcher = Arc::new(EventDispatcher::new(
        events.clone(),
        access,
        hub.clone(),
    ));
    let sms: Arc<dyn SmsGateway> = Arc::new(MockSmsGateway::new());

    // Position pipeline
    let pipeline = Arc::new(PositionPipeline::start(
        ProcessorDeps {
            devices: devices.clone(),
            positions: positions.clone(),
            unknown_devices,
            geofences: geofence_cache,
            dispatcher: dispatcher.clone(),
            hub: hub.clone(),
        },
        config.pipeline_settings(),
    ));

    // Command engine
    let protocols = ProtocolRegistry::with_defaults();
    let engine = CommandEngine::new(
        commands.clone(),
        devices.clone(),
        sessions.clone(),
        protocols.clone(),
        sms,
        dispatcher,
        config.command_settings(),
    );
    let recovered = engine.recover().await?;
    info!(count = recovered, "Command queue recovered");
    let _engine_workers = engine.start();

    // Protocol listeners
    let mut ingestion = IngestionManager::new(
        protocols,
        IngestDeps {
            pipeline: pipeline.clone(),
            sessions: sessions.clone(),
            devices: devices.clone(),
            engine: engine.clone(),
        },
        config.ingest_settings(),
    );
    ingestion.start(&config.protocols).await?;
    for (protocol, port, transport) in ingestion.running() {
        info!(protocol = %protocol, port, transport = transport.as_str(), "Listener running");
    }

    // Background maintenance
    let mut maintenance = jobs::Maintenance::new();
    maintenance.spawn(jobs::ScheduledCommandRunner::new(
        commands.clone(),
        engine.clone(),
    ));
    maintenance.spawn(jobs::OfflineSweep::new(
        devices.clone(),
        pipeline.clone(),
        config.pipeline.offline_timeout_secs,
    ));
    maintenance.spawn(jobs::DeviceExpiration::new(
        devices.clone(),
        sessions.clone(),
    ));
    maintenance.spawn(jobs::PoolGauges::new(pool.clone()));

    // Applications
    let state = app::AppState {
        config: config.clone(),
        pool: Some(pool),
        positions,
        events,
        devices,
        commands,
        hub,
        engine: engine.clone(),
        geofence_sync,
        pipeline: pipeline.clone(),
    };

    let api = app::create_app(state.clone());
    let addr = config.socket_addr();
    let api_listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API and WebSocket listening on {}", addr);

    // The OsmAnd HTTP protocol serves its own port
    let osmand_server = match config.protocols.get("osmand") {
        Some(endpoint) if endpoint.enabled => {
            let osmand_app = app::create_osmand_app(state.clone());
            let osmand_addr =
                std::net::SocketAddr::from(([0, 0, 0, 0], endpoint.port));
            let listener = tokio::net::TcpListener::bind(osmand_addr).await?;
            info!("OsmAnd HTTP listener on {}", osmand_addr);
            Some(tokio::spawn(async move {
                let _ = axum::serve(listener, osmand_app).await;
            }))
        }
        _ => None,
    };

    // Handle shutdown gracefully
    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("Received shutdown signal");
    };

    axum::serve(api_listener, api)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    // Cooperative shutdown: stop intake, then drain within the grace period
    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    if let Some(handle) = osmand_server {
        handle.abort();
    }
    ingestion.stop(grace).await;
    engine.shutdown();
    maintenance.shutdown();
    maintenance.drain(grace).await;
    if let Ok(pipeline) = Arc::try_unwrap(pipeline) {
        pipeline.shutdown(grace).await;
    }

    info!("Server shutdown complete");
    Ok(())
}

use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::commands::CommandSettings;
use crate::hub::HubSettings;
use crate::pipeline::{MotionSettings, OverspeedSettings, PipelineSettings};
use crate::protocol::listener::{EndpointConfig, IngestSettings};
use crate::protocol::Transport;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    /// Protocol endpoint map, `{name: {enabled, port, transport}}`.
    #[serde(default = "default_protocols")]
    pub protocols: HashMap<String, EndpointConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Grace period for cooperative shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SecurityConfig {
    /// Secret used by the outer auth layer; loaded here so the whole
    /// deployment reads one config structure.
    #[serde(default)]
    pub secret_key: String,

    /// Origins allowed to reach the REST and WebSocket surface.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_skew_secs")]
    pub skew_secs: i64,

    #[serde(default = "default_trip_gap_secs")]
    pub trip_gap_secs: i64,

    #[serde(default = "default_motion_speed_threshold")]
    pub motion_speed_threshold_kmh: f64,

    #[serde(default = "default_motion_threshold_m")]
    pub motion_threshold_m: f64,

    #[serde(default = "default_motion_timeout_secs")]
    pub motion_timeout_secs: i64,

    #[serde(default = "default_overspeed_limit")]
    pub overspeed_default_limit_kmh: f64,

    #[serde(default = "default_overspeed_threshold")]
    pub overspeed_threshold_kmh: f64,

    #[serde(default = "default_pipeline_workers")]
    pub worker_count: usize,

    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// Devices with no update for this long are swept offline.
    #[serde(default = "default_offline_timeout_secs")]
    pub offline_timeout_secs: i64,

    /// Corridor width applied to LineString geofences without their own.
    #[serde(default = "default_geofence_buffer_m")]
    pub default_geofence_buffer_m: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        // Round-trips every field through the serde defaults.
        serde_json::from_value(serde_json::json!({})).expect("defaults are total")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_hub_queue_bound")]
    pub queue_bound: usize,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_bound: default_hub_queue_bound(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandsConfig {
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,

    #[serde(default = "default_session_backoff_secs")]
    pub session_retry_backoff_secs: u64,

    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,

    #[serde(default = "default_retry_cap_secs")]
    pub retry_cap_secs: u64,

    #[serde(default = "default_command_workers")]
    pub worker_count: usize,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("defaults are total")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    #[serde(default = "default_max_frame_errors")]
    pub max_frame_errors: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: default_read_timeout_secs(),
            max_frame_len: default_max_frame_len(),
            max_frame_errors: default_max_frame_errors(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Page cap for position queries from the REST surface.
    #[serde(default = "default_position_batch_size")]
    pub position_batch_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            position_batch_size: default_position_batch_size(),
        }
    }
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_request_timeout() -> u64 {
    30
}
fn default_shutdown_grace() -> u64 {
    30
}
fn default_max_connections() -> u32 {
    20
}
fn default_min_connections() -> u32 {
    5
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_idle_timeout() -> u64 {
    600
}
fn default_statement_timeout() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_skew_secs() -> i64 {
    300
}
fn default_trip_gap_secs() -> i64 {
    1800
}
fn default_motion_speed_threshold() -> f64 {
    5.0
}
fn default_motion_threshold_m() -> f64 {
    50.0
}
fn default_motion_timeout_secs() -> i64 {
    300
}
fn default_overspeed_limit() -> f64 {
    80.0
}
fn default_overspeed_threshold() -> f64 {
    5.0
}
fn default_pipeline_workers() -> usize {
    4
}
fn default_mailbox_capacity() -> usize {
    64
}
fn default_offline_timeout_secs() -> i64 {
    600
}
fn default_geofence_buffer_m() -> f64 {
    25.0
}
fn default_hub_queue_bound() -> usize {
    256
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_ack_timeout_secs() -> u64 {
    60
}
fn default_session_backoff_secs() -> u64 {
    15
}
fn default_retry_base_secs() -> u64 {
    30
}
fn default_retry_cap_secs() -> u64 {
    600
}
fn default_command_workers() -> usize {
    2
}
fn default_read_timeout_secs() -> u64 {
    180
}
fn default_max_frame_len() -> usize {
    2048
}
fn default_max_frame_errors() -> u32 {
    10
}
fn default_position_batch_size() -> usize {
    1000
}

fn default_protocols() -> HashMap<String, EndpointConfig> {
    let defaults = [
        ("suntech", 5001, Transport::Tcp),
        ("gt06", 5002, Transport::Tcp),
        ("h02", 5003, Transport::Tcp),
        ("osmand", 5055, Transport::Http),
    ];
    defaults
        .into_iter()
        .map(|(name, port, transport)| {
            (
                name.to_string(),
                EndpointConfig {
                    enabled: true,
                    port,
                    transport,
                },
            )
        })
        .collect()
}

impl Config {
    /// Loads configuration from `config/` files with `TH__` environment
    /// overrides (e.g. `TH__DATABASE__URL`).
    pub fn load() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("TH").separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], self.server.port)))
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            skew_secs: self.pipeline.skew_secs,
            trip_gap_secs: self.pipeline.trip_gap_secs,
            motion_speed_threshold_kmh: self.pipeline.motion_speed_threshold_kmh,
            motion: MotionSettings {
                threshold_m: self.pipeline.motion_threshold_m,
                timeout_secs: self.pipeline.motion_timeout_secs,
            },
            overspeed: OverspeedSettings {
                default_limit_kmh: self.pipeline.overspeed_default_limit_kmh,
                threshold_kmh: self.pipeline.overspeed_threshold_kmh,
            },
            worker_count: self.pipeline.worker_count,
            mailbox_capacity: self.pipeline.mailbox_capacity,
        }
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            queue_bound: self.hub.queue_bound,
            heartbeat_interval: Duration::from_secs(self.hub.heartbeat_secs),
        }
    }

    pub fn command_settings(&self) -> CommandSettings {
        CommandSettings {
            ack_timeout: Duration::from_secs(self.commands.ack_timeout_secs),
            session_retry_backoff: Duration::from_secs(self.commands.session_retry_backoff_secs),
            retry_base: Duration::from_secs(self.commands.retry_base_secs),
            retry_cap: Duration::from_secs(self.commands.retry_cap_secs),
            worker_count: self.commands.worker_count,
            tick: Duration::from_millis(250),
        }
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            read_timeout: Duration::from_secs(self.ingest.read_timeout_secs),
            max_frame_len: self.ingest.max_frame_len,
            max_frame_errors: self.ingest.max_frame_errors,
        }
    }
}

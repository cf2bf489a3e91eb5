//! Position entity (database row mapping).

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use domain::models::Position;

/// Database row mapping for the positions table.
#[derive(Debug, Clone, FromRow)]
pub struct PositionEntity {
    pub id: i64,
    pub device_id: Option<i64>,
    pub unknown_device_id: Option<i64>,
    pub protocol: String,
    pub server_time: DateTime<Utc>,
    pub device_time: Option<DateTime<Utc>>,
    pub fix_time: Option<DateTime<Utc>>,
    pub valid: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub course: Option<f64>,
    pub accuracy: Option<f64>,
    pub address: Option<String>,
    pub attributes: Option<serde_json::Value>,
}

impl From<PositionEntity> for Position {
    fn from(entity: PositionEntity) -> Self {
        Self {
            id: entity.id,
            device_id: entity.device_id,
            unknown_device_id: entity.unknown_device_id,
            protocol: entity.protocol,
            server_time: entity.server_time,
            device_time: entity.device_time,
            fix_time: entity.fix_time,
            valid: entity.valid,
            latitude: entity.latitude,
            longitude: entity.longitude,
            altitude: entity.altitude,
            speed: entity.speed,
            course: entity.course,
            accuracy: entity.accuracy,
            address: entity.address,
            attributes: super::attributes_from_json(entity.attributes),
        }
    }
}

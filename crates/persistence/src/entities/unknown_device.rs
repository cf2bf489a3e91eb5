//! Unknown device entity (database row mapping).

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use domain::models::UnknownDevice;

/// Database row mapping for the unknown_devices table.
#[derive(Debug, Clone, FromRow)]
pub struct UnknownDeviceEntity {
    pub id: i64,
    pub unique_id: String,
    pub protocol: String,
    pub port: i32,
    pub transport: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub connection_count: i64,
    pub is_registered: bool,
    pub registered_device_id: Option<i64>,
}

impl From<UnknownDeviceEntity> for UnknownDevice {
    fn from(entity: UnknownDeviceEntity) -> Self {
        Self {
            id: entity.id,
            unique_id: entity.unique_id,
            protocol: entity.protocol,
            port: entity.port as u16,
            transport: entity.transport,
            first_seen: entity.first_seen,
            last_seen: entity.last_seen,
            connection_count: entity.connection_count,
            is_registered: entity.is_registered,
            registered_device_id: entity.registered_device_id,
        }
    }
}

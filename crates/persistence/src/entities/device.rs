//! Device entity (database row mapping).

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use domain::models::{Device, DeviceAccumulators, DeviceStatus};

/// Database row mapping for the devices table.
#[derive(Debug, Clone, FromRow)]
pub struct DeviceEntity {
    pub id: i64,
    pub unique_id: String,
    pub name: String,
    pub status: String,
    pub last_update: Option<DateTime<Utc>>,
    pub group_id: Option<i64>,
    pub phone: Option<String>,
    pub calendar_id: Option<i64>,
    pub expiration_time: Option<DateTime<Utc>>,
    pub disabled: bool,
    pub total_distance: f64,
    pub hours: i64,
    pub motion_state: bool,
    pub motion_streak: bool,
    pub motion_position_id: Option<i64>,
    pub motion_time: Option<DateTime<Utc>>,
    pub motion_distance: f64,
    pub overspeed_state: bool,
    pub overspeed_time: Option<DateTime<Utc>>,
    pub overspeed_geofence_id: Option<i64>,
    pub attributes: Option<serde_json::Value>,
}

impl From<DeviceEntity> for Device {
    fn from(entity: DeviceEntity) -> Self {
        Self {
            id: entity.id,
            unique_id: entity.unique_id,
            name: entity.name,
            status: DeviceStatus::parse(&entity.status).unwrap_or(DeviceStatus::Unknown),
            last_update: entity.last_update,
            group_id: entity.group_id,
            phone: entity.phone,
            calendar_id: entity.calendar_id,
            expiration_time: entity.expiration_time,
            disabled: entity.disabled,
            accumulators: DeviceAccumulators {
                total_distance: entity.total_distance,
                hours: entity.hours,
                motion_state: entity.motion_state,
                motion_streak: entity.motion_streak,
                motion_position_id: entity.motion_position_id,
                motion_time: entity.motion_time,
                motion_distance: entity.motion_distance,
                overspeed_state: entity.overspeed_state,
                overspeed_time: entity.overspeed_time,
                overspeed_geofence_id: entity.overspeed_geofence_id,
            },
            attributes: super::attributes_from_json(entity.attributes),
        }
    }
}

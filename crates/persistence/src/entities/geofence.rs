//! Geofence entity (database row mapping).

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use domain::models::Geofence;

/// Database row mapping for the geofences table.
#[derive(Debug, Clone, FromRow)]
pub struct GeofenceEntity {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub geometry: String,
    pub disabled: bool,
    pub calendar_id: Option<i64>,
    pub attributes: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<GeofenceEntity> for Geofence {
    fn from(entity: GeofenceEntity) -> Self {
        Self {
            id: entity.id,
            name: entity.name,
            description: entity.description,
            geometry: entity.geometry,
            disabled: entity.disabled,
            calendar_id: entity.calendar_id,
            attributes: super::attributes_from_json(entity.attributes),
            created_at: entity.created_at,
            updated_at: entity.updated_at,
        }
    }
}

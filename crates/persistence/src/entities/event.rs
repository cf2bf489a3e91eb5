//! Event entity (database row mapping).

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use domain::models::{Event, EventType};

/// Database row mapping for the events table.
#[derive(Debug, Clone, FromRow)]
pub struct EventEntity {
    pub id: i64,
    pub event_type: String,
    pub device_id: i64,
    pub position_id: Option<i64>,
    pub event_time: DateTime<Utc>,
    pub geofence_id: Option<i64>,
    pub maintenance_id: Option<i64>,
    pub attributes: Option<serde_json::Value>,
}

impl EventEntity {
    /// Converts to the domain event; rows with a type this build does not
    /// know are dropped by the caller.
    pub fn into_domain(self) -> Option<Event> {
        let event_type = EventType::parse(&self.event_type)?;
        Some(Event {
            id: self.id,
            event_type,
            device_id: self.device_id,
            position_id: self.position_id,
            event_time: self.event_time,
            geofence_id: self.geofence_id,
            maintenance_id: self.maintenance_id,
            attributes: super::attributes_from_json(self.attributes),
        })
    }
}

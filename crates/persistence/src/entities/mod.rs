//! Entity definitions (database row mappings).

pub mod command;
pub mod device;
pub mod event;
pub mod geofence;
pub mod position;
pub mod unknown_device;

pub use command::{CommandEntity, ScheduledCommandEntity};
pub use device::DeviceEntity;
pub use event::EventEntity;
pub use geofence::GeofenceEntity;
pub use position::PositionEntity;
pub use unknown_device::UnknownDeviceEntity;

use domain::models::AttributeBag;

/// Decodes a JSONB attributes column, falling back to an empty bag on rows
/// written by older schema revisions.
pub(crate) fn attributes_from_json(value: Option<serde_json::Value>) -> AttributeBag {
    value
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

/// Encodes an attribute bag for a JSONB column.
pub(crate) fn attributes_to_json(bag: &AttributeBag) -> serde_json::Value {
    serde_json::to_value(bag).unwrap_or_else(|_| serde_json::json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::models::keys;

    #[test]
    fn test_attributes_round_trip() {
        let mut bag = AttributeBag::new();
        bag.set(keys::SATELLITES, 11_i64);
        bag.set(keys::IGNITION, false);
        let json = attributes_to_json(&bag);
        let back = attributes_from_json(Some(json));
        assert_eq!(back, bag);
    }

    #[test]
    fn test_attributes_null_column() {
        assert!(attributes_from_json(None).is_empty());
    }

    #[test]
    fn test_attributes_malformed_column() {
        let back = attributes_from_json(Some(serde_json::json!("not a map")));
        assert!(back.is_empty());
    }
}

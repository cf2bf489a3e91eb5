//! Position domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::attributes::AttributeBag;

/// One normalized tracker report.
///
/// Exactly one of `device_id` / `unknown_device_id` is set; positions from
/// identifiers without a registered device are kept but never broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: i64,
    pub device_id: Option<i64>,
    pub unknown_device_id: Option<i64>,
    pub protocol: String,
    /// Arrival instant at the server.
    pub server_time: DateTime<Utc>,
    /// Instant the device claims to have sent the report.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_time: Option<DateTime<Utc>>,
    /// Instant of the GPS fix itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_time: Option<DateTime<Utc>>,
    pub valid: bool,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    /// Ground speed in km/h after normalization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub course: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "AttributeBag::is_empty")]
    pub attributes: AttributeBag,
}

impl Position {
    /// Whether the ownership invariant holds.
    pub fn has_valid_owner(&self) -> bool {
        self.device_id.is_some() != self.unknown_device_id.is_some()
    }

    /// Dedup identity: same device, fix instant and coordinates.
    pub fn dedup_key(&self) -> (Option<i64>, Option<DateTime<Utc>>, u64, u64) {
        (
            self.device_id,
            self.fix_time,
            self.latitude.to_bits(),
            self.longitude.to_bits(),
        )
    }
}

/// A decoded-but-unsaved report produced by a protocol decoder.
///
/// The pipeline attributes it to a device, enriches it and turns it into a
/// stored [`Position`].
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPosition {
    /// Identifier announced on the wire.
    pub unique_id: String,
    pub protocol: String,
    pub device_time: Option<DateTime<Utc>>,
    pub fix_time: Option<DateTime<Utc>>,
    pub valid: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    /// km/h.
    pub speed: Option<f64>,
    pub course: Option<f64>,
    pub accuracy: Option<f64>,
    pub attributes: AttributeBag,
}

impl DecodedPosition {
    pub fn new(unique_id: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            unique_id: unique_id.into(),
            protocol: protocol.into(),
            device_time: None,
            fix_time: None,
            valid: false,
            latitude: 0.0,
            longitude: 0.0,
            altitude: None,
            speed: None,
            course: None,
            accuracy: None,
            attributes: AttributeBag::new(),
        }
    }

    /// Whether the coordinates are inside the representable ranges.
    pub fn coordinates_in_range(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::attributes::keys;

    fn sample_position() -> Position {
        Position {
            id: 1,
            device_id: Some(10),
            unknown_device_id: None,
            protocol: "suntech".to_string(),
            server_time: Utc::now(),
            device_time: None,
            fix_time: Some(Utc::now()),
            valid: true,
            latitude: -3.843813,
            longitude: -38.615475,
            altitude: None,
            speed: Some(0.013),
            course: Some(0.0),
            accuracy: None,
            address: None,
            attributes: AttributeBag::new(),
        }
    }

    #[test]
    fn test_owner_invariant() {
        let mut p = sample_position();
        assert!(p.has_valid_owner());
        p.unknown_device_id = Some(4);
        assert!(!p.has_valid_owner());
        p.device_id = None;
        assert!(p.has_valid_owner());
        p.unknown_device_id = None;
        assert!(!p.has_valid_owner());
    }

    #[test]
    fn test_dedup_key_equality() {
        let a = sample_position();
        let mut b = a.clone();
        b.id = 99;
        b.speed = Some(50.0);
        assert_eq!(a.dedup_key(), b.dedup_key());
        b.latitude += 0.000001;
        assert_ne!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn test_decoded_position_defaults() {
        let d = DecodedPosition::new("907126119", "suntech");
        assert_eq!(d.unique_id, "907126119");
        assert!(!d.valid);
        assert!(d.attributes.is_empty());
    }

    #[test]
    fn test_coordinates_in_range() {
        let mut d = DecodedPosition::new("x", "h02");
        d.latitude = 90.0;
        d.longitude = -180.0;
        assert!(d.coordinates_in_range());
        d.latitude = 90.1;
        assert!(!d.coordinates_in_range());
    }

    #[test]
    fn test_position_serialization_camel_case() {
        let mut p = sample_position();
        p.attributes.set(keys::SATELLITES, 11_i64);
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"deviceId\":10"));
        assert!(json.contains("\"serverTime\""));
        assert!(json.contains("\"sat\":11"));
        assert!(!json.contains("\"address\""));
    }
}

//! Device domain model and accumulator state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::attributes::AttributeBag;

/// Reported connection status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Unknown,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(DeviceStatus::Online),
            "offline" => Some(DeviceStatus::Offline),
            "unknown" => Some(DeviceStatus::Unknown),
            _ => None,
        }
    }
}

/// A registered tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: i64,
    /// Identifier the device announces on the wire.
    pub unique_id: String,
    pub name: String,
    pub status: DeviceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calendar_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<DateTime<Utc>>,
    pub disabled: bool,
    #[serde(flatten)]
    pub accumulators: DeviceAccumulators,
    #[serde(default, skip_serializing_if = "AttributeBag::is_empty")]
    pub attributes: AttributeBag,
}

/// Per-device running state maintained by the position pipeline.
///
/// `total_distance` and `hours` only ever grow; they reset solely through
/// an explicit accumulator update from the administration surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAccumulators {
    /// Meters travelled since the accumulator was last reset.
    pub total_distance: f64,
    /// Engine seconds accrued over ignition/motion windows.
    pub hours: i64,
    pub motion_state: bool,
    pub motion_streak: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motion_position_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motion_time: Option<DateTime<Utc>>,
    pub motion_distance: f64,
    pub overspeed_state: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overspeed_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overspeed_geofence_id: Option<i64>,
}

impl Device {
    /// Whether the device is past its configured expiration.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time.map(|t| t <= now).unwrap_or(false)
    }
}

/// An identifier seen on the wire with no registered device behind it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnknownDevice {
    pub id: i64,
    pub unique_id: String,
    pub protocol: String,
    pub port: u16,
    pub transport: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub connection_count: i64,
    pub is_registered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registered_device_id: Option<i64>,
}

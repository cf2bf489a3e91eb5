//! Event domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::attributes::AttributeBag;

/// Event types synthesized by the position pipeline and command engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    DeviceOnline,
    DeviceOffline,
    DeviceMoving,
    DeviceStopped,
    DeviceOverspeed,
    DeviceFuelDrop,
    GeofenceEnter,
    GeofenceExit,
    IgnitionOn,
    IgnitionOff,
    Alarm,
    Maintenance,
    DriverChanged,
    CommandResult,
    Media,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::DeviceOnline => "deviceOnline",
            EventType::DeviceOffline => "deviceOffline",
            EventType::DeviceMoving => "deviceMoving",
            EventType::DeviceStopped => "deviceStopped",
            EventType::DeviceOverspeed => "deviceOverspeed",
            EventType::DeviceFuelDrop => "deviceFuelDrop",
            EventType::GeofenceEnter => "geofenceEnter",
            EventType::GeofenceExit => "geofenceExit",
            EventType::IgnitionOn => "ignitionOn",
            EventType::IgnitionOff => "ignitionOff",
            EventType::Alarm => "alarm",
            EventType::Maintenance => "maintenance",
            EventType::DriverChanged => "driverChanged",
            EventType::CommandResult => "commandResult",
            EventType::Media => "media",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deviceOnline" => Some(EventType::DeviceOnline),
            "deviceOffline" => Some(EventType::DeviceOffline),
            "deviceMoving" => Some(EventType::DeviceMoving),
            "deviceStopped" => Some(EventType::DeviceStopped),
            "deviceOverspeed" => Some(EventType::DeviceOverspeed),
            "deviceFuelDrop" => Some(EventType::DeviceFuelDrop),
            "geofenceEnter" => Some(EventType::GeofenceEnter),
            "geofenceExit" => Some(EventType::GeofenceExit),
            "ignitionOn" => Some(EventType::IgnitionOn),
            "ignitionOff" => Some(EventType::IgnitionOff),
            "alarm" => Some(EventType::Alarm),
            "maintenance" => Some(EventType::Maintenance),
            "driverChanged" => Some(EventType::DriverChanged),
            "commandResult" => Some(EventType::CommandResult),
            "media" => Some(EventType::Media),
            _ => None,
        }
    }

    /// Fixed delivery severity for the fan-out path.
    pub fn severity(&self) -> EventSeverity {
        match self {
            EventType::Alarm => EventSeverity::Critical,
            EventType::DeviceOffline | EventType::DeviceOverspeed => EventSeverity::High,
            EventType::GeofenceEnter | EventType::GeofenceExit | EventType::DeviceFuelDrop => {
                EventSeverity::Medium
            }
            _ => EventSeverity::Low,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Delivery severity, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl EventSeverity {
    /// Critical and high events must reach the live hub before the pipeline
    /// accepts the next frame from the device.
    pub fn is_urgent(&self) -> bool {
        matches!(self, EventSeverity::Critical | EventSeverity::High)
    }
}

/// An immutable record of a state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: i64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub device_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_id: Option<i64>,
    pub event_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geofence_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintenance_id: Option<i64>,
    #[serde(default, skip_serializing_if = "AttributeBag::is_empty")]
    pub attributes: AttributeBag,
}

impl Event {
    pub fn new(event_type: EventType, device_id: i64, event_time: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            event_type,
            device_id,
            position_id: None,
            event_time,
            geofence_id: None,
            maintenance_id: None,
            attributes: AttributeBag::new(),
        }
    }

    pub fn with_position(mut self, position_id: i64) -> Self {
        self.position_id = Some(position_id);
        self
    }

    pub fn with_geofence(mut self, geofence_id: i64) -> Self {
        self.geofence_id = Some(geofence_id);
        self
    }
}

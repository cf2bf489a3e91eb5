//! Typed attribute bag carried by positions and events.
//!
//! Wire protocols report an open-ended set of extras (satellite counts,
//! battery voltage, IO flags, alarms). The bag keeps them as a typed
//! key/value map instead of modelling every attribute as a struct field.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Attribute keys drawn from a closed vocabulary.
///
/// Protocol decoders and the pipeline only write keys listed here (plus
/// `custom1`..`custom5` for installer-defined extras).
pub mod keys {
    // GPS quality
    pub const HDOP: &str = "hdop";
    pub const VDOP: &str = "vdop";
    pub const PDOP: &str = "pdop";
    pub const SATELLITES: &str = "sat";
    pub const SATELLITES_VISIBLE: &str = "satVisible";

    // Cellular
    pub const RSSI: &str = "rssi";
    pub const ROAMING: &str = "roaming";
    pub const NETWORK_TYPE: &str = "networkType";
    pub const CELL_ID: &str = "cellId";
    pub const LAC: &str = "lac";
    pub const MNC: &str = "mnc";
    pub const MCC: &str = "mcc";

    // Fuel / engine
    pub const FUEL_LEVEL: &str = "fuel";
    pub const FUEL_USED: &str = "fuelUsed";
    pub const FUEL_CONSUMPTION: &str = "fuelConsumption";
    pub const RPM: &str = "rpm";
    pub const ENGINE_LOAD: &str = "engineLoad";
    pub const ENGINE_TEMP: &str = "engineTemp";
    pub const THROTTLE: &str = "throttle";
    pub const COOLANT_TEMP: &str = "coolantTemp";

    // Battery / power
    pub const BATTERY: &str = "battery";
    pub const BATTERY_LEVEL: &str = "batteryLevel";
    pub const POWER: &str = "power";
    pub const CHARGE: &str = "charge";
    pub const EXTERNAL_POWER: &str = "externalPower";

    // Odometer / distance
    pub const ODOMETER: &str = "odometer";
    pub const SERVICE_ODOMETER: &str = "serviceOdometer";
    pub const TRIP_ODOMETER: &str = "tripOdometer";
    pub const TOTAL_DISTANCE: &str = "totalDistance";
    pub const DISTANCE: &str = "distance";
    pub const TRIP_DISTANCE: &str = "tripDistance";

    // Control flags
    pub const IGNITION: &str = "ignition";
    pub const MOTION: &str = "motion";
    pub const ARMED: &str = "armed";
    pub const BLOCKED: &str = "blocked";
    pub const LOCK: &str = "lock";
    pub const DOOR: &str = "door";
    pub const HOURS: &str = "hours";
    pub const DRIVER_UNIQUE_ID: &str = "driverUniqueId";

    // Alarms / events
    pub const ALARM: &str = "alarm";
    pub const EVENT: &str = "event";
    pub const STATUS: &str = "status";

    // Geofences
    pub const GEOFENCE_IDS: &str = "geofenceIds";
    pub const GEOFENCE: &str = "geofence";
    pub const GEOFENCE_ID: &str = "geofenceId";

    // Environmental sensors
    pub const TEMPERATURE: &str = "temperature";
    pub const HUMIDITY: &str = "humidity";
    pub const PRESSURE: &str = "pressure";

    // OBD / CAN
    pub const OBD_SPEED: &str = "obdSpeed";
    pub const OBD_RPM: &str = "obdRpm";
    pub const OBD_FUEL: &str = "obdFuel";

    // Maintenance
    pub const MAINTENANCE: &str = "maintenance";
    pub const SERVICE_DUE: &str = "serviceDue";
    pub const OIL_LEVEL: &str = "oilLevel";
    pub const TIRE_PRESSURE: &str = "tirePressure";

    // Driver behavior
    pub const HARD_ACCELERATION: &str = "hardAcceleration";
    pub const HARD_BRAKING: &str = "hardBraking";
    pub const HARD_TURNING: &str = "hardTurning";
    pub const IDLING: &str = "idling";
    pub const OVERSPEED: &str = "overspeed";

    // Versions
    pub const PROTOCOL_VERSION: &str = "protocolVersion";
    pub const FIRMWARE_VERSION: &str = "firmwareVersion";
    pub const HARDWARE_VERSION: &str = "hardwareVersion";

    // Derived by the pipeline
    pub const OUTDATED: &str = "outdated";
    pub const SPEED_LIMIT: &str = "speedLimit";
    pub const BUFFER_DISTANCE: &str = "bufferDistance";
    pub const ALERT_ENABLED: &str = "alertEnabled";

    // Free-form extras
    pub const CUSTOM1: &str = "custom1";
    pub const CUSTOM2: &str = "custom2";
    pub const CUSTOM3: &str = "custom3";
    pub const CUSTOM4: &str = "custom4";
    pub const CUSTOM5: &str = "custom5";
}

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Coerces to bool. Integers and doubles map zero→false; strings parse
    /// "true"/"false"/"1"/"0".
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::Double(d) => Some(*d != 0.0),
            Value::Str(s) => match s.as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Coerces to i64, truncating doubles and parsing strings.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Double(d) => Some(*d as i64),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Coerces to f64, widening integers and parsing strings.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            Value::Int(i) => Some(*i as f64),
            Value::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Coerces to a string rendering of scalar values.
    pub fn as_str(&self) -> Option<String> {
        match self {
            Value::Str(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Double(d) => Some(d.to_string()),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// Ordered key/value attribute map with typed, defaulting accessors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeBag(BTreeMap<String, Value>);

impl AttributeBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Merges `other` into self, overwriting existing keys.
    pub fn extend(&mut self, other: &AttributeBag) {
        for (k, v) in other.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn bool_of(&self, key: &str, default: bool) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn int_of(&self, key: &str, default: i64) -> i64 {
        self.0.get(key).and_then(Value::as_int).unwrap_or(default)
    }

    pub fn double_of(&self, key: &str, default: f64) -> f64 {
        self.0.get(key).and_then(Value::as_double).unwrap_or(default)
    }

    pub fn str_of(&self, key: &str, default: &str) -> String {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_else(|| default.to_string())
    }

    /// Typed accessor for the bool flag when present at all.
    pub fn bool_opt(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn double_opt(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_double)
    }
}

impl FromIterator<(String, Value)> for AttributeBag {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        AttributeBag(iter.into_iter().collect())
    }
}

//! Per-device overspeed detection with hysteresis.
//!
//! A device transitions to overspeeding when its speed exceeds the
//! applicable limit plus the tolerance, and clears once a reading lands at
//! or below the limit itself. Readings inside the tolerance band neither
//! start nor clear the state.

use chrono::{DateTime, Utc};

use domain::models::DeviceAccumulators;

/// Overspeed tuning.
#[derive(Debug, Clone, Copy)]
pub struct OverspeedSettings {
    /// System-wide limit applied when no geofence carries one, km/h.
    pub default_limit_kmh: f64,
    /// Tolerance above the limit before the event fires, km/h.
    pub threshold_kmh: f64,
}

impl Default for OverspeedSettings {
    fn default() -> Self {
        Self {
            default_limit_kmh: 80.0,
            threshold_kmh: 5.0,
        }
    }
}

/// State transition produced by one reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OverspeedTransition {
    None,
    /// Entered the overspeeding state; carries the limit that applied.
    Started { limit_kmh: f64 },
    Cleared,
}

/// Feeds one speed reading through the detector, mutating the device
/// accumulators in place. `limit_kmh` is the resolved applicable limit.
pub fn check(
    acc: &mut DeviceAccumulators,
    speed_kmh: Option<f64>,
    limit_kmh: f64,
    settings: &OverspeedSettings,
    now: DateTime<Utc>,
) -> OverspeedTransition {
    let Some(speed) = speed_kmh else {
        return OverspeedTransition::None;
    };

    if speed > limit_kmh + settings.threshold_kmh {
        if !acc.overspeed_state {
            acc.overspeed_state = true;
            acc.overspeed_time = Some(now);
            return OverspeedTransition::Started { limit_kmh };
        }
        return OverspeedTransition::None;
    }

    if acc.overspeed_state && speed <= limit_kmh {
        acc.overspeed_state = false;
        acc.overspeed_time = Some(now);
        return OverspeedTransition::Cleared;
    }
    OverspeedTransition::None
}

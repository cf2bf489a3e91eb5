//! Per-device motion state machine.
//!
//! A device enters `moving` when a position lands at least `threshold_m`
//! from the stored motion anchor, and drops back to `still` when no
//! qualifying move arrives within `timeout`. Sub-threshold jitter around the
//! anchor never flips the state.

use chrono::{DateTime, Utc};

use domain::models::DeviceAccumulators;
use shared::geodesy::haversine_distance;

/// Motion detection tuning.
#[derive(Debug, Clone, Copy)]
pub struct MotionSettings {
    /// Minimum displacement from the anchor that counts as motion, meters.
    pub threshold_m: f64,
    /// Quiet interval after which a moving device is considered stopped.
    pub timeout_secs: i64,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            threshold_m: 50.0,
            timeout_secs: 300,
        }
    }
}

/// State transition produced by one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionTransition {
    None,
    Started,
    Stopped,
}

/// Tracks the motion anchor coordinates alongside the persisted accumulator
/// fields. The anchor re-establishes from the first position after restart.
#[derive(Debug, Default)]
pub struct MotionTracker {
    anchor: Option<(f64, f64)>,
}

impl MotionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one position through the state machine, mutating the device
    /// accumulators in place.
    pub fn update(
        &mut self,
        acc: &mut DeviceAccumulators,
        position_id: i64,
        latitude: f64,
        longitude: f64,
        now: DateTime<Utc>,
        settings: &MotionSettings,
    ) -> MotionTransition {
        let Some((anchor_lat, anchor_lon)) = self.anchor else {
            self.anchor = Some((latitude, longitude));
            acc.motion_position_id = Some(position_id);
            acc.motion_time = Some(now);
            return MotionTransition::None;
        };

        let displacement = haversine_distance(anchor_lat, anchor_lon, latitude, longitude);
        if displacement >= settings.threshold_m {
            self.anchor = Some((latitude, longitude));
            acc.motion_position_id = Some(position_id);
            acc.motion_time = Some(now);
            acc.motion_distance += displacement;
            if !acc.motion_state {
                acc.motion_state = true;
                acc.motion_streak = true;
                return MotionTransition::Started;
            }
            return MotionTransition::None;
        }

        if acc.motion_state {
            let quiet_since = acc.motion_time.unwrap_or(now);
            if (now - quiet_since).num_seconds() > settings.timeout_secs {
                acc.motion_state = false;
                acc.motion_streak = false;
                acc.motion_time = Some(now);
                return MotionTransition::Stopped;
            }
        }
        MotionTransition::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn settings() -> MotionSettings {
        MotionSettings::default()
    }

    #[test]
    fn test_first_position_anchors_without_transition() {
        let mut tracker = MotionTracker::new();
        let mut acc = DeviceAccumulators::default();
        let now = Utc::now();
        let t = tracker.update(&mut acc, 1, 0.0, 0.0, now, &settings());
        assert_eq!(t, MotionTransition::None);
        assert_eq!(acc.motion_position_id, Some(1));
        assert!(!acc.motion_state);
    }

    #[test]
    fn test_qualifying_move_starts_motion() {
        let mut tracker = MotionTracker::new();
        let mut acc = DeviceAccumulators::default();
        let now = Utc::now();
        tracker.update(&mut acc, 1, 0.0, 0.0, now, &settings());
        // ~111 m north.
        let t = tracker.update(&mut acc, 2, 0.001, 0.0, now, &settings());
        assert_eq!(t, MotionTransition::Started);
        assert!(acc.motion_state);
        assert!(acc.motion_streak);
        assert!(acc.motion_distance > 100.0);
        assert_eq!(acc.motion_position_id, Some(2));
    }

    #[test]
    fn test_sub_threshold_jitter_does_not_oscillate() {
        let mut tracker = MotionTracker::new();
        let mut acc = DeviceAccumulators::default();
        let now = Utc::now();
        tracker.update(&mut acc, 1, 0.0, 0.0, now, &settings());
        // ~11 m, well under the 50 m threshold.
        for i in 0..5 {
            let t = tracker.update(&mut acc, 2 + i, 0.0001, 0.0, now, &settings());
            assert_eq!(t, MotionTransition::None);
        }
        assert!(!acc.motion_state);
        assert_eq!(acc.motion_distance, 0.0);
    }

    #[test]
    fn test_threshold_boundary_is_stable() {
        let mut tracker = MotionTracker::new();
        let mut acc = DeviceAccumulators::default();
        let now = Utc::now();
        tracker.update(&mut acc, 1, 0.0, 0.0, now, &settings());
        // Just under 50 m: no transition.
        let t = tracker.update(&mut acc, 2, 0.000445, 0.0, now, &settings());
        assert_eq!(t, MotionTransition::None);
        // Just over 50 m from the unchanged anchor: starts.
        let t = tracker.update(&mut acc, 3, 0.000455, 0.0, now, &settings());
        assert_eq!(t, MotionTransition::Started);
    }

    #[test]
    fn test_timeout_stops_motion() {
        let mut tracker = MotionTracker::new();
        let mut acc = DeviceAccumulators::default();
        let start = Utc::now();
        tracker.update(&mut acc, 1, 0.0, 0.0, start, &settings());
        tracker.update(&mut acc, 2, 0.001, 0.0, start, &settings());
        assert!(acc.motion_state);

        // Quiet position inside the timeout: still moving.
        let t = tracker.update(
            &mut acc,
            3,
            0.001,
            0.0,
            start + Duration::seconds(100),
            &settings(),
        );
        assert_eq!(t, MotionTransition::None);
        assert!(acc.motion_state);

        // Quiet position beyond the timeout: stopped.
        let t = tracker.update(
            &mut acc,
            4,
            0.001,
            0.0,
            start + Duration::seconds(301),
            &settings(),
        );
        assert_eq!(t, MotionTransition::Stopped);
        assert!(!acc.motion_state);
    }

    #[test]
    fn test_continued_motion_accumulates_distance() {
        let mut tracker = MotionTracker::new();
        let mut acc = DeviceAccumulators::default();
        let now = Utc::now();
        tracker.update(&mut acc, 1, 0.0, 0.0, now, &settings());
        tracker.update(&mut acc, 2, 0.001, 0.0, now, &settings());
        let after_first = acc.motion_distance;
        let t = tracker.update(&mut acc, 3, 0.002, 0.0, now, &settings());
        assert_eq!(t, MotionTransition::None);
        assert!(acc.motion_distance > after_first);
    }
}

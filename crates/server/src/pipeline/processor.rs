//! The per-device position processing pipeline.
//!
//! Each worker owns one `Processor`; devices hash to exactly one worker, so
//! all state here is single-writer by construction. A processed position
//! flows through attribution, sanity filtering, enrichment, accumulator
//! updates, geofence residency, the motion and overspeed machines, event
//! synthesis, persistence and fan-out, in that order.

use chrono::{Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use domain::models::{
    keys, DecodedPosition, Device, DeviceStatus, Event, EventType, Position, Value,
};
use domain::services::{
    DeviceStore, GeofenceCache, PositionStore, StoreError, UnknownDeviceStore,
};

use crate::events::EventDispatcher;
use crate::hub::LiveHub;
use crate::pipeline::motion::MotionTracker;
use crate::pipeline::PipelineSettings;
use crate::pipeline::{overspeed, FrameSource};

/// Collaborators the processor talks to.
#[derive(Clone)]
pub struct ProcessorDeps {
    pub devices: Arc<dyn DeviceStore>,
    pub positions: Arc<dyn PositionStore>,
    pub unknown_devices: Arc<dyn UnknownDeviceStore>,
    pub geofences: GeofenceCache,
    pub dispatcher: Arc<EventDispatcher>,
    pub hub: LiveHub,
}

/// Why a decoded position was not processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    OutOfRange,
    Duplicate,
    DeviceDisabled,
}

/// Result of pushing one decoded position through the pipeline.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// Attributed, stored and fanned out.
    Processed {
        position: Position,
        events: Vec<Event>,
    },
    /// Stored against an unknown device; no events, no broadcast.
    Unknown { position: Position },
    Dropped(DropReason),
}

/// Cached per-device state owned by one worker.
struct DeviceRuntime {
    device: Device,
    last_position: Option<Position>,
    residency: HashSet<i64>,
    motion: MotionTracker,
}

impl DeviceRuntime {
    fn new(device: Device) -> Self {
        Self {
            device,
            last_position: None,
            residency: HashSet::new(),
            motion: MotionTracker::new(),
        }
    }
}

/// Single-writer pipeline state for the devices hashed to one worker.
pub struct Processor {
    deps: ProcessorDeps,
    settings: PipelineSettings,
    states: HashMap<String, DeviceRuntime>,
}

impl Processor {
    pub fn new(deps: ProcessorDeps, settings: PipelineSettings) -> Self {
        Self {
            deps,
            settings,
            states: HashMap::new(),
        }
    }

    /// Runs the full pipeline for one decoded position.
    pub async fn process(
        &mut self,
        decoded: DecodedPosition,
        source: FrameSource,
    ) -> Result<ProcessOutcome, StoreError> {
        if !decoded.coordinates_in_range() {
            warn!(
                unique_id = %decoded.unique_id,
                latitude = decoded.latitude,
                longitude = decoded.longitude,
                "Dropping position with out-of-range coordinates"
            );
            return Ok(ProcessOutcome::Dropped(DropReason::OutOfRange));
        }

        let unique_id = decoded.unique_id.clone();
        if !self.states.contains_key(&unique_id) {
            match self.deps.devices.find_by_unique_id(&unique_id).await? {
                Some(device) => {
                    self.states
                        .insert(unique_id.clone(), DeviceRuntime::new(device));
                }
                None => return self.process_unknown(decoded, source).await,
            }
        }

        let server_time = Utc::now();
        let runtime = self.states.get_mut(&unique_id).expect("state just inserted");
        if runtime.device.disabled {
            debug!(unique_id = %unique_id, "Dropping position for disabled device");
            return Ok(ProcessOutcome::Dropped(DropReason::DeviceDisabled));
        }

        // Exact repeat of the previous stored report is a no-op.
        if let Some(prev) = &runtime.last_position {
            if prev.fix_time == decoded.fix_time
                && prev.latitude == decoded.latitude
                && prev.longitude == decoded.longitude
            {
                return Ok(ProcessOutcome::Dropped(DropReason::Duplicate));
            }
        }

        let mut position = Position {
            id: 0,
            device_id: Some(runtime.device.id),
            unknown_device_id: None,
            protocol: decoded.protocol.clone(),
            server_time,
            device_time: decoded.device_time,
            fix_time: decoded.fix_time,
            valid: decoded.valid,
            latitude: decoded.latitude,
            longitude: decoded.longitude,
            altitude: decoded.altitude,
            speed: decoded.speed,
            course: decoded.course,
            accuracy: decoded.accuracy,
            address: None,
            attributes: decoded.attributes.clone(),
        };

        let skew = Duration::seconds(self.settings.skew_secs);
        let outdated = match (position.fix_time, runtime.last_position.as_ref().and_then(|p| p.fix_time)) {
            (Some(fix), Some(prev_fix)) => fix + skew < prev_fix,
            _ => false,
        };
        if outdated {
            position.attributes.set(keys::OUTDATED, true);
        }

        // Enrichment: great-circle distance from the previous accepted
        // position, zeroed across trip gaps.
        let trip_gap = Duration::seconds(self.settings.trip_gap_secs);
        let mut distance = 0.0;
        if !outdated {
            if let Some(prev) = &runtime.last_position {
                if server_time - prev.server_time <= trip_gap {
                    distance = shared::geodesy::haversine_distance(
                        prev.latitude,
                        prev.longitude,
                        position.latitude,
                        position.longitude,
                    );
                }
            }
        }
        position.attributes.set(keys::DISTANCE, distance);

        if !position.attributes.contains(keys::MOTION) {
            let speed = position.speed.unwrap_or(0.0);
            position
                .attributes
                .set(keys::MOTION, speed >= self.settings.motion_speed_threshold_kmh);
        }

        // Accumulators never run for outdated reports.
        if !outdated {
            let prev_server_time = runtime.last_position.as_ref().map(|p| p.server_time);
            let acc = &mut runtime.device.accumulators;
            acc.total_distance += distance;

            let ignition = position.attributes.bool_opt(keys::IGNITION);
            let moving = position.attributes.bool_of(keys::MOTION, false);
            if ignition.unwrap_or(moving) {
                if let Some(prev_time) = prev_server_time {
                    let delta = (server_time - prev_time)
                        .num_seconds()
                        .clamp(0, self.settings.trip_gap_secs);
                    acc.hours += delta;
                }
            }
        }
        position.attributes.set(
            keys::TOTAL_DISTANCE,
            runtime.device.accumulators.total_distance,
        );
        position
            .attributes
            .set(keys::HOURS, runtime.device.accumulators.hours);

        // Geofence residency for the new point.
        let snapshot = self.deps.geofences.snapshot();
        let current_residency = snapshot.point_in(position.latitude, position.longitude);
        let mut residency_ids: Vec<i64> = current_residency.iter().copied().collect();
        residency_ids.sort_unstable();
        position.attributes.set(
            keys::GEOFENCE_IDS,
            Value::List(residency_ids.iter().map(|&id| Value::Int(id)).collect()),
        );

        let prev_ignition = runtime
            .last_position
            .as_ref()
            .and_then(|p| p.attributes.bool_opt(keys::IGNITION));

        // Persist the position before any event that references it.
        let stored = self.deps.positions.insert(position).await?;
        metrics::counter!(
            "positions_processed_total",
            "protocol" => stored.protocol.clone()
        )
        .increment(1);

        let mut events = Vec::new();

        // Any accepted frame proves the device is online.
        let was_offline = runtime.device.status != DeviceStatus::Online;
        runtime.device.status = DeviceStatus::Online;
        runtime.device.last_update = Some(server_time);
        self.deps
            .devices
            .update_status(runtime.device.id, DeviceStatus::Online, server_time)
            .await?;
        if was_offline {
            events.push(
                Event::new(EventType::DeviceOnline, runtime.device.id, server_time)
                    .with_position(stored.id),
            );
        }

        if !outdated {
            let mut entered: Vec<i64> = current_residency
                .difference(&runtime.residency)
                .copied()
                .collect();
            entered.sort_unstable();
            for geofence_id in entered {
                events.push(
                    Event::new(EventType::GeofenceEnter, runtime.device.id, server_time)
                        .with_position(stored.id)
                        .with_geofence(geofence_id),
                );
            }
            let mut exited: Vec<i64> = runtime
                .residency
                .difference(&current_residency)
                .copied()
                .collect();
            exited.sort_unstable();
            for geofence_id in exited {
                events.push(
                    Event::new(EventType::GeofenceExit, runtime.device.id, server_time)
                        .with_position(stored.id)
                        .with_geofence(geofence_id),
                );
            }
            runtime.residency = current_residency;

            let motion_transition = runtime.motion.update(
                &mut runtime.device.accumulators,
                stored.id,
                stored.latitude,
                stored.longitude,
                server_time,
                &self.settings.motion,
            );
            match motion_transition {
                crate::pipeline::motion::MotionTransition::Started => events.push(
                    Event::new(EventType::DeviceMoving, runtime.device.id, server_time)
                        .with_position(stored.id),
                ),
                crate::pipeline::motion::MotionTransition::Stopped => events.push(
                    Event::new(EventType::DeviceStopped, runtime.device.id, server_time)
                        .with_position(stored.id),
                ),
                crate::pipeline::motion::MotionTransition::None => {}
            }

            let limit = snapshot
                .speed_limit_at(
                    stored.latitude,
                    stored.longitude,
                    runtime.device.accumulators.overspeed_geofence_id,
                )
                .unwrap_or(self.settings.overspeed.default_limit_kmh);
            match overspeed::check(
                &mut runtime.device.accumulators,
                stored.speed,
                limit,
                &self.settings.overspeed,
                server_time,
            ) {
                overspeed::OverspeedTransition::Started { limit_kmh } => {
                    let mut event =
                        Event::new(EventType::DeviceOverspeed, runtime.device.id, server_time)
                            .with_position(stored.id);
                    event.attributes.set(keys::SPEED_LIMIT, limit_kmh);
                    if let Some(speed) = stored.speed {
                        event.attributes.set("speed", speed);
                    }
                    events.push(event);
                }
                overspeed::OverspeedTransition::Cleared | overspeed::OverspeedTransition::None => {}
            }

            if let Some(current) = stored.attributes.bool_opt(keys::IGNITION) {
                if let Some(previous) = prev_ignition {
                    if current != previous {
                        let event_type = if current {
                            EventType::IgnitionOn
                        } else {
                            EventType::IgnitionOff
                        };
                        events.push(
                            Event::new(event_type, runtime.device.id, server_time)
                                .with_position(stored.id),
                        );
                    }
                }
            }

            if let Some(alarm) = stored.attributes.get(keys::ALARM).and_then(Value::as_str) {
                let mut event = Event::new(EventType::Alarm, runtime.device.id, server_time)
                    .with_position(stored.id);
                event.attributes.set(keys::ALARM, alarm);
                events.push(event);
            }
        }

        self.deps
            .devices
            .update_accumulators(runtime.device.id, runtime.device.accumulators.clone())
            .await?;

        let events = self
            .deps
            .dispatcher
            .dispatch_best_effort(events, &runtime.device)
            .await;

        let recipients = self.deps.dispatcher.recipients_for(runtime.device.id);
        self.deps.hub.publish_position(&stored, recipients.clone());
        if was_offline {
            self.deps
                .hub
                .publish_device_status(&runtime.device, recipients);
        }

        runtime.last_position = Some(stored.clone());
        Ok(ProcessOutcome::Processed {
            position: stored,
            events,
        })
    }

    /// Attribution failed: record the sighting and keep the position, but
    /// emit nothing downstream.
    async fn process_unknown(
        &mut self,
        decoded: DecodedPosition,
        source: FrameSource,
    ) -> Result<ProcessOutcome, StoreError> {
        let now = Utc::now();
        let unknown = self
            .deps
            .unknown_devices
            .upsert_sighting(
                &decoded.unique_id,
                &decoded.protocol,
                source.port,
                source.transport.as_str(),
                now,
            )
            .await?;
        debug!(
            unique_id = %decoded.unique_id,
            protocol = %decoded.protocol,
            sightings = unknown.connection_count,
            "Position from unregistered identifier"
        );
        metrics::counter!("unknown_device_positions_total").increment(1);

        let position = Position {
            id: 0,
            device_id: None,
            unknown_device_id: Some(unknown.id),
            protocol: decoded.protocol,
            server_time: now,
            device_time: decoded.device_time,
            fix_time: decoded.fix_time,
            valid: decoded.valid,
            latitude: decoded.latitude,
            longitude: decoded.longitude,
            altitude: decoded.altitude,
            speed: decoded.speed,
            course: decoded.course,
            accuracy: decoded.accuracy,
            address: None,
            attributes: decoded.attributes,
        };
        let stored = self.deps.positions.insert(position).await?;
        Ok(ProcessOutcome::Unknown { position: stored })
    }

    /// Marks a device offline and emits the corresponding event. Invoked
    /// when its last session is released or by the offline sweep.
    pub async fn device_offline(&mut self, device_id: i64) -> Result<(), StoreError> {
        let now = Utc::now();
        let device = match self
            .states
            .values_mut()
            .find(|runtime| runtime.device.id == device_id)
        {
            Some(runtime) => {
                if runtime.device.status == DeviceStatus::Offline {
                    return Ok(());
                }
                runtime.device.status = DeviceStatus::Offline;
                runtime.device.last_update = Some(now);
                runtime.device.clone()
            }
            None => match self.deps.devices.find_by_id(device_id).await? {
                Some(mut device) => {
                    if device.status == DeviceStatus::Offline {
                        return Ok(());
                    }
                    device.status = DeviceStatus::Offline;
                    device.last_update = Some(now);
                    device
                }
                None => return Ok(()),
            },
        };

        self.deps
            .devices
            .update_status(device_id, DeviceStatus::Offline, now)
            .await?;
        let events = vec![Event::new(EventType::DeviceOffline, device_id, now)];
        self.deps
            .dispatcher
            .dispatch_best_effort(events, &device)
            .await;
        let recipients = self.deps.dispatcher.recipients_for(device_id);
        self.deps.hub.publish_device_status(&device, recipients);
        Ok(())
    }
}

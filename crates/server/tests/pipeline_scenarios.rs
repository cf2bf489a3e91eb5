//! End-to-end pipeline scenarios over in-memory stores.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};

use domain::models::{
    keys, AttributeBag, DecodedPosition, Device, DeviceStatus, EventType, Geofence,
};
use domain::services::{
    GeofenceCache, MemoryDeviceStore, MemoryEventStore, MemoryPositionStore,
    MemoryUnknownDeviceStore, StaticUserAccess,
};
use shared::geodesy::haversine_distance;
use trackhub_server::events::EventDispatcher;
use trackhub_server::hub::{HubSettings, LiveHub, ServerFrame, Topic};
use trackhub_server::pipeline::{
    DropReason, FrameSource, PipelineSettings, ProcessOutcome, Processor, ProcessorDeps,
};
use trackhub_server::protocol::suntech::SuntechProtocol;
use trackhub_server::protocol::{Decoded, DecodeContext, Protocol, Transport};

struct Fixture {
    processor: Processor,
    devices: Arc<MemoryDeviceStore>,
    positions: Arc<MemoryPositionStore>,
    events: Arc<MemoryEventStore>,
    unknown: Arc<MemoryUnknownDeviceStore>,
    hub: LiveHub,
    geofences: GeofenceCache,
}

fn fixture() -> Fixture {
    fixture_with_settings(PipelineSettings::default())
}

fn fixture_with_settings(settings: PipelineSettings) -> Fixture {
    let devices = Arc::new(MemoryDeviceStore::new());
    let positions = Arc::new(MemoryPositionStore::new());
    let events = Arc::new(MemoryEventStore::new());
    let unknown = Arc::new(MemoryUnknownDeviceStore::new());
    let hub = LiveHub::new(HubSettings::default());
    let geofences = GeofenceCache::new();
    let access = StaticUserAccess::new();
    access.add_admin(1);
    let dispatcher = Arc::new(EventDispatcher::new(
        events.clone(),
        Arc::new(access),
        hub.clone(),
    ));
    let processor = Processor::new(
        ProcessorDeps {
            devices: devices.clone(),
            positions: positions.clone(),
            unknown_devices: unknown.clone(),
            geofences: geofences.clone(),
            dispatcher,
            hub: hub.clone(),
        },
        settings,
    );
    Fixture {
        processor,
        devices,
        positions,
        events,
        unknown,
        hub,
        geofences,
    }
}

fn register_device(fixture: &Fixture, id: i64, unique_id: &str) {
    fixture.devices.insert(Device {
        id,
        unique_id: unique_id.to_string(),
        name: format!("device-{}", id),
        status: DeviceStatus::Unknown,
        last_update: None,
        group_id: None,
        phone: None,
        calendar_id: None,
        expiration_time: None,
        disabled: false,
        accumulators: Default::default(),
        attributes: AttributeBag::new(),
    });
}

fn tcp_source(port: u16) -> FrameSource {
    FrameSource {
        port,
        transport: Transport::Tcp,
    }
}

fn decoded(unique_id: &str, lat: f64, lon: f64, speed: f64, fix_offset_secs: i64) -> DecodedPosition {
    let mut position = DecodedPosition::new(unique_id, "osmand");
    position.latitude = lat;
    position.longitude = lon;
    position.speed = Some(speed);
    position.valid = true;
    position.fix_time = Some(Utc::now() + Duration::seconds(fix_offset_secs));
    position
}

fn circle_geofence(id: i64, lat: f64, lon: f64, radius_m: f64) -> Geofence {
    Geofence {
        id,
        name: format!("zone-{}", id),
        description: None,
        geometry: format!(
            r#"{{"type":"Circle","coordinates":[{},{},{}]}}"#,
            lon, lat, radius_m
        ),
        disabled: false,
        calendar_id: None,
        attributes: AttributeBag::new(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn event_types(fixture: &Fixture) -> Vec<EventType> {
    fixture.events.all().iter().map(|e| e.event_type).collect()
}

// Scenario: a raw Suntech ASCII frame becomes one normalized position and
// flips the device online.
#[tokio::test]
async fn suntech_frame_end_to_end() {
    let mut fixture = fixture();
    register_device(&fixture, 7, "907126119");

    let frame = b"ST300STT;907126119;04;1097B;20250908;12:44:33;33e530;-03.843813;-038.615475;000.013;000.00;11;1;26663840;14.07;000000;1;0019;295746;0.0;0;0;00000000000000;0";
    let protocol = SuntechProtocol::new();
    let mut ctx = DecodeContext::default();
    let decoded_frame = protocol.decode(frame, &mut ctx).unwrap();
    let positions = match decoded_frame {
        Decoded::Positions(positions) => positions,
        other => panic!("unexpected decode: {:?}", other),
    };

    let outcome = fixture
        .processor
        .process(positions.into_iter().next().unwrap(), tcp_source(5001))
        .await
        .unwrap();

    let position = match outcome {
        ProcessOutcome::Processed { position, .. } => position,
        other => panic!("unexpected outcome: {:?}", other),
    };
    assert_eq!(position.device_id, Some(7));
    assert_eq!(position.latitude, -3.843813);
    assert_eq!(position.longitude, -38.615475);
    assert!((position.speed.unwrap() - 0.013).abs() < 1e-9);
    assert!(position.valid);
    assert_eq!(position.attributes.int_of(keys::SATELLITES, 0), 11);
    assert_eq!(position.attributes.double_of(keys::POWER, 0.0), 14.07);
    assert!(!position.attributes.bool_of(keys::IGNITION, true));

    // Exactly one position stored; device now online.
    assert_eq!(fixture.positions.all().len(), 1);
    let device = fixture.devices.get(7).unwrap();
    assert_eq!(device.status, DeviceStatus::Online);
    assert!(event_types(&fixture).contains(&EventType::DeviceOnline));
}

// Scenario: an OsmAnd query-string report is stored with motion set and
// published to position subscribers.
#[tokio::test]
async fn osmand_query_ingestion_publishes_position() {
    let mut fixture = fixture();
    register_device(&fixture, 3, "test-device-001");
    let mut rx = fixture.hub.subscribe();

    let params: std::collections::HashMap<String, String> = [
        ("id", "test-device-001"),
        ("lat", "-23.5505"),
        ("lon", "-46.6333"),
        ("timestamp", "1694000000"),
        ("speed", "15.5"),
        ("course", "180"),
        ("altitude", "760"),
        ("accuracy", "5"),
        ("battery", "85"),
        ("valid", "1"),
        ("motion", "1"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let decoded =
        trackhub_server::protocol::osmand::OsmandProtocol::decode_query(&params).unwrap();

    let outcome = fixture
        .processor
        .process(
            decoded,
            FrameSource {
                port: 5055,
                transport: Transport::Http,
            },
        )
        .await
        .unwrap();

    let position = match outcome {
        ProcessOutcome::Processed { position, .. } => position,
        other => panic!("unexpected outcome: {:?}", other),
    };
    assert!(position.attributes.bool_of(keys::MOTION, false));

    // The hub delivered the position to subscribers of that device.
    let mut saw_position = false;
    while let Ok(message) = rx.try_recv() {
        if message.topic == Topic::Positions {
            match &message.frame {
                ServerFrame::Position(p) => {
                    assert_eq!(p.device_id, Some(3));
                    assert!(message.recipients.contains(&1));
                    saw_position = true;
                }
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }
    assert!(saw_position);
}

// Scenario: moving from outside to inside a circular geofence emits one
// enter event, and only on the crossing position.
#[tokio::test]
async fn geofence_enter_and_exit() {
    let mut fixture = fixture();
    register_device(&fixture, 5, "geo-device");
    fixture
        .geofences
        .reload(&[circle_geofence(11, -23.5505, -46.6333, 1000.0)]);

    // Outside the fence.
    fixture
        .processor
        .process(decoded("geo-device", -23.56, -46.64, 0.0, 0), tcp_source(5001))
        .await
        .unwrap();
    let types = event_types(&fixture);
    assert!(!types.contains(&EventType::GeofenceEnter));

    // Inside the fence.
    let outcome = fixture
        .processor
        .process(
            decoded("geo-device", -23.5506, -46.6334, 0.0, 10),
            tcp_source(5001),
        )
        .await
        .unwrap();
    let events = match outcome {
        ProcessOutcome::Processed { events, .. } => events,
        other => panic!("unexpected outcome: {:?}", other),
    };
    let enters: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventType::GeofenceEnter)
        .collect();
    assert_eq!(enters.len(), 1);
    assert_eq!(enters[0].geofence_id, Some(11));

    // Leaving again emits exactly one exit.
    let outcome = fixture
        .processor
        .process(
            decoded("geo-device", -23.56, -46.64, 0.0, 20),
            tcp_source(5001),
        )
        .await
        .unwrap();
    let events = match outcome {
        ProcessOutcome::Processed { events, .. } => events,
        other => panic!("unexpected outcome: {:?}", other),
    };
    let exits: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventType::GeofenceExit)
        .collect();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].geofence_id, Some(11));
}

// Scenario: overspeed fires once between the 70 and 86 readings, does not
// repeat at 90, and clears on the trailing 70.
#[tokio::test]
async fn overspeed_hysteresis() {
    let mut fixture = fixture();
    register_device(&fixture, 9, "fast-device");

    let speeds = [70.0, 86.0, 90.0, 70.0];
    for (i, speed) in speeds.iter().enumerate() {
        fixture
            .processor
            .process(
                decoded("fast-device", 0.01 * i as f64, 0.0, *speed, i as i64 * 10),
                tcp_source(5001),
            )
            .await
            .unwrap();
    }

    let overspeed_count = event_types(&fixture)
        .iter()
        .filter(|&&t| t == EventType::DeviceOverspeed)
        .count();
    assert_eq!(overspeed_count, 1);

    let device = fixture.devices.get(9).unwrap();
    assert!(!device.accumulators.overspeed_state);
}

// Scenario: frames from an unregistered identifier land on an unknown
// device row, with no events and no broadcast.
#[tokio::test]
async fn unknown_device_path() {
    let mut fixture = fixture();
    let mut rx = fixture.hub.subscribe();

    let outcome = fixture
        .processor
        .process(decoded("NEW42", 1.0, 2.0, 0.0, 0), tcp_source(5001))
        .await
        .unwrap();
    let position = match outcome {
        ProcessOutcome::Unknown { position } => position,
        other => panic!("unexpected outcome: {:?}", other),
    };
    assert!(position.device_id.is_none());
    assert!(position.unknown_device_id.is_some());

    let rows = fixture.unknown.all();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].unique_id, "NEW42");
    assert_eq!(rows[0].connection_count, 1);

    // A second sighting bumps the counter instead of creating a new row.
    fixture
        .processor
        .process(decoded("NEW42", 1.1, 2.0, 0.0, 10), tcp_source(5001))
        .await
        .unwrap();
    let rows = fixture.unknown.all();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].connection_count, 2);

    assert!(fixture.events.all().is_empty());
    assert!(rx.try_recv().is_err(), "unknown devices must not broadcast");
}

// Invariant: accumulators never decrease, and per-leg distance matches the
// haversine formula within a meter.
#[tokio::test]
async fn accumulators_are_monotone_and_distance_exact() {
    let mut fixture = fixture();
    register_device(&fixture, 4, "acc-device");

    let track = [
        (0.0, 0.0),
        (0.001, 0.0),
        (0.002, 0.001),
        (0.004, 0.001),
        (0.004, 0.003),
    ];
    let mut previous_total = 0.0;
    let mut previous_point: Option<(f64, f64)> = None;

    for (i, (lat, lon)) in track.iter().enumerate() {
        let mut report = decoded("acc-device", *lat, *lon, 30.0, i as i64 * 10);
        report.attributes.set(keys::IGNITION, true);
        let outcome = fixture
            .processor
            .process(report, tcp_source(5001))
            .await
            .unwrap();
        let position = match outcome {
            ProcessOutcome::Processed { position, .. } => position,
            other => panic!("unexpected outcome: {:?}", other),
        };

        let total = position.attributes.double_of(keys::TOTAL_DISTANCE, -1.0);
        assert!(total >= previous_total, "total distance decreased");
        previous_total = total;

        if let Some((prev_lat, prev_lon)) = previous_point {
            let expected = haversine_distance(prev_lat, prev_lon, *lat, *lon);
            let reported = position.attributes.double_of(keys::DISTANCE, -1.0);
            assert!(
                (reported - expected).abs() < 1.0,
                "distance {} differs from haversine {}",
                reported,
                expected
            );
        }
        previous_point = Some((*lat, *lon));
    }

    let device = fixture.devices.get(4).unwrap();
    assert!(device.accumulators.total_distance > 0.0);
    // Wall-clock deltas between test submissions round to zero seconds;
    // the engine-hours gate only guarantees monotonicity here.
    assert!(device.accumulators.hours >= 0);
}

// Idempotence: re-processing an identical report produces no new rows, no
// events and no accumulator movement.
#[tokio::test]
async fn reprocessing_identical_position_is_noop() {
    let mut fixture = fixture();
    register_device(&fixture, 6, "idem-device");

    let report = decoded("idem-device", 10.0, 20.0, 40.0, 0);
    fixture
        .processor
        .process(report.clone(), tcp_source(5001))
        .await
        .unwrap();

    let positions_before = fixture.positions.all().len();
    let events_before = fixture.events.all().len();
    let distance_before = fixture.devices.get(6).unwrap().accumulators.total_distance;

    let outcome = fixture
        .processor
        .process(report, tcp_source(5001))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        ProcessOutcome::Dropped(DropReason::Duplicate)
    ));

    assert_eq!(fixture.positions.all().len(), positions_before);
    assert_eq!(fixture.events.all().len(), events_before);
    assert_eq!(
        fixture.devices.get(6).unwrap().accumulators.total_distance,
        distance_before
    );
}

// Boundary: coordinates at the poles and the antimeridian are accepted;
// anything past them is rejected.
#[tokio::test]
async fn coordinate_boundaries() {
    let mut fixture = fixture();
    register_device(&fixture, 8, "edge-device");

    let outcome = fixture
        .processor
        .process(decoded("edge-device", 90.0, -180.0, 0.0, 0), tcp_source(5001))
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Processed { .. }));

    let outcome = fixture
        .processor
        .process(
            decoded("edge-device", 90.0000001, 0.0, 0.0, 10),
            tcp_source(5001),
        )
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        ProcessOutcome::Dropped(DropReason::OutOfRange)
    ));
}

// Boundary: a fix inside the skew bound is accepted as current; one beyond
// it is stored but flagged outdated and moves no accumulator.
#[tokio::test]
async fn outdated_positions_flagged_beyond_skew() {
    let mut fixture = fixture_with_settings(PipelineSettings {
        skew_secs: 300,
        ..Default::default()
    });
    register_device(&fixture, 2, "skew-device");

    fixture
        .processor
        .process(decoded("skew-device", 0.0, 0.0, 0.0, 0), tcp_source(5001))
        .await
        .unwrap();

    // Exactly at the skew bound: accepted as current.
    let outcome = fixture
        .processor
        .process(decoded("skew-device", 0.01, 0.0, 0.0, -300), tcp_source(5001))
        .await
        .unwrap();
    match outcome {
        ProcessOutcome::Processed { position, .. } => {
            assert!(!position.attributes.bool_of(keys::OUTDATED, false));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    // Beyond the bound relative to the latest stored fix (-300s): stored,
    // flagged, accumulators untouched.
    let distance_before = fixture.devices.get(2).unwrap().accumulators.total_distance;
    let outcome = fixture
        .processor
        .process(decoded("skew-device", 0.5, 0.0, 0.0, -700), tcp_source(5001))
        .await
        .unwrap();
    match outcome {
        ProcessOutcome::Processed { position, events } => {
            assert!(position.attributes.bool_of(keys::OUTDATED, false));
            assert!(events.is_empty());
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(
        fixture.devices.get(2).unwrap().accumulators.total_distance,
        distance_before
    );
}

// Determinism: for a fixed prior state and geofence snapshot, the same
// position yields the same event set.
#[tokio::test]
async fn event_synthesis_is_deterministic() {
    let run = || async {
        let mut fixture = fixture();
        register_device(&fixture, 12, "det-device");
        fixture
            .geofences
            .reload(&[circle_geofence(20, 0.0, 0.0, 5000.0)]);

        let mut collected: Vec<(EventType, Option<i64>)> = Vec::new();
        let reports = [
            decoded("det-device", 0.2, 0.0, 20.0, 0),
            decoded("det-device", 0.0, 0.0, 95.0, 10),
            decoded("det-device", 0.2, 0.0, 10.0, 20),
        ];
        for report in reports {
            let outcome = fixture
                .processor
                .process(report, tcp_source(5001))
                .await
                .unwrap();
            if let ProcessOutcome::Processed { events, .. } = outcome {
                collected.extend(events.iter().map(|e| (e.event_type, e.geofence_id)));
            }
        }
        collected
    };

    let first = run().await;
    let second = run().await;
    assert_eq!(first, second);
    // The middle report crosses into the fence while overspeeding.
    let types: HashSet<EventType> = first.iter().map(|(t, _)| *t).collect();
    assert!(types.contains(&EventType::GeofenceEnter));
    assert!(types.contains(&EventType::DeviceOverspeed));
    assert!(types.contains(&EventType::GeofenceExit));
}

// Ignition edge transitions synthesize ignitionOn / ignitionOff.
#[tokio::test]
async fn ignition_transitions() {
    let mut fixture = fixture();
    register_device(&fixture, 13, "ign-device");

    let mut off = decoded("ign-device", 0.0, 0.0, 0.0, 0);
    off.attributes.set(keys::IGNITION, false);
    fixture.processor.process(off, tcp_source(5001)).await.unwrap();

    let mut on = decoded("ign-device", 0.001, 0.0, 0.0, 10);
    on.attributes.set(keys::IGNITION, true);
    let outcome = fixture.processor.process(on, tcp_source(5001)).await.unwrap();
    let events = match outcome {
        ProcessOutcome::Processed { events, .. } => events,
        other => panic!("unexpected outcome: {:?}", other),
    };
    assert!(events.iter().any(|e| e.event_type == EventType::IgnitionOn));

    let mut off_again = decoded("ign-device", 0.002, 0.0, 0.0, 20);
    off_again.attributes.set(keys::IGNITION, false);
    let outcome = fixture
        .processor
        .process(off_again, tcp_source(5001))
        .await
        .unwrap();
    let events = match outcome {
        ProcessOutcome::Processed { events, .. } => events,
        other => panic!("unexpected outcome: {:?}", other),
    };
    assert!(events.iter().any(|e| e.event_type == EventType::IgnitionOff));
}

// Alarm attributes surface as alarm events preserving the alarm type.
#[tokio::test]
async fn alarm_attribute_emits_event() {
    let mut fixture = fixture();
    register_device(&fixture, 14, "alarm-device");

    let mut report = decoded("alarm-device", 0.0, 0.0, 0.0, 0);
    report.attributes.set(keys::ALARM, "sos");
    let outcome = fixture
        .processor
        .process(report, tcp_source(5001))
        .await
        .unwrap();
    let events = match outcome {
        ProcessOutcome::Processed { events, .. } => events,
        other => panic!("unexpected outcome: {:?}", other),
    };
    let alarm = events
        .iter()
        .find(|e| e.event_type == EventType::Alarm)
        .expect("alarm event expected");
    assert_eq!(alarm.attributes.str_of(keys::ALARM, ""), "sos");
}

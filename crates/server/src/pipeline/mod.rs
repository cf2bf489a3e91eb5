//! Position pipeline: per-device serialized processing over a worker pool.
//!
//! Devices hash to a fixed worker by wire identifier, so positions for one
//! device are processed in arrival order by a single task while devices
//! spread across workers run in parallel. Workers own all mutable device
//! state; there is no per-position locking.

pub mod motion;
pub mod overspeed;
pub mod processor;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use domain::models::DecodedPosition;

use crate::protocol::Transport;
pub use motion::MotionSettings;
pub use overspeed::OverspeedSettings;
pub use processor::{DropReason, ProcessOutcome, Processor, ProcessorDeps};

/// Where a frame came from, recorded on unknown-device sightings.
#[derive(Debug, Clone, Copy)]
pub struct FrameSource {
    pub port: u16,
    pub transport: Transport,
}

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Tolerated clock skew before a position counts as outdated, seconds.
    pub skew_secs: i64,
    /// Maximum gap between positions belonging to one trip, seconds.
    pub trip_gap_secs: i64,
    /// Speed from which motion is derived when the device reports none, km/h.
    pub motion_speed_threshold_kmh: f64,
    pub motion: MotionSettings,
    pub overspeed: OverspeedSettings,
    pub worker_count: usize,
    pub mailbox_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            skew_secs: 300,
            trip_gap_secs: 1800,
            motion_speed_threshold_kmh: 5.0,
            motion: MotionSettings::default(),
            overspeed: OverspeedSettings::default(),
            worker_count: 4,
            mailbox_capacity: 64,
        }
    }
}

enum PipelineMsg {
    Position {
        decoded: DecodedPosition,
        source: FrameSource,
    },
    DeviceOffline {
        device_id: i64,
    },
}

/// Handle over the worker pool.
pub struct PositionPipeline {
    senders: Vec<mpsc::Sender<PipelineMsg>>,
    handles: Vec<JoinHandle<()>>,
}

impl PositionPipeline {
    /// Spawns the worker pool.
    pub fn start(deps: ProcessorDeps, settings: PipelineSettings) -> Self {
        let worker_count = settings.worker_count.max(1);
        let mut senders = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);
        for worker_index in 0..worker_count {
            let (tx, mut rx) = mpsc::channel::<PipelineMsg>(settings.mailbox_capacity.max(1));
            let mut processor = Processor::new(deps.clone(), settings.clone());
            let handle = tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    match message {
                        PipelineMsg::Position { decoded, source } => {
                            let unique_id = decoded.unique_id.clone();
                            // One bad frame must never take the worker down.
                            if let Err(e) = processor.process(decoded, source).await {
                                error!(
                                    worker = worker_index,
                                    unique_id = %unique_id,
                                    error = %e,
                                    "Position processing failed"
                                );
                            }
                        }
                        PipelineMsg::DeviceOffline { device_id } => {
                            if let Err(e) = processor.device_offline(device_id).await {
                                error!(
                                    worker = worker_index,
                                    device_id,
                                    error = %e,
                                    "Offline transition failed"
                                );
                            }
                        }
                    }
                }
            });
            senders.push(tx);
            handles.push(handle);
        }
        info!(workers = worker_count, "Position pipeline started");
        Self { senders, handles }
    }

    fn worker_for(&self, unique_id: &str) -> &mpsc::Sender<PipelineMsg> {
        let mut hasher = DefaultHasher::new();
        unique_id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.senders.len();
        &self.senders[index]
    }

    /// Routes a decoded position to its device's worker. Applies mailbox
    /// backpressure to the calling listener, preserving arrival order.
    pub async fn submit(&self, decoded: DecodedPosition, source: FrameSource) {
        let sender = self.worker_for(&decoded.unique_id);
        if sender
            .send(PipelineMsg::Position { decoded, source })
            .await
            .is_err()
        {
            warn!("Pipeline worker gone; dropping position");
        }
    }

    /// Routes a device-offline transition through the device's worker so it
    /// serializes with its positions.
    pub async fn device_offline(&self, unique_id: &str, device_id: i64) {
        let sender = self.worker_for(unique_id);
        if sender
            .send(PipelineMsg::DeviceOffline { device_id })
            .await
            .is_err()
        {
            warn!(device_id, "Pipeline worker gone; dropping offline transition");
        }
    }

    /// Stops accepting work and waits for queued frames to drain.
    pub async fn shutdown(self, grace: Duration) {
        drop(self.senders);
        let drain = async {
            for handle in self.handles {
                if let Err(e) = handle.await {
                    warn!("Pipeline worker panicked: {}", e);
                }
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("Pipeline drain timed out after {:?}", grace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventDispatcher;
    use crate::hub::{HubSettings, LiveHub};
    use domain::models::{AttributeBag, Device, DeviceStatus};
    use domain::services::{
        GeofenceCache, MemoryDeviceStore, MemoryEventStore, MemoryPositionStore,
        MemoryUnknownDeviceStore, StaticUserAccess,
    };
    use std::sync::Arc;

    fn test_device(id: i64, unique_id: &str) -> Device {
        Device {
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
        }
    }

    fn deps(devices: Arc<MemoryDeviceStore>) -> (ProcessorDeps, Arc<MemoryPositionStore>) {
        let positions = Arc::new(MemoryPositionStore::new());
        let events = Arc::new(MemoryEventStore::new());
        let hub = LiveHub::new(HubSettings::default());
        let access = Arc::new(StaticUserAccess::new());
        let dispatcher = Arc::new(EventDispatcher::new(events, access, hub.clone()));
        (
            ProcessorDeps {
                devices,
                positions: positions.clone(),
                unknown_devices: Arc::new(MemoryUnknownDeviceStore::new()),
                geofences: GeofenceCache::new(),
                dispatcher,
                hub,
            },
            positions,
        )
    }

    #[tokio::test]
    async fn test_pipeline_processes_submitted_positions() {
        let devices = Arc::new(MemoryDeviceStore::new());
        devices.insert(test_device(1, "alpha"));
        let (deps, positions) = deps(devices);
        let pipeline = PositionPipeline::start(deps, PipelineSettings::default());

        let mut decoded = DecodedPosition::new("alpha", "osmand");
        decoded.latitude = 1.0;
        decoded.longitude = 2.0;
        decoded.valid = true;
        pipeline
            .submit(
                decoded,
                FrameSource {
                    port: 5055,
                    transport: Transport::Http,
                },
            )
            .await;

        pipeline.shutdown(Duration::from_secs(5)).await;
        let stored = positions.all();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].device_id, Some(1));
    }

    #[tokio::test]
    async fn test_same_device_keeps_arrival_order() {
        let devices = Arc::new(MemoryDeviceStore::new());
        devices.insert(test_device(1, "alpha"));
        let (deps, positions) = deps(devices);
        let pipeline = PositionPipeline::start(
            deps,
            PipelineSettings {
                worker_count: 4,
                ..Default::default()
            },
        );

        for i in 0..20 {
            let mut decoded = DecodedPosition::new("alpha", "osmand");
            decoded.latitude = i as f64 * 0.01;
            decoded.longitude = 0.0;
            decoded.valid = true;
            pipeline
                .submit(
                    decoded,
                    FrameSource {
                        port: 5055,
                        transport: Transport::Http,
                    },
                )
                .await;
        }
        pipeline.shutdown(Duration::from_secs(5)).await;

        let stored = positions.all();
        assert_eq!(stored.len(), 20);
        for (i, p) in stored.iter().enumerate() {
            assert!((p.latitude - i as f64 * 0.01).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_worker_assignment_is_stable() {
        let devices = Arc::new(MemoryDeviceStore::new());
        let (deps, _) = deps(devices);
        let pipeline = PositionPipeline::start(deps, PipelineSettings::default());
        let first = pipeline.worker_for("device-42") as *const _;
        let second = pipeline.worker_for("device-42") as *const _;
        assert_eq!(first, second);
        pipeline.shutdown(Duration::from_secs(1)).await;
    }
}

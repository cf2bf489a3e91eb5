//! Offline sweep.
//!
//! Devices that stop reporting never send a "goodbye"; this sweep moves
//! silent devices to offline and emits the corresponding event through
//! their pipeline worker so it serializes with any in-flight positions.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use domain::models::DeviceStatus;
use domain::services::DeviceStore;

use crate::jobs::maintenance::MaintenanceTask;
use crate::pipeline::PositionPipeline;

/// Sweeps silent devices offline.
pub struct OfflineSweep {
    devices: Arc<dyn DeviceStore>,
    pipeline: Arc<PositionPipeline>,
    offline_timeout_secs: i64,
}

impl OfflineSweep {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        pipeline: Arc<PositionPipeline>,
        offline_timeout_secs: i64,
    ) -> Self {
        Self {
            devices,
            pipeline,
            offline_timeout_secs,
        }
    }
}

#[async_trait::async_trait]
impl MaintenanceTask for OfflineSweep {
    fn name(&self) -> &'static str {
        "offline_sweep"
    }

    fn cadence(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn run(&self) -> Result<(), String> {
        let horizon = Utc::now() - ChronoDuration::seconds(self.offline_timeout_secs);
        let devices = self.devices.list().await.map_err(|e| e.to_string())?;
        for device in devices {
            if device.status != DeviceStatus::Online {
                continue;
            }
            let silent = device.last_update.map(|t| t < horizon).unwrap_or(true);
            if silent {
                self.pipeline
                    .device_offline(&device.unique_id, device.id)
                    .await;
            }
        }
        Ok(())
    }
}

//! Device expiration.
//!
//! Devices past their `expiration_time` are disabled and their live
//! sessions closed; subsequent frames fall out in the pipeline.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use domain::services::DeviceStore;

use crate::jobs::maintenance::MaintenanceTask;
use crate::session::SessionRegistry;

/// Disables expired devices.
pub struct DeviceExpiration {
    devices: Arc<dyn DeviceStore>,
    sessions: Arc<SessionRegistry>,
}

impl DeviceExpiration {
    pub fn new(devices: Arc<dyn DeviceStore>, sessions: Arc<SessionRegistry>) -> Self {
        Self { devices, sessions }
    }
}

#[async_trait::async_trait]
impl MaintenanceTask for DeviceExpiration {
    fn name(&self) -> &'static str {
        "device_expiration"
    }

    fn cadence(&self) -> Duration {
        Duration::from_secs(3600)
    }

    async fn run(&self) -> Result<(), String> {
        let now = Utc::now();
        let devices = self.devices.list().await.map_err(|e| e.to_string())?;
        for device in devices {
            if device.disabled || !device.is_expired(now) {
                continue;
            }
            self.devices
                .set_disabled(device.id, true)
                .await
                .map_err(|e| e.to_string())?;
            if let Some(session) = self.sessions.lookup_by_device(device.id) {
                session.close("device expired");
            }
            info!(device_id = device.id, "Expired device disabled");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use domain::models::{AttributeBag, Device, DeviceStatus};
    use domain::services::MemoryDeviceStore;

    fn device(id: i64, expired: bool) -> Device {
        Device {
            id,
            unique_id: format!("dev-{}", id),
            name: format!("device-{}", id),
            status: DeviceStatus::Online,
            last_update: None,
            group_id: None,
            phone: None,
            calendar_id: None,
            expiration_time: expired.then(|| Utc::now() - ChronoDuration::hours(1)),
            disabled: false,
            accumulators: Default::default(),
            attributes: AttributeBag::new(),
        }
    }

    #[tokio::test]
    async fn test_expired_devices_disabled() {
        let devices = Arc::new(MemoryDeviceStore::new());
        devices.insert(device(1, true));
        devices.insert(device(2, false));
        let task = DeviceExpiration::new(devices.clone(), Arc::new(SessionRegistry::new()));

        task.run().await.unwrap();

        assert!(devices.get(1).unwrap().disabled);
        assert!(!devices.get(2).unwrap().disabled);
    }
}

//! Recurring maintenance around the pipeline.

pub mod device_expiration;
pub mod maintenance;
pub mod offline_sweep;
pub mod pool_metrics;
pub mod scheduled_commands;

pub use device_expiration::DeviceExpiration;
pub use maintenance::{Maintenance, MaintenanceTask};
pub use offline_sweep::OfflineSweep;
pub use pool_metrics::PoolGauges;
pub use scheduled_commands::ScheduledCommandRunner;

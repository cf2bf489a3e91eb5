//! Repository implementations of the domain store traits.

pub mod command;
pub mod device;
pub mod event;
pub mod geofence;
pub mod position;
pub mod unknown_device;

pub use command::CommandRepository;
pub use device::DeviceRepository;
pub use event::EventRepository;
pub use geofence::GeofenceRepository;
pub use position::PositionRepository;
pub use unknown_device::UnknownDeviceRepository;

use domain::services::StoreError;

/// Maps a database error into the narrow store error the core consumes.
pub(crate) fn map_err(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        other => StoreError::Backend(other.to_string()),
    }
}

//! Domain models for the TrackHub backend.

pub mod attributes;
pub mod command;
pub mod device;
pub mod event;
pub mod geofence;
pub mod position;

pub use attributes::{keys, AttributeBag, Value};
pub use command::{
    Command, CommandPriority, CommandStatus, CommandTemplate, CommandType, ScheduledCommand,
    SubmitCommandRequest,
};
pub use device::{Device, DeviceAccumulators, DeviceStatus, UnknownDevice};
pub use event::{Event, EventSeverity, EventType};
pub use geofence::{Geofence, GeofenceGeometry, GeometryError};
pub use position::{DecodedPosition, Position};

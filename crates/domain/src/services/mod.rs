//! Domain services and collaborator interfaces.

pub mod geofence_index;
pub mod sms;
pub mod stores;
pub mod user_access;

pub use geofence_index::{GeofenceCache, GeofenceIndex};
pub use sms::{MockSmsGateway, SmsError, SmsGateway};
pub use stores::{
    CommandStore, DeviceStore, EventQuery, EventStore, GeofenceStore, MemoryCommandStore,
    MemoryDeviceStore, MemoryEventStore, MemoryGeofenceStore, MemoryPositionStore,
    MemoryUnknownDeviceStore, PositionStore, StoreError, UnknownDeviceStore,
};
pub use user_access::{StaticUserAccess, UserAccess};

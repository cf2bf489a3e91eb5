//! Server-side service adapters.

pub mod geofence_sync;
pub mod sms_http;

pub use geofence_sync::GeofenceSync;
pub use sms_http::HttpSmsGateway;

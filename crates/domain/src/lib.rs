//! Domain layer for the TrackHub backend.
//!
//! This crate contains:
//! - Domain models (Position, Device, Event, Command, Geofence)
//! - Business logic services (geofence spatial index)
//! - Collaborator traits consumed by the core (stores, user access, SMS)

pub mod models;
pub mod services;

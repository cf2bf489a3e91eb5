//! Shared utilities and common types for the TrackHub backend.
//!
//! This crate provides common functionality used across all other crates:
//! - Geodesy math (great-circle distance, bounding boxes)
//! - Common validation logic

pub mod geodesy;
pub mod validation;

//! Geofence domain model and geometry parsing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::attributes::{keys, AttributeBag};

/// A geographic boundary with optional speed limit and alerting attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Geofence {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// GeoJSON geometry string as stored.
    pub geometry: String,
    pub disabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calendar_id: Option<i64>,
    #[serde(default, skip_serializing_if = "AttributeBag::is_empty")]
    pub attributes: AttributeBag,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Geofence {
    /// Speed limit attribute in km/h, when carried.
    pub fn speed_limit(&self) -> Option<f64> {
        self.attributes.double_opt(keys::SPEED_LIMIT)
    }

    /// Corridor half-width for LineString geometries, meters.
    pub fn buffer_distance(&self) -> Option<f64> {
        self.attributes.double_opt(keys::BUFFER_DISTANCE)
    }

    /// Parses the stored GeoJSON into a typed geometry.
    pub fn parse_geometry(&self) -> Result<GeofenceGeometry, GeometryError> {
        GeofenceGeometry::parse(&self.geometry, self.buffer_distance())
    }
}

/// Errors raised while parsing a geofence geometry.
#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    #[error("geometry is not valid JSON: {0}")]
    Json(String),
    #[error("unsupported geometry type: {0}")]
    UnsupportedType(String),
    #[error("malformed coordinates: {0}")]
    Coordinates(String),
    #[error("circle radius must be positive, got {0}")]
    NonPositiveRadius(f64),
    #[error("corridor requires a positive bufferDistance")]
    MissingBuffer,
}

/// Typed geometry of a geofence.
///
/// Circles arrive as GeoJSON `Circle` with coordinates `[lon, lat, radius_m]`;
/// LineStrings become corridors of half-width `buffer_m`.
#[derive(Debug, Clone, PartialEq)]
pub enum GeofenceGeometry {
    /// Outer ring as `(lat, lon)` vertices; the ring may be explicitly closed
    /// or left open.
    Polygon { ring: Vec<(f64, f64)> },
    Circle { lat: f64, lon: f64, radius_m: f64 },
    Corridor { path: Vec<(f64, f64)>, buffer_m: f64 },
}

#[derive(Debug, Deserialize)]
struct RawGeometry {
    #[serde(rename = "type")]
    kind: String,
    coordinates: serde_json::Value,
}

impl GeofenceGeometry {
    /// Parses a GeoJSON string. `buffer_m` supplies the corridor width for
    /// LineString geometries.
    pub fn parse(geojson: &str, buffer_m: Option<f64>) -> Result<Self, GeometryError> {
        let raw: RawGeometry =
            serde_json::from_str(geojson).map_err(|e| GeometryError::Json(e.to_string()))?;

        match raw.kind.as_str() {
            "Polygon" => {
                let rings: Vec<Vec<[f64; 2]>> = serde_json::from_value(raw.coordinates)
                    .map_err(|e| GeometryError::Coordinates(e.to_string()))?;
                let outer = rings
                    .into_iter()
                    .next()
                    .ok_or_else(|| GeometryError::Coordinates("empty polygon".to_string()))?;
                if outer.len() < 3 {
                    return Err(GeometryError::Coordinates(format!(
                        "polygon ring has {} vertices",
                        outer.len()
                    )));
                }
                let ring = outer.into_iter().map(|[lon, lat]| (lat, lon)).collect();
                Ok(GeofenceGeometry::Polygon { ring })
            }
            "Circle" => {
                let coords: [f64; 3] = serde_json::from_value(raw.coordinates)
                    .map_err(|e| GeometryError::Coordinates(e.to_string()))?;
                let [lon, lat, radius_m] = coords;
                if radius_m <= 0.0 {
                    return Err(GeometryError::NonPositiveRadius(radius_m));
                }
                Ok(GeofenceGeometry::Circle { lat, lon, radius_m })
            }
            "LineString" => {
                let buffer_m = match buffer_m {
                    Some(b) if b > 0.0 => b,
                    _ => return Err(GeometryError::MissingBuffer),
                };
                let coords: Vec<[f64; 2]> = serde_json::from_value(raw.coordinates)
                    .map_err(|e| GeometryError::Coordinates(e.to_string()))?;
                if coords.len() < 2 {
                    return Err(GeometryError::Coordinates(format!(
                        "linestring has {} vertices",
                        coords.len()
                    )));
                }
                let path = coords.into_iter().map(|[lon, lat]| (lat, lon)).collect();
                Ok(GeofenceGeometry::Corridor { path, buffer_m })
            }
            other => Err(GeometryError::UnsupportedType(other.to_string())),
        }
    }
}

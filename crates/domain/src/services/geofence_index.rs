//! In-memory geofence spatial index.
//!
//! Every position lookup runs against an immutable snapshot; reloads build a
//! fresh snapshot and swap it in atomically so in-flight readers always see
//! a complete index.

use geo::{Closest, ClosestPoint, Intersects, LineString, Point, Polygon};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::models::{Geofence, GeofenceGeometry};
use shared::geodesy::{haversine_distance, BoundingBox};

/// A geofence prepared for containment checks.
struct IndexedGeofence {
    id: i64,
    bbox: BoundingBox,
    shape: PreparedShape,
    speed_limit: Option<f64>,
}

enum PreparedShape {
    Polygon(Polygon<f64>),
    Circle { lat: f64, lon: f64, radius_m: f64 },
    Corridor { line: LineString<f64>, buffer_m: f64 },
}

/// Immutable snapshot of all active geofences.
///
/// Candidate filtering is a linear scan over precomputed bounding boxes;
/// exact predicates run only on candidates that pass the box test.
#[derive(Default)]
pub struct GeofenceIndex {
    entries: Vec<IndexedGeofence>,
}

impl GeofenceIndex {
    /// Builds the index from non-disabled geofences. Geometries that fail to
    /// parse are skipped with a warning rather than poisoning the snapshot.
    pub fn build(geofences: &[Geofence]) -> Self {
        let mut entries = Vec::with_capacity(geofences.len());
        for geofence in geofences.iter().filter(|g| !g.disabled) {
            let geometry = match geofence.parse_geometry() {
                Ok(g) => g,
                Err(e) => {
                    warn!(geofence_id = geofence.id, error = %e, "Skipping geofence with bad geometry");
                    continue;
                }
            };
            if let Some(entry) = Self::prepare(geofence, geometry) {
                entries.push(entry);
            }
        }
        debug!(count = entries.len(), "Geofence index built");
        GeofenceIndex { entries }
    }

    fn prepare(geofence: &Geofence, geometry: GeofenceGeometry) -> Option<IndexedGeofence> {
        let (bbox, shape) = match geometry {
            GeofenceGeometry::Polygon { ring } => {
                let bbox = BoundingBox::from_points(ring.iter().copied())?;
                let exterior: LineString<f64> =
                    ring.iter().map(|&(lat, lon)| (lon, lat)).collect();
                (bbox, PreparedShape::Polygon(Polygon::new(exterior, vec![])))
            }
            GeofenceGeometry::Circle { lat, lon, radius_m } => {
                let bbox = BoundingBox::from_points([(lat, lon)])?.expanded_by(radius_m);
                (bbox, PreparedShape::Circle { lat, lon, radius_m })
            }
            GeofenceGeometry::Corridor { path, buffer_m } => {
                let bbox = BoundingBox::from_points(path.iter().copied())?.expanded_by(buffer_m);
                let line: LineString<f64> = path.iter().map(|&(lat, lon)| (lon, lat)).collect();
                (bbox, PreparedShape::Corridor { line, buffer_m })
            }
        };
        Some(IndexedGeofence {
            id: geofence.id,
            bbox,
            shape,
            speed_limit: geofence.speed_limit(),
        })
    }

    /// All geofence ids whose containment predicate holds for the point.
    pub fn point_in(&self, lat: f64, lon: f64) -> HashSet<i64> {
        self.entries
            .iter()
            .filter(|entry| entry.bbox.contains(lat, lon))
            .filter(|entry| Self::contains(&entry.shape, lat, lon))
            .map(|entry| entry.id)
            .collect()
    }

    /// Speed limit of the first geofence containing the point that carries
    /// one, preferring the explicitly requested geofence when given.
    pub fn speed_limit_at(&self, lat: f64, lon: f64, preferred: Option<i64>) -> Option<f64> {
        if let Some(id) = preferred {
            if let Some(entry) = self.entries.iter().find(|e| e.id == id) {
                if entry.bbox.contains(lat, lon) && Self::contains(&entry.shape, lat, lon) {
                    if let Some(limit) = entry.speed_limit {
                        return Some(limit);
                    }
                }
            }
        }
        self.entries
            .iter()
            .filter(|e| e.speed_limit.is_some())
            .filter(|e| e.bbox.contains(lat, lon))
            .find(|e| Self::contains(&e.shape, lat, lon))
            .and_then(|e| e.speed_limit)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn contains(shape: &PreparedShape, lat: f64, lon: f64) -> bool {
        let point = Point::new(lon, lat);
        match shape {
            // Intersects reports boundary points as contained.
            PreparedShape::Polygon(polygon) => polygon.intersects(&point),
            PreparedShape::Circle {
                lat: clat,
                lon: clon,
                radius_m,
            } => haversine_distance(lat, lon, *clat, *clon) <= *radius_m,
            PreparedShape::Corridor { line, buffer_m } => {
                let nearest = match line.closest_point(&point) {
                    Closest::Intersection(_) => return true,
                    Closest::SinglePoint(p) => p,
                    Closest::Indeterminate => return false,
                };
                haversine_distance(lat, lon, nearest.y(), nearest.x()) <= *buffer_m
            }
        }
    }
}

/// Shared handle over the current snapshot.
///
/// `reload` swaps the snapshot pointer; `snapshot` hands out a cheap clone
/// of the current Arc for lock-free reads during a lookup burst.
#[derive(Clone, Default)]
pub struct GeofenceCache {
    current: Arc<RwLock<Arc<GeofenceIndex>>>,
}

impl GeofenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the snapshot with one built from `geofences`.
    pub fn reload(&self, geofences: &[Geofence]) {
        let index = Arc::new(GeofenceIndex::build(geofences));
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = index;
    }

    /// The current snapshot; holds no lock beyond the pointer clone.
    pub fn snapshot(&self) -> Arc<GeofenceIndex> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn point_in(&self, lat: f64, lon: f64) -> HashSet<i64> {
        self.snapshot().point_in(lat, lon)
    }
}

//! Geofence cache synchronization.
//!
//! Loads active geofences from the store and swaps a fresh snapshot into
//! the spatial cache. Runs at startup and whenever the CRUD layer signals a
//! change through the reload endpoint.

use std::sync::Arc;
use tracing::info;

use domain::models::keys;
use domain::services::{GeofenceCache, GeofenceStore, StoreError};

/// Rebuilds the spatial cache from the geofence store.
#[derive(Clone)]
pub struct GeofenceSync {
    store: Arc<dyn GeofenceStore>,
    cache: GeofenceCache,
    /// Corridor width injected into LineString geofences that carry none.
    default_buffer_m: f64,
}

impl GeofenceSync {
    pub fn new(store: Arc<dyn GeofenceStore>, cache: GeofenceCache, default_buffer_m: f64) -> Self {
        Self {
            store,
            cache,
            default_buffer_m,
        }
    }

    /// Loads active geofences and atomically swaps the cache snapshot.
    /// Returns how many geofences the new snapshot was built from.
    pub async fn reload(&self) -> Result<usize, StoreError> {
        let mut geofences = self.store.load_active().await?;
        for geofence in &mut geofences {
            let is_corridor = geofence.geometry.contains("LineString");
            if is_corridor && geofence.buffer_distance().is_none() {
                geofence
                    .attributes
                    .set(keys::BUFFER_DISTANCE, self.default_buffer_m);
            }
        }
        let count = geofences.len();
        self.cache.reload(&geofences);
        info!(count, "Geofence cache reloaded");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use domain::models::{AttributeBag, Geofence};
    use domain::services::MemoryGeofenceStore;

    fn corridor(id: i64) -> Geofence {
        Geofence {
            id,
            name: "route".to_string(),
            description: None,
            geometry: r#"{"type":"LineString","coordinates":[[0.0,0.0],[0.1,0.0]]}"#.to_string(),
            disabled: false,
            calendar_id: None,
            attributes: AttributeBag::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_reload_applies_default_buffer() {
        let store = Arc::new(MemoryGeofenceStore::with_geofences(vec![corridor(1)]));
        let cache = GeofenceCache::new();
        let sync = GeofenceSync::new(store, cache.clone(), 100.0);

        let count = sync.reload().await.unwrap();
        assert_eq!(count, 1);
        // Without the injected buffer the corridor would fail to build and
        // the point would match nothing.
        assert!(cache.point_in(0.0004, 0.05).contains(&1));
    }

    #[tokio::test]
    async fn test_reload_reflects_store_changes() {
        let store = Arc::new(MemoryGeofenceStore::new());
        let cache = GeofenceCache::new();
        let sync = GeofenceSync::new(store.clone(), cache.clone(), 100.0);

        assert_eq!(sync.reload().await.unwrap(), 0);
        store.replace(vec![corridor(2)]);
        assert_eq!(sync.reload().await.unwrap(), 1);
        assert!(cache.point_in(0.0, 0.05).contains(&2));
    }
}

//! Geofence repository for database operations.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::entities::GeofenceEntity;
use crate::metrics::QueryTimer;
use domain::models::Geofence;
use domain::services::{GeofenceStore, StoreError};

/// Repository backing the geofence spatial cache.
#[derive(Clone)]
pub struct GeofenceRepository {
    pool: PgPool,
}

impl GeofenceRepository {
    /// Creates a new GeofenceRepository with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GeofenceStore for GeofenceRepository {
    async fn load_active(&self) -> Result<Vec<Geofence>, StoreError> {
        let timer = QueryTimer::new("load_active_geofences");
        let entities = sqlx::query_as::<_, GeofenceEntity>(
            r#"
            SELECT id, name, description, geometry, disabled, calendar_id,
                   attributes, created_at, updated_at
            FROM geofences
            WHERE NOT disabled
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(super::map_err)?;
        timer.record();
        Ok(entities.into_iter().map(Into::into).collect())
    }
}

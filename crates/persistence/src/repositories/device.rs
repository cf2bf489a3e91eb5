//! Device repository for database operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::entities::DeviceEntity;
use crate::metrics::QueryTimer;
use domain::models::{Device, DeviceAccumulators, DeviceStatus};
use domain::services::{DeviceStore, StoreError};

const DEVICE_COLUMNS: &str = r#"id, unique_id, name, status, last_update, group_id, phone,
    calendar_id, expiration_time, disabled, total_distance, hours, motion_state,
    motion_streak, motion_position_id, motion_time, motion_distance,
    overspeed_state, overspeed_time, overspeed_geofence_id, attributes"#;

/// Repository for device-related database operations.
#[derive(Clone)]
pub struct DeviceRepository {
    pool: PgPool,
}

impl DeviceRepository {
    /// Creates a new DeviceRepository with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceStore for DeviceRepository {
    async fn find_by_unique_id(&self, unique_id: &str) -> Result<Option<Device>, StoreError> {
        let timer = QueryTimer::new("find_device_by_unique_id");
        let entity = sqlx::query_as::<_, DeviceEntity>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE unique_id = $1"
        ))
        .bind(unique_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(super::map_err)?;
        timer.record();
        Ok(entity.map(Into::into))
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Device>, StoreError> {
        let entity = sqlx::query_as::<_, DeviceEntity>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(super::map_err)?;
        Ok(entity.map(Into::into))
    }

    async fn list(&self) -> Result<Vec<Device>, StoreError> {
        let entities = sqlx::query_as::<_, DeviceEntity>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(super::map_err)?;
        Ok(entities.into_iter().map(Into::into).collect())
    }

    async fn update_accumulators(
        &self,
        device_id: i64,
        acc: DeviceAccumulators,
    ) -> Result<(), StoreError> {
        let timer = QueryTimer::new("update_device_accumulators");
        let result = sqlx::query(
            r#"
            UPDATE devices SET
                total_distance = $2,
                hours = $3,
                motion_state = $4,
                motion_streak = $5,
                motion_position_id = $6,
                motion_time = $7,
                motion_distance = $8,
                overspeed_state = $9,
                overspeed_time = $10,
                overspeed_geofence_id = $11
            WHERE id = $1
            "#,
        )
        .bind(device_id)
        .bind(acc.total_distance)
        .bind(acc.hours)
        .bind(acc.motion_state)
        .bind(acc.motion_streak)
        .bind(acc.motion_position_id)
        .bind(acc.motion_time)
        .bind(acc.motion_distance)
        .bind(acc.overspeed_state)
        .bind(acc.overspeed_time)
        .bind(acc.overspeed_geofence_id)
        .execute(&self.pool)
        .await
        .map_err(super::map_err)?;
        timer.record();
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn update_status(
        &self,
        device_id: i64,
        status: DeviceStatus,
        last_update: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE devices SET status = $2, last_update = $3 WHERE id = $1")
            .bind(device_id)
            .bind(status.as_str())
            .bind(last_update)
            .execute(&self.pool)
            .await
            .map_err(super::map_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn set_disabled(&self, device_id: i64, disabled: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE devices SET disabled = $2 WHERE id = $1")
            .bind(device_id)
            .bind(disabled)
            .execute(&self.pool)
            .await
            .map_err(super::map_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

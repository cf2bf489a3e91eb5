//! Position repository for database operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::entities::{attributes_to_json, PositionEntity};
use crate::metrics::QueryTimer;
use domain::models::Position;
use domain::services::{PositionStore, StoreError};

/// Repository for position-related database operations.
///
/// Inserts are append-only; per-device ordering is preserved by the
/// monotonically assigned primary key.
#[derive(Clone)]
pub struct PositionRepository {
    pool: PgPool,
}

impl PositionRepository {
    /// Creates a new PositionRepository with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_position(&self, position: &Position) -> Result<PositionEntity, sqlx::Error> {
        let timer = QueryTimer::new("insert_position");
        let result = sqlx::query_as::<_, PositionEntity>(
            r#"
            INSERT INTO positions (
                device_id, unknown_device_id, protocol, server_time, device_time,
                fix_time, valid, latitude, longitude, altitude, speed, course,
                accuracy, address, attributes
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING id, device_id, unknown_device_id, protocol, server_time, device_time,
                      fix_time, valid, latitude, longitude, altitude, speed, course,
                      accuracy, address, attributes
            "#,
        )
        .bind(position.device_id)
        .bind(position.unknown_device_id)
        .bind(&position.protocol)
        .bind(position.server_time)
        .bind(position.device_time)
        .bind(position.fix_time)
        .bind(position.valid)
        .bind(position.latitude)
        .bind(position.longitude)
        .bind(position.altitude)
        .bind(position.speed)
        .bind(position.course)
        .bind(position.accuracy)
        .bind(&position.address)
        .bind(attributes_to_json(&position.attributes))
        .fetch_one(&self.pool)
        .await;
        timer.record();
        result
    }
}

#[async_trait]
impl PositionStore for PositionRepository {
    async fn insert(&self, position: Position) -> Result<Position, StoreError> {
        let entity = self
            .insert_position(&position)
            .await
            .map_err(super::map_err)?;
        Ok(entity.into())
    }

    async fn latest_per_device(&self) -> Result<Vec<Position>, StoreError> {
        let timer = QueryTimer::new("latest_positions_per_device");
        let entities = sqlx::query_as::<_, PositionEntity>(
            r#"
            SELECT DISTINCT ON (device_id)
                   id, device_id, unknown_device_id, protocol, server_time, device_time,
                   fix_time, valid, latitude, longitude, altitude, speed, course,
                   accuracy, address, attributes
            FROM positions
            WHERE device_id IS NOT NULL
            ORDER BY device_id, server_time DESC, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(super::map_err)?;
        timer.record();
        Ok(entities.into_iter().map(Into::into).collect())
    }

    async fn history(
        &self,
        device_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Position>, StoreError> {
        let timer = QueryTimer::new("position_history");
        let entities = sqlx::query_as::<_, PositionEntity>(
            r#"
            SELECT id, device_id, unknown_device_id, protocol, server_time, device_time,
                   fix_time, valid, latitude, longitude, altitude, speed, course,
                   accuracy, address, attributes
            FROM positions
            WHERE device_id = $1
              AND server_time >= $2
              AND server_time <= $3
            ORDER BY server_time ASC, id ASC
            "#,
        )
        .bind(device_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(super::map_err)?;
        timer.record();
        Ok(entities.into_iter().map(Into::into).collect())
    }
}

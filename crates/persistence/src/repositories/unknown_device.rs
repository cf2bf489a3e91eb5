//! Unknown device repository for database operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::entities::UnknownDeviceEntity;
use crate::metrics::QueryTimer;
use domain::models::UnknownDevice;
use domain::services::{StoreError, UnknownDeviceStore};

/// Repository for identifiers seen on the wire without a registered device.
#[derive(Clone)]
pub struct UnknownDeviceRepository {
    pool: PgPool,
}

impl UnknownDeviceRepository {
    /// Creates a new UnknownDeviceRepository with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UnknownDeviceStore for UnknownDeviceRepository {
    async fn upsert_sighting(
        &self,
        unique_id: &str,
        protocol: &str,
        port: u16,
        transport: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<UnknownDevice, StoreError> {
        let timer = QueryTimer::new("upsert_unknown_device");
        let entity = sqlx::query_as::<_, UnknownDeviceEntity>(
            r#"
            INSERT INTO unknown_devices (
                unique_id, protocol, port, transport, first_seen, last_seen,
                connection_count, is_registered
            )
            VALUES ($1, $2, $3, $4, $5, $5, 1, FALSE)
            ON CONFLICT (unique_id) DO UPDATE SET
                last_seen = EXCLUDED.last_seen,
                connection_count = unknown_devices.connection_count + 1
            RETURNING id, unique_id, protocol, port, transport, first_seen,
                      last_seen, connection_count, is_registered, registered_device_id
            "#,
        )
        .bind(unique_id)
        .bind(protocol)
        .bind(port as i32)
        .bind(transport)
        .bind(seen_at)
        .fetch_one(&self.pool)
        .await
        .map_err(super::map_err)?;
        timer.record();
        Ok(entity.into())
    }
}

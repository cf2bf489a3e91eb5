//! Connection pool gauges.

use sqlx::PgPool;
use std::time::Duration;

use crate::jobs::maintenance::MaintenanceTask;

/// Periodically records connection pool gauges.
pub struct PoolGauges {
    pool: PgPool,
}

impl PoolGauges {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl MaintenanceTask for PoolGauges {
    fn name(&self) -> &'static str {
        "pool_gauges"
    }

    fn cadence(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn run(&self) -> Result<(), String> {
        persistence::metrics::record_pool_metrics(&self.pool);
        Ok(())
    }
}

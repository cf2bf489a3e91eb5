//! Event repository for database operations.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::entities::{attributes_to_json, EventEntity};
use crate::metrics::QueryTimer;
use domain::models::Event;
use domain::services::{EventQuery, EventStore, StoreError};

/// Repository for event-related database operations. Events are append-only.
#[derive(Clone)]
pub struct EventRepository {
    pool: PgPool,
}

impl EventRepository {
    /// Creates a new EventRepository with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for EventRepository {
    async fn insert(&self, event: Event) -> Result<Event, StoreError> {
        let timer = QueryTimer::new("insert_event");
        let entity = sqlx::query_as::<_, EventEntity>(
            r#"
            INSERT INTO events (
                event_type, device_id, position_id, event_time, geofence_id,
                maintenance_id, attributes
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, event_type, device_id, position_id, event_time,
                      geofence_id, maintenance_id, attributes
            "#,
        )
        .bind(event.event_type.as_str())
        .bind(event.device_id)
        .bind(event.position_id)
        .bind(event.event_time)
        .bind(event.geofence_id)
        .bind(event.maintenance_id)
        .bind(attributes_to_json(&event.attributes))
        .fetch_one(&self.pool)
        .await
        .map_err(super::map_err)?;
        timer.record();
        entity
            .into_domain()
            .ok_or_else(|| StoreError::Backend("event row round-trip failed".to_string()))
    }

    async fn query(&self, query: EventQuery) -> Result<Vec<Event>, StoreError> {
        let timer = QueryTimer::new("query_events");
        let types: Option<Vec<String>> = query
            .types
            .map(|ts| ts.iter().map(|t| t.as_str().to_string()).collect());
        let limit = query.limit.map(|l| l as i64).unwrap_or(1000);

        let entities = sqlx::query_as::<_, EventEntity>(
            r#"
            SELECT id, event_type, device_id, position_id, event_time,
                   geofence_id, maintenance_id, attributes
            FROM events
            WHERE ($1::bigint IS NULL OR device_id = $1)
              AND ($2::text[] IS NULL OR event_type = ANY($2))
              AND ($3::timestamptz IS NULL OR event_time >= $3)
              AND ($4::timestamptz IS NULL OR event_time <= $4)
            ORDER BY event_time DESC, id DESC
            LIMIT $5
            "#,
        )
        .bind(query.device_id)
        .bind(types)
        .bind(query.from)
        .bind(query.to)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(super::map_err)?;
        timer.record();
        Ok(entities
            .into_iter()
            .filter_map(EventEntity::into_domain)
            .collect())
    }
}

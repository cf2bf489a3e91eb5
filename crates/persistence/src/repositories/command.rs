//! Command repository for database operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::entities::{attributes_to_json, CommandEntity, ScheduledCommandEntity};
use crate::metrics::QueryTimer;
use domain::models::{Command, ScheduledCommand};
use domain::services::{CommandStore, StoreError};

const COMMAND_COLUMNS: &str = r#"id, device_id, user_id, command_type, priority, status,
    parameters, raw_command, text_channel, queued_at, sent_at, delivered_at,
    executed_at, failed_at, retry_count, max_retries, expires_at, response,
    error_message, created_at, updated_at"#;

/// Repository for command-related database operations.
#[derive(Clone)]
pub struct CommandRepository {
    pool: PgPool,
}

impl CommandRepository {
    /// Creates a new CommandRepository with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CommandStore for CommandRepository {
    async fn insert(&self, command: Command) -> Result<Command, StoreError> {
        let timer = QueryTimer::new("insert_command");
        let entity = sqlx::query_as::<_, CommandEntity>(&format!(
            r#"
            INSERT INTO commands (
                device_id, user_id, command_type, priority, status, parameters,
                raw_command, text_channel, queued_at, sent_at, delivered_at,
                executed_at, failed_at, retry_count, max_retries, expires_at,
                response, error_message, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19, $20)
            RETURNING {COMMAND_COLUMNS}
            "#
        ))
        .bind(command.device_id)
        .bind(command.user_id)
        .bind(command.command_type.as_str())
        .bind(command.priority.as_str())
        .bind(command.status.as_str())
        .bind(attributes_to_json(&command.parameters))
        .bind(&command.raw_command)
        .bind(command.text_channel)
        .bind(command.queued_at)
        .bind(command.sent_at)
        .bind(command.delivered_at)
        .bind(command.executed_at)
        .bind(command.failed_at)
        .bind(command.retry_count)
        .bind(command.max_retries)
        .bind(command.expires_at)
        .bind(&command.response)
        .bind(&command.error_message)
        .bind(command.created_at)
        .bind(command.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(super::map_err)?;
        timer.record();
        entity
            .into_domain()
            .ok_or_else(|| StoreError::Backend("command row round-trip failed".to_string()))
    }

    async fn update(&self, command: &Command) -> Result<(), StoreError> {
        let timer = QueryTimer::new("update_command");
        let result = sqlx::query(
            r#"
            UPDATE commands SET
                status = $2, parameters = $3, raw_command = $4, queued_at = $5,
                sent_at = $6, delivered_at = $7, executed_at = $8, failed_at = $9,
                retry_count = $10, expires_at = $11, response = $12,
                error_message = $13, updated_at = $14
            WHERE id = $1
            "#,
        )
        .bind(command.id)
        .bind(command.status.as_str())
        .bind(attributes_to_json(&command.parameters))
        .bind(&command.raw_command)
        .bind(command.queued_at)
        .bind(command.sent_at)
        .bind(command.delivered_at)
        .bind(command.executed_at)
        .bind(command.failed_at)
        .bind(command.retry_count)
        .bind(command.expires_at)
        .bind(&command.response)
        .bind(&command.error_message)
        .bind(command.updated_at)
        .execute(&self.pool)
        .await
        .map_err(super::map_err)?;
        timer.record();
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Command>, StoreError> {
        let entity = sqlx::query_as::<_, CommandEntity>(&format!(
            "SELECT {COMMAND_COLUMNS} FROM commands WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(super::map_err)?;
        Ok(entity.and_then(CommandEntity::into_domain))
    }

    async fn list(&self, device_id: Option<i64>) -> Result<Vec<Command>, StoreError> {
        let entities = sqlx::query_as::<_, CommandEntity>(&format!(
            r#"
            SELECT {COMMAND_COLUMNS} FROM commands
            WHERE ($1::bigint IS NULL OR device_id = $1)
            ORDER BY created_at DESC, id DESC
            "#
        ))
        .bind(device_id)
        .fetch_all(&self.pool)
        .await
        .map_err(super::map_err)?;
        Ok(entities
            .into_iter()
            .filter_map(CommandEntity::into_domain)
            .collect())
    }

    async fn list_queued(&self) -> Result<Vec<Command>, StoreError> {
        let timer = QueryTimer::new("list_queued_commands");
        // Priority labels sort by explicit rank, then FIFO by queue instant.
        let entities = sqlx::query_as::<_, CommandEntity>(&format!(
            r#"
            SELECT {COMMAND_COLUMNS} FROM commands
            WHERE status = 'QUEUED'
            ORDER BY CASE priority
                         WHEN 'CRITICAL' THEN 0
                         WHEN 'HIGH' THEN 1
                         WHEN 'NORMAL' THEN 2
                         ELSE 3
                     END,
                     queued_at ASC NULLS LAST,
                     id ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(super::map_err)?;
        timer.record();
        Ok(entities
            .into_iter()
            .filter_map(CommandEntity::into_domain)
            .collect())
    }

    async fn list_due_scheduled(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledCommand>, StoreError> {
        let entities = sqlx::query_as::<_, ScheduledCommandEntity>(
            r#"
            SELECT id, command_id, scheduled_at, repeat_interval_secs, max_repeats,
                   repeat_count, is_active
            FROM command_queue
            WHERE is_active AND scheduled_at <= $1
            ORDER BY scheduled_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(super::map_err)?;
        Ok(entities.into_iter().map(Into::into).collect())
    }

    async fn update_scheduled(&self, scheduled: &ScheduledCommand) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE command_queue SET
                scheduled_at = $2, repeat_count = $3, is_active = $4
            WHERE id = $1
            "#,
        )
        .bind(scheduled.id)
        .bind(scheduled.scheduled_at)
        .bind(scheduled.repeat_count)
        .bind(scheduled.is_active)
        .execute(&self.pool)
        .await
        .map_err(super::map_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

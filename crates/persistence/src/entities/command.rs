//! Command entities (database row mappings).

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use domain::models::{Command, CommandPriority, CommandStatus, CommandType, ScheduledCommand};

/// Database row mapping for the commands table.
#[derive(Debug, Clone, FromRow)]
pub struct CommandEntity {
    pub id: i64,
    pub device_id: i64,
    pub user_id: i64,
    pub command_type: String,
    pub priority: String,
    pub status: String,
    pub parameters: Option<serde_json::Value>,
    pub raw_command: Option<String>,
    pub text_channel: bool,
    pub queued_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub response: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CommandEntity {
    /// Converts to the domain command; rows with a type or status this build
    /// does not know are dropped by the caller.
    pub fn into_domain(self) -> Option<Command> {
        Some(Command {
            id: self.id,
            device_id: self.device_id,
            user_id: self.user_id,
            command_type: CommandType::parse(&self.command_type)?,
            priority: CommandPriority::parse(&self.priority)?,
            status: CommandStatus::parse(&self.status)?,
            parameters: super::attributes_from_json(self.parameters),
            raw_command: self.raw_command,
            text_channel: self.text_channel,
            queued_at: self.queued_at,
            sent_at: self.sent_at,
            delivered_at: self.delivered_at,
            executed_at: self.executed_at,
            failed_at: self.failed_at,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            expires_at: self.expires_at,
            response: self.response,
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Database row mapping for the command_queue table.
#[derive(Debug, Clone, FromRow)]
pub struct ScheduledCommandEntity {
    pub id: i64,
    pub command_id: i64,
    pub scheduled_at: DateTime<Utc>,
    pub repeat_interval_secs: Option<i64>,
    pub max_repeats: Option<i32>,
    pub repeat_count: i32,
    pub is_active: bool,
}

impl From<ScheduledCommandEntity> for ScheduledCommand {
    fn from(entity: ScheduledCommandEntity) -> Self {
        Self {
            id: entity.id,
            command_id: entity.command_id,
            scheduled_at: entity.scheduled_at,
            repeat_interval_secs: entity.repeat_interval_secs,
            max_repeats: entity.max_repeats,
            repeat_count: entity.repeat_count,
            is_active: entity.is_active,
        }
    }
}

//! Command domain model and its delivery state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use validator::Validate;

use crate::models::attributes::AttributeBag;

/// Supported outbound command types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    Reboot,
    Setinterval,
    Setoverspeed,
    Setgeofence,
    Setoutput,
    EngineStart,
    EngineStop,
    PositionSingle,
    FactoryReset,
    Custom,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Reboot => "REBOOT",
            CommandType::Setinterval => "SETINTERVAL",
            CommandType::Setoverspeed => "SETOVERSPEED",
            CommandType::Setgeofence => "SETGEOFENCE",
            CommandType::Setoutput => "SETOUTPUT",
            CommandType::EngineStart => "ENGINE_START",
            CommandType::EngineStop => "ENGINE_STOP",
            CommandType::PositionSingle => "POSITION_SINGLE",
            CommandType::FactoryReset => "FACTORY_RESET",
            CommandType::Custom => "CUSTOM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REBOOT" => Some(CommandType::Reboot),
            "SETINTERVAL" => Some(CommandType::Setinterval),
            "SETOVERSPEED" => Some(CommandType::Setoverspeed),
            "SETGEOFENCE" => Some(CommandType::Setgeofence),
            "SETOUTPUT" => Some(CommandType::Setoutput),
            "ENGINE_START" => Some(CommandType::EngineStart),
            "ENGINE_STOP" => Some(CommandType::EngineStop),
            "POSITION_SINGLE" => Some(CommandType::PositionSingle),
            "FACTORY_RESET" => Some(CommandType::FactoryReset),
            "CUSTOM" => Some(CommandType::Custom),
            _ => None,
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Scheduling priority; higher pops first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl CommandPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandPriority::Low => "LOW",
            CommandPriority::Normal => "NORMAL",
            CommandPriority::High => "HIGH",
            CommandPriority::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOW" => Some(CommandPriority::Low),
            "NORMAL" => Some(CommandPriority::Normal),
            "HIGH" => Some(CommandPriority::High),
            "CRITICAL" => Some(CommandPriority::Critical),
            _ => None,
        }
    }
}

/// Delivery lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    Queued,
    Sent,
    Delivered,
    Executed,
    Failed,
    Cancelled,
    Expired,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "PENDING",
            CommandStatus::Queued => "QUEUED",
            CommandStatus::Sent => "SENT",
            CommandStatus::Delivered => "DELIVERED",
            CommandStatus::Executed => "EXECUTED",
            CommandStatus::Failed => "FAILED",
            CommandStatus::Cancelled => "CANCELLED",
            CommandStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(CommandStatus::Pending),
            "QUEUED" => Some(CommandStatus::Queued),
            "SENT" => Some(CommandStatus::Sent),
            "DELIVERED" => Some(CommandStatus::Delivered),
            "EXECUTED" => Some(CommandStatus::Executed),
            "FAILED" => Some(CommandStatus::Failed),
            "CANCELLED" => Some(CommandStatus::Cancelled),
            "EXPIRED" => Some(CommandStatus::Expired),
            _ => None,
        }
    }

    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Executed | CommandStatus::Cancelled | CommandStatus::Expired
        )
    }

    /// Legal transitions of the delivery state machine. FAILED may re-queue
    /// while retries remain; everything after a terminal status is rejected.
    pub fn can_transition_to(&self, next: CommandStatus) -> bool {
        use CommandStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Pending, Queued) => true,
            (Pending, Cancelled) | (Pending, Expired) => true,
            (Queued, Sent) | (Queued, Cancelled) | (Queued, Expired) | (Queued, Failed) => true,
            (Sent, Delivered) | (Sent, Failed) | (Sent, Cancelled) | (Sent, Expired) => true,
            (Delivered, Executed) | (Delivered, Failed) | (Delivered, Cancelled) => true,
            (Failed, Queued) | (Failed, Cancelled) | (Failed, Expired) => true,
            _ => false,
        }
    }
}

/// An operator-submitted command to a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: i64,
    pub device_id: i64,
    pub user_id: i64,
    pub command_type: CommandType,
    pub priority: CommandPriority,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "AttributeBag::is_empty")]
    pub parameters: AttributeBag,
    /// Protocol rendering of the command, set at send time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_command: Option<String>,
    /// Deliver over SMS instead of a live session.
    pub text_channel: bool,
    pub queued_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Command {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries && !self.status.is_terminal()
    }

    /// Applies a transition, recording its timestamp. Returns false and
    /// leaves the command untouched when the transition is illegal.
    pub fn transition(&mut self, next: CommandStatus, now: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = now;
        match next {
            CommandStatus::Queued => self.queued_at = Some(now),
            CommandStatus::Sent => self.sent_at = Some(now),
            CommandStatus::Delivered => self.delivered_at = Some(now),
            CommandStatus::Executed => self.executed_at = Some(now),
            CommandStatus::Failed => self.failed_at = Some(now),
            _ => {}
        }
        true
    }
}

/// Request payload for submitting a command.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SubmitCommandRequest {
    pub device_id: i64,
    pub command_type: CommandType,
    #[serde(default = "default_priority")]
    pub priority: CommandPriority,
    #[serde(default)]
    pub parameters: AttributeBag,
    #[serde(default)]
    pub text_channel: bool,
    pub expires_at: Option<DateTime<Utc>>,
    #[validate(range(min = 0, max = 10, message = "Max retries must be 0-10"))]
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
}

fn default_priority() -> CommandPriority {
    CommandPriority::Normal
}

fn default_max_retries() -> i32 {
    3
}

/// A command armed for future (and optionally repeated) execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledCommand {
    pub id: i64,
    pub command_id: i64,
    pub scheduled_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_interval_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_repeats: Option<i32>,
    pub repeat_count: i32,
    pub is_active: bool,
}

impl ScheduledCommand {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.scheduled_at <= now
    }

    /// Re-arms for the next repetition, or deactivates when repeats are
    /// exhausted or no interval is configured.
    pub fn advance(&mut self, now: DateTime<Utc>) {
        self.repeat_count += 1;
        match (self.repeat_interval_secs, self.max_repeats) {
            (Some(interval), max) if max.map(|m| self.repeat_count < m).unwrap_or(true) => {
                self.scheduled_at = now + chrono::Duration::seconds(interval);
            }
            _ => self.is_active = false,
        }
    }
}

/// A reusable parameter blueprint for frequently issued commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandTemplate {
    pub id: i64,
    pub name: String,
    pub command_type: CommandType,
    pub priority: CommandPriority,
    #[serde(default, skip_serializing_if = "AttributeBag::is_empty")]
    pub parameters: AttributeBag,
    pub text_channel: bool,
    pub usage_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl CommandTemplate {
    /// Produces a fresh command from the blueprint and bumps usage counters.
    pub fn instantiate(&mut self, device_id: i64, user_id: i64, now: DateTime<Utc>) -> Command {
        self.usage_count += 1;
        self.last_used_at = Some(now);
        Command {
            id: 0,
            device_id,
            user_id,
            command_type: self.command_type,
            priority: self.priority,
            status: CommandStatus::Pending,
            parameters: self.parameters.clone(),
            raw_command: None,
            text_channel: self.text_channel,
            queued_at: None,
            sent_at: None,
            delivered_at: None,
            executed_at: None,
            failed_at: None,
            retry_count: 0,
            max_retries: default_max_retries(),
            expires_at: None,
            response: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

//! Scheduled command execution.
//!
//! Fires commands whose schedule has come due, then re-arms repeating
//! schedules until their configured repeats are exhausted.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use domain::services::CommandStore;

use crate::commands::CommandEngine;
use crate::jobs::maintenance::MaintenanceTask;

/// Executes due scheduled commands.
pub struct ScheduledCommandRunner {
    store: Arc<dyn CommandStore>,
    engine: CommandEngine,
}

impl ScheduledCommandRunner {
    pub fn new(store: Arc<dyn CommandStore>, engine: CommandEngine) -> Self {
        Self { store, engine }
    }
}

#[async_trait::async_trait]
impl MaintenanceTask for ScheduledCommandRunner {
    fn name(&self) -> &'static str {
        "scheduled_commands"
    }

    fn cadence(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn run(&self) -> Result<(), String> {
        let now = Utc::now();
        let due = self
            .store
            .list_due_scheduled(now)
            .await
            .map_err(|e| e.to_string())?;

        for mut scheduled in due {
            match self.engine.resubmit(scheduled.command_id).await {
                Ok(command) => {
                    info!(
                        scheduled_id = scheduled.id,
                        command_id = command.id,
                        "Scheduled command queued"
                    );
                }
                Err(e) => {
                    warn!(
                        scheduled_id = scheduled.id,
                        error = %e,
                        "Scheduled command could not be queued"
                    );
                }
            }
            scheduled.advance(now);
            self.store
                .update_scheduled(&scheduled)
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use domain::models::{
        AttributeBag, Command, CommandPriority, CommandStatus, CommandType, Device, DeviceStatus,
        ScheduledCommand,
    };
    use domain::services::{
        CommandStore as _, MemoryCommandStore, MemoryDeviceStore, MemoryEventStore, MockSmsGateway,
        StaticUserAccess,
    };

    async fn fixture() -> (ScheduledCommandRunner, Arc<MemoryCommandStore>) {
        let store = Arc::new(MemoryCommandStore::new());
        let devices = Arc::new(MemoryDeviceStore::new());
        devices.insert(Device {
            id: 7,
            unique_id: "907126119".to_string(),
            name: "t".to_string(),
            status: DeviceStatus::Online,
            last_update: None,
            group_id: None,
            phone: None,
            calendar_id: None,
            expiration_time: None,
            disabled: false,
            accumulators: Default::default(),
            attributes: AttributeBag::new(),
        });
        let hub = crate::hub::LiveHub::new(Default::default());
        let dispatcher = Arc::new(crate::events::EventDispatcher::new(
            Arc::new(MemoryEventStore::new()),
            Arc::new(StaticUserAccess::new()),
            hub,
        ));
        let engine = CommandEngine::new(
            store.clone(),
            devices,
            Arc::new(crate::session::SessionRegistry::new()),
            crate::protocol::ProtocolRegistry::with_defaults(),
            Arc::new(MockSmsGateway::new()),
            dispatcher,
            Default::default(),
        );

        let now = Utc::now();
        let command = store
            .insert(Command {
                id: 0,
                device_id: 7,
                user_id: 1,
                command_type: CommandType::Reboot,
                priority: CommandPriority::Normal,
                status: CommandStatus::Executed,
                parameters: AttributeBag::new(),
                raw_command: None,
                text_channel: false,
                queued_at: None,
                sent_at: None,
                delivered_at: None,
                executed_at: Some(now),
                failed_at: None,
                retry_count: 0,
                max_retries: 3,
                expires_at: None,
                response: None,
                error_message: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        store.add_scheduled(ScheduledCommand {
            id: 1,
            command_id: command.id,
            scheduled_at: now - ChronoDuration::seconds(5),
            repeat_interval_secs: None,
            max_repeats: None,
            repeat_count: 0,
            is_active: true,
        });

        (ScheduledCommandRunner::new(store.clone(), engine), store)
    }

    #[tokio::test]
    async fn test_due_schedule_queues_fresh_command() {
        let (runner, store) = fixture().await;
        runner.run().await.unwrap();

        // A fresh QUEUED copy exists next to the original EXECUTED row.
        let all = store.list(Some(7)).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|c| c.status == CommandStatus::Queued));
        assert!(all.iter().any(|c| c.status == CommandStatus::Executed));

        // One-shot schedules deactivate after firing.
        let due = store.list_due_scheduled(Utc::now()).await.unwrap();
        assert!(due.is_empty());
    }
}

//! Command delivery engine.
//!
//! Operator-submitted commands sit in a priority queue (CRITICAL first,
//! FIFO within a priority) and are delivered by a small worker pool, at
//! most one in-flight send per device. Delivery waits for a live session,
//! falls back to SMS when the device has a phone number, and retries with
//! exponential backoff on send failure or acknowledgment timeout.

use chrono::Utc;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use domain::models::{
    Command, CommandPriority, CommandStatus, Event, EventType, SubmitCommandRequest,
};
use domain::services::{CommandStore, DeviceStore, SmsGateway, StoreError};

use crate::events::EventDispatcher;
use crate::protocol::ProtocolRegistry;
use crate::session::SessionRegistry;

/// Command engine tuning.
#[derive(Debug, Clone)]
pub struct CommandSettings {
    /// How long a SENT command may wait for a device reply.
    pub ack_timeout: Duration,
    /// Re-check interval while a device has no live session.
    pub session_retry_backoff: Duration,
    /// First retry backoff; doubles per retry up to the cap.
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub worker_count: usize,
    /// Worker poll tick; bounds how late a deferred entry can fire.
    pub tick: Duration,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(60),
            session_retry_backoff: Duration::from_secs(15),
            retry_base: Duration::from_secs(30),
            retry_cap: Duration::from_secs(600),
            worker_count: 2,
            tick: Duration::from_millis(250),
        }
    }
}

/// Errors surfaced to the REST layer.
#[derive(Debug, thiserror::Error)]
pub enum CommandEngineError {
    #[error("command not found")]
    NotFound,
    #[error("command is in status {0:?} and cannot transition")]
    IllegalTransition(CommandStatus),
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct QueueEntry {
    priority: CommandPriority,
    queued_at: chrono::DateTime<Utc>,
    seq: u64,
    command_id: i64,
    not_before: Instant,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then earlier queue instant, then
        // submission order.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.queued_at.cmp(&self.queued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct EngineInner {
    store: Arc<dyn CommandStore>,
    devices: Arc<dyn DeviceStore>,
    sessions: Arc<SessionRegistry>,
    protocols: ProtocolRegistry,
    sms: Arc<dyn SmsGateway>,
    dispatcher: Arc<EventDispatcher>,
    settings: CommandSettings,
    queue: Mutex<BinaryHeap<QueueEntry>>,
    /// device id -> command id awaiting a reply.
    pending_ack: Mutex<HashMap<i64, i64>>,
    seq: AtomicU64,
    notify: Notify,
}

/// Shared engine handle.
#[derive(Clone)]
pub struct CommandEngine {
    inner: Arc<EngineInner>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl CommandEngine {
    pub fn new(
        store: Arc<dyn CommandStore>,
        devices: Arc<dyn DeviceStore>,
        sessions: Arc<SessionRegistry>,
        protocols: ProtocolRegistry,
        sms: Arc<dyn SmsGateway>,
        dispatcher: Arc<EventDispatcher>,
        settings: CommandSettings,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(EngineInner {
                store,
                devices,
                sessions,
                protocols,
                sms,
                dispatcher,
                settings,
                queue: Mutex::new(BinaryHeap::new()),
                pending_ack: Mutex::new(HashMap::new()),
                seq: AtomicU64::new(0),
                notify: Notify::new(),
            }),
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Spawns the delivery workers.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let worker_count = self.inner.settings.worker_count.max(1);
        let mut handles = Vec::with_capacity(worker_count);
        for worker in 0..worker_count {
            let engine = self.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(engine.inner.settings.tick);
                loop {
                    tokio::select! {
                        _ = engine.inner.notify.notified() => {}
                        _ = tick.tick() => {}
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                debug!(worker, "Command worker shutting down");
                                break;
                            }
                        }
                    }
                    while let Some(entry) = engine.pop_ready() {
                        engine.deliver(entry).await;
                    }
                }
            }));
        }
        info!(workers = worker_count, "Command engine started");
        handles
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Re-queues commands left QUEUED by a previous run.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let queued = self.inner.store.list_queued().await?;
        let count = queued.len();
        for command in queued {
            self.push_entry(&command, Instant::now());
        }
        if count > 0 {
            info!(count, "Recovered queued commands");
            self.inner.notify.notify_waiters();
        }
        Ok(count)
    }

    /// Accepts an operator submission: persists the command and queues it.
    pub async fn submit(
        &self,
        request: SubmitCommandRequest,
        user_id: i64,
    ) -> Result<Command, CommandEngineError> {
        let now = Utc::now();
        let command = Command {
            id: 0,
            device_id: request.device_id,
            user_id,
            command_type: request.command_type,
            priority: request.priority,
            status: CommandStatus::Pending,
            parameters: request.parameters,
            raw_command: None,
            text_channel: request.text_channel,
            queued_at: None,
            sent_at: None,
            delivered_at: None,
            executed_at: None,
            failed_at: None,
            retry_count: 0,
            max_retries: request.max_retries,
            expires_at: request.expires_at,
            response: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        let mut command = self.inner.store.insert(command).await?;
        command.transition(CommandStatus::Queued, now);
        self.inner.store.update(&command).await?;
        metrics::counter!("commands_submitted_total").increment(1);

        self.push_entry(&command, Instant::now());
        self.inner.notify.notify_waiters();
        Ok(command)
    }

    /// Queues a fresh copy of an existing command, used by the scheduled
    /// command runner; the original row keeps its terminal history.
    pub async fn resubmit(&self, command_id: i64) -> Result<Command, CommandEngineError> {
        let original = self
            .inner
            .store
            .find_by_id(command_id)
            .await?
            .ok_or(CommandEngineError::NotFound)?;
        let now = Utc::now();
        let copy = Command {
            id: 0,
            status: CommandStatus::Pending,
            raw_command: None,
            queued_at: None,
            sent_at: None,
            delivered_at: None,
            executed_at: None,
            failed_at: None,
            retry_count: 0,
            response: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            ..original
        };
        let mut copy = self.inner.store.insert(copy).await?;
        copy.transition(CommandStatus::Queued, now);
        self.inner.store.update(&copy).await?;
        self.push_entry(&copy, Instant::now());
        self.inner.notify.notify_waiters();
        Ok(copy)
    }

    /// Operator cancel of a non-terminal command. Aborts any pending
    /// delivery before the next send.
    pub async fn cancel(&self, command_id: i64) -> Result<Command, CommandEngineError> {
        let mut command = self
            .inner
            .store
            .find_by_id(command_id)
            .await?
            .ok_or(CommandEngineError::NotFound)?;
        let now = Utc::now();
        if !command.transition(CommandStatus::Cancelled, now) {
            return Err(CommandEngineError::IllegalTransition(command.status));
        }
        self.inner.store.update(&command).await?;
        self.inner
            .pending_ack
            .lock()
            .unwrap()
            .retain(|_, &mut id| id != command_id);
        metrics::counter!("commands_cancelled_total").increment(1);
        Ok(command)
    }

    /// Operator retry of a failed command.
    pub async fn retry(&self, command_id: i64) -> Result<Command, CommandEngineError> {
        let mut command = self
            .inner
            .store
            .find_by_id(command_id)
            .await?
            .ok_or(CommandEngineError::NotFound)?;
        if command.status != CommandStatus::Failed {
            return Err(CommandEngineError::IllegalTransition(command.status));
        }
        let now = Utc::now();
        command.transition(CommandStatus::Queued, now);
        self.inner.store.update(&command).await?;
        self.push_entry(&command, Instant::now());
        self.inner.notify.notify_waiters();
        Ok(command)
    }

    /// Correlates a device reply with the outstanding command for that
    /// device: first reply marks delivery, an execution reply completes the
    /// command and emits `commandResult`.
    pub async fn handle_response(
        &self,
        device_id: i64,
        executed: bool,
        response: &str,
    ) -> Result<(), CommandEngineError> {
        let command_id = {
            let pending = self.inner.pending_ack.lock().unwrap();
            match pending.get(&device_id) {
                Some(&id) => id,
                None => {
                    debug!(device_id, "Uncorrelated device reply ignored");
                    return Ok(());
                }
            }
        };
        let mut command = self
            .inner
            .store
            .find_by_id(command_id)
            .await?
            .ok_or(CommandEngineError::NotFound)?;
        let now = Utc::now();

        if command.status == CommandStatus::Sent {
            command.transition(CommandStatus::Delivered, now);
        }
        if executed && command.status == CommandStatus::Delivered {
            command.transition(CommandStatus::Executed, now);
            command.response = Some(response.to_string());
            self.inner.pending_ack.lock().unwrap().remove(&device_id);

            if let Some(device) = self.inner.devices.find_by_id(device_id).await? {
                let mut event = Event::new(EventType::CommandResult, device_id, now);
                event.attributes.set("commandId", command.id);
                event
                    .attributes
                    .set("commandType", command.command_type.as_str());
                event.attributes.set("response", response);
                self.inner
                    .dispatcher
                    .dispatch_best_effort(vec![event], &device)
                    .await;
            }
            metrics::counter!("commands_executed_total").increment(1);
        }
        self.inner.store.update(&command).await?;
        Ok(())
    }

    fn push_entry(&self, command: &Command, not_before: Instant) {
        let entry = QueueEntry {
            priority: command.priority,
            queued_at: command.queued_at.unwrap_or(command.created_at),
            seq: self.inner.seq.fetch_add(1, AtomicOrdering::SeqCst),
            command_id: command.id,
            not_before,
        };
        self.inner.queue.lock().unwrap().push(entry);
    }

    /// Pops the highest-priority entry that is due, leaving deferred entries
    /// queued. Entries for devices with an outstanding ack stay deferred so
    /// at most one send per device is in flight.
    fn pop_ready(&self) -> Option<QueueEntry> {
        let now = Instant::now();
        let mut queue = self.inner.queue.lock().unwrap();
        let mut deferred = Vec::new();
        let mut ready = None;
        while let Some(entry) = queue.pop() {
            if entry.not_before > now {
                deferred.push(entry);
                continue;
            }
            ready = Some(entry);
            break;
        }
        for entry in deferred {
            queue.push(entry);
        }
        ready
    }

    async fn deliver(&self, entry: QueueEntry) {
        if let Err(e) = self.try_deliver(&entry).await {
            warn!(command_id = entry.command_id, error = %e, "Command delivery pass failed");
        }
    }

    async fn try_deliver(&self, entry: &QueueEntry) -> Result<(), CommandEngineError> {
        let settings = &self.inner.settings;
        let Some(mut command) = self.inner.store.find_by_id(entry.command_id).await? else {
            return Ok(());
        };
        // Cancelled or already handled entries just drain.
        if command.status != CommandStatus::Queued {
            return Ok(());
        }
        let now = Utc::now();
        if command.is_expired(now) {
            command.transition(CommandStatus::Expired, now);
            self.inner.store.update(&command).await?;
            metrics::counter!("commands_expired_total").increment(1);
            return Ok(());
        }

        {
            let pending = self.inner.pending_ack.lock().unwrap();
            if pending.contains_key(&command.device_id) {
                drop(pending);
                self.defer(entry, &command, settings.tick);
                return Ok(());
            }
        }

        let Some(device) = self.inner.devices.find_by_id(command.device_id).await? else {
            command.error_message = Some("device no longer exists".to_string());
            command.transition(CommandStatus::Failed, now);
            self.inner.store.update(&command).await?;
            return Ok(());
        };

        let session = self.inner.sessions.lookup_by_device(command.device_id);

        // SMS path: explicit text channel, or no live session but a phone.
        if command.text_channel || (session.is_none() && device.phone.is_some()) {
            return self.deliver_sms(command, &device).await;
        }

        let Some(session) = session else {
            self.defer(entry, &command, settings.session_retry_backoff);
            return Ok(());
        };

        let Some(protocol) = self.inner.protocols.get(&session.protocol) else {
            command.error_message = Some(format!("no handler for protocol {}", session.protocol));
            command.transition(CommandStatus::Failed, now);
            self.inner.store.update(&command).await?;
            return Ok(());
        };

        let bytes = match protocol.encode_command(&command, &device) {
            Ok(bytes) => bytes,
            Err(e) => {
                // Encoding gaps are terminal; retrying cannot fix them.
                command.error_message = Some(e.to_string());
                command.transition(CommandStatus::Failed, now);
                self.inner.store.update(&command).await?;
                metrics::counter!("commands_encode_unsupported_total").increment(1);
                return Ok(());
            }
        };
        command.raw_command = Some(String::from_utf8_lossy(&bytes).into_owned());

        match session.send(bytes).await {
            Ok(()) => {
                command.transition(CommandStatus::Sent, now);
                self.inner.store.update(&command).await?;
                metrics::counter!("commands_sent_total").increment(1);
                self.inner
                    .pending_ack
                    .lock()
                    .unwrap()
                    .insert(command.device_id, command.id);
                self.spawn_ack_timeout(command.device_id, command.id);
                Ok(())
            }
            Err(_) => self.fail_and_maybe_retry(command, "session write failed").await,
        }
    }

    async fn deliver_sms(
        &self,
        mut command: Command,
        device: &domain::models::Device,
    ) -> Result<(), CommandEngineError> {
        let now = Utc::now();
        let Some(phone) = device.phone.clone() else {
            command.error_message = Some("text channel requested but device has no phone".into());
            command.transition(CommandStatus::Failed, now);
            self.inner.store.update(&command).await?;
            return Ok(());
        };

        // Render with the session protocol when bound, else the device's
        // configured protocol.
        let protocol_name = self
            .inner
            .sessions
            .lookup_by_device(device.id)
            .map(|s| s.protocol.clone())
            .unwrap_or_else(|| device.attributes.str_of("protocol", "suntech"));
        let Some(protocol) = self.inner.protocols.get(&protocol_name) else {
            command.error_message = Some(format!("no handler for protocol {}", protocol_name));
            command.transition(CommandStatus::Failed, now);
            self.inner.store.update(&command).await?;
            return Ok(());
        };

        let body = match protocol.encode_sms_command(&command, device) {
            Ok(body) => body,
            Err(e) => {
                command.error_message = Some(e.to_string());
                command.transition(CommandStatus::Failed, now);
                self.inner.store.update(&command).await?;
                return Ok(());
            }
        };

        match self.inner.sms.send(&phone, &body).await {
            Ok(()) => {
                // The SMS reply path is unhooked: SENT is as far as we track.
                command.raw_command = Some(body);
                command.transition(CommandStatus::Sent, now);
                self.inner.store.update(&command).await?;
                metrics::counter!("commands_sent_sms_total").increment(1);
                Ok(())
            }
            Err(e) => self.fail_and_maybe_retry(command, &e.to_string()).await,
        }
    }

    fn defer(&self, entry: &QueueEntry, command: &Command, delay: Duration) {
        self.push_entry_with(
            command,
            entry.queued_at,
            Instant::now() + delay,
        );
    }

    fn push_entry_with(
        &self,
        command: &Command,
        queued_at: chrono::DateTime<Utc>,
        not_before: Instant,
    ) {
        let entry = QueueEntry {
            priority: command.priority,
            queued_at,
            seq: self.inner.seq.fetch_add(1, AtomicOrdering::SeqCst),
            command_id: command.id,
            not_before,
        };
        self.inner.queue.lock().unwrap().push(entry);
    }

    async fn fail_and_maybe_retry(
        &self,
        mut command: Command,
        reason: &str,
    ) -> Result<(), CommandEngineError> {
        let now = Utc::now();
        command.error_message = Some(reason.to_string());
        let can_retry = command.retry_count < command.max_retries && !command.is_expired(now);
        command.transition(CommandStatus::Failed, now);
        command.retry_count += 1;
        metrics::counter!("commands_failed_total").increment(1);

        if can_retry {
            let exponent = (command.retry_count - 1).max(0) as u32;
            let backoff = self
                .inner
                .settings
                .retry_base
                .saturating_mul(2u32.saturating_pow(exponent))
                .min(self.inner.settings.retry_cap);
            command.transition(CommandStatus::Queued, now);
            self.inner.store.update(&command).await?;
            debug!(
                command_id = command.id,
                retry = command.retry_count,
                backoff_ms = backoff.as_millis() as u64,
                "Re-queueing failed command"
            );
            self.push_entry_with(&command, command.queued_at.unwrap_or(now), Instant::now() + backoff);
        } else {
            self.inner.store.update(&command).await?;
        }
        Ok(())
    }

    fn spawn_ack_timeout(&self, device_id: i64, command_id: i64) {
        let engine = self.clone();
        let timeout = self.inner.settings.ack_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let still_pending = {
                let mut pending = engine.inner.pending_ack.lock().unwrap();
                if pending.get(&device_id) == Some(&command_id) {
                    pending.remove(&device_id);
                    true
                } else {
                    false
                }
            };
            if !still_pending {
                return;
            }
            let Ok(Some(command)) = engine.inner.store.find_by_id(command_id).await else {
                return;
            };
            if matches!(command.status, CommandStatus::Sent | CommandStatus::Delivered) {
                warn!(command_id, device_id, "Command acknowledgment timed out");
                let _ = engine
                    .fail_and_maybe_retry(command, "acknowledgment timeout")
                    .await;
                engine.inner.notify.notify_waiters();
            }
        });
    }

    /// Number of queued (not yet delivered) entries, for observability.
    pub fn queue_depth(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }
}

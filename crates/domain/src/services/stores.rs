//! Narrow persistence interfaces consumed by the core.
//!
//! The runtime pipeline, command engine and hub talk to these traits only;
//! the `persistence` crate provides the PostgreSQL implementations and the
//! in-memory variants below back unit and scenario tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use thiserror::Error;

use crate::models::{
    Command, CommandStatus, Device, DeviceAccumulators, DeviceStatus, Event, EventType, Geofence,
    Position, ScheduledCommand, UnknownDevice,
};

/// Errors surfaced by a store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Filters for querying historical events.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub device_id: Option<i64>,
    pub types: Option<Vec<EventType>>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Position persistence. Implementations must keep per-device insert order.
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn insert(&self, position: Position) -> Result<Position, StoreError>;
    async fn latest_per_device(&self) -> Result<Vec<Position>, StoreError>;
    async fn history(
        &self,
        device_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Position>, StoreError>;
}

/// Event persistence.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert(&self, event: Event) -> Result<Event, StoreError>;
    async fn query(&self, query: EventQuery) -> Result<Vec<Event>, StoreError>;
}

/// Device lookups and state mutation.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn find_by_unique_id(&self, unique_id: &str) -> Result<Option<Device>, StoreError>;
    async fn find_by_id(&self, id: i64) -> Result<Option<Device>, StoreError>;
    async fn list(&self) -> Result<Vec<Device>, StoreError>;
    async fn update_accumulators(
        &self,
        device_id: i64,
        accumulators: DeviceAccumulators,
    ) -> Result<(), StoreError>;
    async fn update_status(
        &self,
        device_id: i64,
        status: DeviceStatus,
        last_update: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn set_disabled(&self, device_id: i64, disabled: bool) -> Result<(), StoreError>;
}

/// Sightings of identifiers with no registered device.
#[async_trait]
pub trait UnknownDeviceStore: Send + Sync {
    /// Creates the row on first sighting, otherwise bumps `last_seen` and the
    /// connection counter. Returns the current row.
    async fn upsert_sighting(
        &self,
        unique_id: &str,
        protocol: &str,
        port: u16,
        transport: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<UnknownDevice, StoreError>;
}

/// Command persistence and queue recovery.
#[async_trait]
pub trait CommandStore: Send + Sync {
    async fn insert(&self, command: Command) -> Result<Command, StoreError>;
    async fn update(&self, command: &Command) -> Result<(), StoreError>;
    async fn find_by_id(&self, id: i64) -> Result<Option<Command>, StoreError>;
    async fn list(&self, device_id: Option<i64>) -> Result<Vec<Command>, StoreError>;
    /// Queued commands in dispatch order (priority, then queue instant).
    async fn list_queued(&self) -> Result<Vec<Command>, StoreError>;
    async fn list_due_scheduled(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledCommand>, StoreError>;
    async fn update_scheduled(&self, scheduled: &ScheduledCommand) -> Result<(), StoreError>;
}

/// Geofence source for the spatial cache.
#[async_trait]
pub trait GeofenceStore: Send + Sync {
    async fn load_active(&self) -> Result<Vec<Geofence>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

/// In-memory position store preserving insert order.
#[derive(Default)]
pub struct MemoryPositionStore {
    positions: Mutex<Vec<Position>>,
    next_id: AtomicI64,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self {
            positions: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn all(&self) -> Vec<Position> {
        self.positions.lock().unwrap().clone()
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn insert(&self, mut position: Position) -> Result<Position, StoreError> {
        position.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.positions.lock().unwrap().push(position.clone());
        Ok(position)
    }

    async fn latest_per_device(&self) -> Result<Vec<Position>, StoreError> {
        let positions = self.positions.lock().unwrap();
        let mut latest: HashMap<i64, Position> = HashMap::new();
        for p in positions.iter() {
            if let Some(device_id) = p.device_id {
                latest.insert(device_id, p.clone());
            }
        }
        Ok(latest.into_values().collect())
    }

    async fn history(
        &self,
        device_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Position>, StoreError> {
        let positions = self.positions.lock().unwrap();
        Ok(positions
            .iter()
            .filter(|p| p.device_id == Some(device_id))
            .filter(|p| p.server_time >= from && p.server_time <= to)
            .cloned()
            .collect())
    }
}

/// In-memory event store.
#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<Event>>,
    next_id: AtomicI64,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn all(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert(&self, mut event: Event) -> Result<Event, StoreError> {
        event.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(event.clone());
        Ok(event)
    }

    async fn query(&self, query: EventQuery) -> Result<Vec<Event>, StoreError> {
        let events = self.events.lock().unwrap();
        let mut matched: Vec<Event> = events
            .iter()
            .filter(|e| query.device_id.map(|d| e.device_id == d).unwrap_or(true))
            .filter(|e| {
                query
                    .types
                    .as_ref()
                    .map(|ts| ts.contains(&e.event_type))
                    .unwrap_or(true)
            })
            .filter(|e| query.from.map(|f| e.event_time >= f).unwrap_or(true))
            .filter(|e| query.to.map(|t| e.event_time <= t).unwrap_or(true))
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }
}

/// In-memory device store.
#[derive(Default)]
pub struct MemoryDeviceStore {
    devices: Mutex<HashMap<i64, Device>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: Vec<Device>) -> Self {
        let store = Self::new();
        {
            let mut map = store.devices.lock().unwrap();
            for device in devices {
                map.insert(device.id, device);
            }
        }
        store
    }

    pub fn insert(&self, device: Device) {
        self.devices.lock().unwrap().insert(device.id, device);
    }

    pub fn get(&self, id: i64) -> Option<Device> {
        self.devices.lock().unwrap().get(&id).cloned()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn find_by_unique_id(&self, unique_id: &str) -> Result<Option<Device>, StoreError> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .values()
            .find(|d| d.unique_id == unique_id)
            .cloned())
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Device>, StoreError> {
        Ok(self.devices.lock().unwrap().get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Device>, StoreError> {
        Ok(self.devices.lock().unwrap().values().cloned().collect())
    }

    async fn update_accumulators(
        &self,
        device_id: i64,
        accumulators: DeviceAccumulators,
    ) -> Result<(), StoreError> {
        let mut devices = self.devices.lock().unwrap();
        let device = devices.get_mut(&device_id).ok_or(StoreError::NotFound)?;
        device.accumulators = accumulators;
        Ok(())
    }

    async fn update_status(
        &self,
        device_id: i64,
        status: DeviceStatus,
        last_update: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut devices = self.devices.lock().unwrap();
        let device = devices.get_mut(&device_id).ok_or(StoreError::NotFound)?;
        device.status = status;
        device.last_update = Some(last_update);
        Ok(())
    }

    async fn set_disabled(&self, device_id: i64, disabled: bool) -> Result<(), StoreError> {
        let mut devices = self.devices.lock().unwrap();
        let device = devices.get_mut(&device_id).ok_or(StoreError::NotFound)?;
        device.disabled = disabled;
        Ok(())
    }
}

/// In-memory unknown-device store.
#[derive(Default)]
pub struct MemoryUnknownDeviceStore {
    rows: Mutex<HashMap<String, UnknownDevice>>,
    next_id: AtomicI64,
}

impl MemoryUnknownDeviceStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn all(&self) -> Vec<UnknownDevice> {
        self.rows.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl UnknownDeviceStore for MemoryUnknownDeviceStore {
    async fn upsert_sighting(
        &self,
        unique_id: &str,
        protocol: &str,
        port: u16,
        transport: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<UnknownDevice, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .entry(unique_id.to_string())
            .and_modify(|row| {
                row.last_seen = seen_at;
                row.connection_count += 1;
            })
            .or_insert_with(|| UnknownDevice {
                id: self.next_id.fetch_add(1, Ordering::SeqCst),
                unique_id: unique_id.to_string(),
                protocol: protocol.to_string(),
                port,
                transport: transport.to_string(),
                first_seen: seen_at,
                last_seen: seen_at,
                connection_count: 1,
                is_registered: false,
                registered_device_id: None,
            });
        Ok(row.clone())
    }
}

/// In-memory command store.
#[derive(Default)]
pub struct MemoryCommandStore {
    commands: Mutex<HashMap<i64, Command>>,
    scheduled: Mutex<Vec<ScheduledCommand>>,
    next_id: AtomicI64,
}

impl MemoryCommandStore {
    pub fn new() -> Self {
        Self {
            commands: Mutex::new(HashMap::new()),
            scheduled: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn add_scheduled(&self, scheduled: ScheduledCommand) {
        self.scheduled.lock().unwrap().push(scheduled);
    }
}

#[async_trait]
impl CommandStore for MemoryCommandStore {
    async fn insert(&self, mut command: Command) -> Result<Command, StoreError> {
        command.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.commands
            .lock()
            .unwrap()
            .insert(command.id, command.clone());
        Ok(command)
    }

    async fn update(&self, command: &Command) -> Result<(), StoreError> {
        let mut commands = self.commands.lock().unwrap();
        if !commands.contains_key(&command.id) {
            return Err(StoreError::NotFound);
        }
        commands.insert(command.id, command.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Command>, StoreError> {
        Ok(self.commands.lock().unwrap().get(&id).cloned())
    }

    async fn list(&self, device_id: Option<i64>) -> Result<Vec<Command>, StoreError> {
        Ok(self
            .commands
            .lock()
            .unwrap()
            .values()
            .filter(|c| device_id.map(|d| c.device_id == d).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn list_queued(&self) -> Result<Vec<Command>, StoreError> {
        let mut queued: Vec<Command> = self
            .commands
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.status == CommandStatus::Queued)
            .cloned()
            .collect();
        queued.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.queued_at.cmp(&b.queued_at))
        });
        Ok(queued)
    }

    async fn list_due_scheduled(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledCommand>, StoreError> {
        Ok(self
            .scheduled
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect())
    }

    async fn update_scheduled(&self, scheduled: &ScheduledCommand) -> Result<(), StoreError> {
        let mut rows = self.scheduled.lock().unwrap();
        match rows.iter_mut().find(|s| s.id == scheduled.id) {
            Some(row) => {
                *row = scheduled.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }
}

/// In-memory geofence store.
#[derive(Default)]
pub struct MemoryGeofenceStore {
    geofences: Mutex<Vec<Geofence>>,
}

impl MemoryGeofenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_geofences(geofences: Vec<Geofence>) -> Self {
        Self {
            geofences: Mutex::new(geofences),
        }
    }

    pub fn replace(&self, geofences: Vec<Geofence>) {
        *self.geofences.lock().unwrap() = geofences;
    }
}

#[async_trait]
impl GeofenceStore for MemoryGeofenceStore {
    async fn load_active(&self) -> Result<Vec<Geofence>, StoreError> {
        Ok(self
            .geofences
            .lock()
            .unwrap()
            .iter()
            .filter(|g| !g.disabled)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::attributes::AttributeBag;
    use crate::models::CommandPriority;

    fn position(device_id: i64) -> Position {
        Position {
            id: 0,
            device_id: Some(device_id),
            unknown_device_id: None,
            protocol: "suntech".to_string(),
            server_time: Utc::now(),
            device_time: None,
            fix_time: Some(Utc::now()),
            valid: true,
            latitude: 1.0,
            longitude: 2.0,
            altitude: None,
            speed: None,
            course: None,
            accuracy: None,
            address: None,
            attributes: AttributeBag::new(),
        }
    }

    fn command(device_id: i64, priority: CommandPriority) -> Command {
        let now = Utc::now();
        Command {
            id: 0,
            device_id,
            user_id: 1,
            command_type: crate::models::CommandType::Reboot,
            priority,
            status: CommandStatus::Pending,
            parameters: AttributeBag::new(),
            raw_command: None,
            text_channel: false,
            queued_at: None,
            sent_at: None,
            delivered_at: None,
            executed_at: None,
            failed_at: None,
            retry_count: 0,
            max_retries: 3,
            expires_at: None,
            response: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_position_store_assigns_ids() {
        let store = MemoryPositionStore::new();
        let a = store.insert(position(1)).await.unwrap();
        let b = store.insert(position(1)).await.unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
    }

    #[tokio::test]
    async fn test_latest_per_device() {
        let store = MemoryPositionStore::new();
        store.insert(position(1)).await.unwrap();
        let mut second = position(1);
        second.latitude = 9.0;
        store.insert(second).await.unwrap();
        store.insert(position(2)).await.unwrap();

        let latest = store.latest_per_device().await.unwrap();
        assert_eq!(latest.len(), 2);
        let device1 = latest.iter().find(|p| p.device_id == Some(1)).unwrap();
        assert_eq!(device1.latitude, 9.0);
    }

    #[tokio::test]
    async fn test_unknown_device_upsert() {
        let store = MemoryUnknownDeviceStore::new();
        let now = Utc::now();
        let first = store
            .upsert_sighting("NEW42", "suntech", 5001, "tcp", now)
            .await
            .unwrap();
        assert_eq!(first.connection_count, 1);
        let later = now + chrono::Duration::seconds(30);
        let second = store
            .upsert_sighting("NEW42", "suntech", 5001, "tcp", later)
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.connection_count, 2);
        assert_eq!(second.last_seen, later);
        assert_eq!(second.first_seen, now);
    }

    #[tokio::test]
    async fn test_command_store_queue_order() {
        let store = MemoryCommandStore::new();
        let now = Utc::now();

        let mut low = command(1, CommandPriority::Low);
        low.status = CommandStatus::Queued;
        low.queued_at = Some(now);
        let mut critical = command(1, CommandPriority::Critical);
        critical.status = CommandStatus::Queued;
        critical.queued_at = Some(now + chrono::Duration::seconds(5));
        let mut normal_old = command(1, CommandPriority::Normal);
        normal_old.status = CommandStatus::Queued;
        normal_old.queued_at = Some(now);
        let mut normal_new = command(1, CommandPriority::Normal);
        normal_new.status = CommandStatus::Queued;
        normal_new.queued_at = Some(now + chrono::Duration::seconds(10));

        let low = store.insert(low).await.unwrap();
        let critical = store.insert(critical).await.unwrap();
        let normal_old = store.insert(normal_old).await.unwrap();
        let normal_new = store.insert(normal_new).await.unwrap();

        let queued = store.list_queued().await.unwrap();
        let ids: Vec<i64> = queued.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![critical.id, normal_old.id, normal_new.id, low.id]);
    }

    #[tokio::test]
    async fn test_device_store_status_update() {
        let store = MemoryDeviceStore::new();
        store.insert(Device {
            id: 7,
            unique_id: "907126119".to_string(),
            name: "t".to_string(),
            status: DeviceStatus::Unknown,
            last_update: None,
            group_id: None,
            phone: None,
            calendar_id: None,
            expiration_time: None,
            disabled: false,
            accumulators: DeviceAccumulators::default(),
            attributes: AttributeBag::new(),
        });
        let now = Utc::now();
        store
            .update_status(7, DeviceStatus::Online, now)
            .await
            .unwrap();
        let device = store.get(7).unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.last_update, Some(now));
    }

    #[tokio::test]
    async fn test_event_query_filters() {
        let store = MemoryEventStore::new();
        let now = Utc::now();
        store
            .insert(Event::new(EventType::DeviceOnline, 1, now))
            .await
            .unwrap();
        store
            .insert(Event::new(EventType::GeofenceEnter, 1, now))
            .await
            .unwrap();
        store
            .insert(Event::new(EventType::DeviceOnline, 2, now))
            .await
            .unwrap();

        let events = store
            .query(EventQuery {
                device_id: Some(1),
                types: Some(vec![EventType::DeviceOnline]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].device_id, 1);
    }
}

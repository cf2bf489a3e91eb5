//! Event dispatch.
//!
//! Owns the routing of synthesized events to persistence, the live hub and
//! notification recipients. The severity table is fixed on the event type;
//! critical and high events reach the hub before the pipeline returns to
//! the device's next frame.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

use domain::models::{Device, Event, EventType};
use domain::services::{EventStore, StoreError, UserAccess};

use crate::hub::LiveHub;

/// Routes events to persistence, the hub and notifications.
pub struct EventDispatcher {
    events: Arc<dyn EventStore>,
    access: Arc<dyn UserAccess>,
    hub: LiveHub,
}

impl EventDispatcher {
    pub fn new(events: Arc<dyn EventStore>, access: Arc<dyn UserAccess>, hub: LiveHub) -> Self {
        Self { events, access, hub }
    }

    /// Human-readable notification line for an event.
    fn describe(event: &Event, device: &Device) -> String {
        let what = match event.event_type {
            EventType::DeviceOnline => "came online".to_string(),
            EventType::DeviceOffline => "went offline".to_string(),
            EventType::DeviceMoving => "started moving".to_string(),
            EventType::DeviceStopped => "stopped".to_string(),
            EventType::DeviceOverspeed => {
                let limit = event.attributes.double_of("speedLimit", 0.0);
                format!("exceeded the speed limit of {:.0} km/h", limit)
            }
            EventType::DeviceFuelDrop => "reported a fuel drop".to_string(),
            EventType::GeofenceEnter => "entered a geofence".to_string(),
            EventType::GeofenceExit => "left a geofence".to_string(),
            EventType::IgnitionOn => "turned ignition on".to_string(),
            EventType::IgnitionOff => "turned ignition off".to_string(),
            EventType::Alarm => {
                format!("raised alarm: {}", event.attributes.str_of("alarm", "unknown"))
            }
            EventType::Maintenance => "is due for maintenance".to_string(),
            EventType::DriverChanged => "changed driver".to_string(),
            EventType::CommandResult => "acknowledged a command".to_string(),
            EventType::Media => "uploaded media".to_string(),
        };
        format!("{} {}", device.name, what)
    }

    /// Users that may see the device, per the permission graph.
    pub fn recipients_for(&self, device_id: i64) -> HashSet<i64> {
        self.access.users_for_device(device_id)
    }

    /// Persists the events in pipeline order, then publishes each to the hub
    /// and to notification subscribers. Returns the stored events.
    pub async fn dispatch(
        &self,
        events: Vec<Event>,
        device: &Device,
    ) -> Result<Vec<Event>, StoreError> {
        if events.is_empty() {
            return Ok(events);
        }
        let recipients = self.recipients_for(device.id);
        let mut stored = Vec::with_capacity(events.len());
        for event in events {
            let event = self.events.insert(event).await?;
            metrics::counter!(
                "events_generated_total",
                "type" => event.event_type.as_str().to_string()
            )
            .increment(1);
            self.hub.publish_event(&event, recipients.clone());
            self.hub
                .publish_notification(&event, Self::describe(&event, device), recipients.clone());
            stored.push(event);
        }
        Ok(stored)
    }

    /// Like `dispatch`, but never fails the caller: persistence errors are
    /// logged and the surviving events returned. Used by paths with no
    /// back-pressure channel to the device.
    pub async fn dispatch_best_effort(&self, events: Vec<Event>, device: &Device) -> Vec<Event> {
        match self.dispatch(events, device).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(device_id = device.id, error = %e, "Dropping events after store failure");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{HubSettings, Topic};
    use chrono::Utc;
    use domain::models::{AttributeBag, DeviceStatus};
    use domain::services::{MemoryEventStore, StaticUserAccess};

    fn device() -> Device {
        Device {
            id: 7,
            unique_id: "907126119".to_string(),
            name: "Truck 12".to_string(),
            status: DeviceStatus::Online,
            last_update: None,
            group_id: None,
            phone: None,
            calendar_id: None,
            expiration_time: None,
            disabled: false,
            accumulators: Default::default(),
            attributes: AttributeBag::new(),
        }
    }

    fn dispatcher() -> (EventDispatcher, Arc<MemoryEventStore>, LiveHub) {
        let store = Arc::new(MemoryEventStore::new());
        let access = StaticUserAccess::new();
        access.grant(1, 7);
        access.add_admin(9);
        let hub = LiveHub::new(HubSettings::default());
        let dispatcher = EventDispatcher::new(store.clone(), Arc::new(access), hub.clone());
        (dispatcher, store, hub)
    }

    #[tokio::test]
    async fn test_dispatch_persists_in_order() {
        let (dispatcher, store, _hub) = dispatcher();
        let now = Utc::now();
        let events = vec![
            Event::new(EventType::DeviceOnline, 7, now),
            Event::new(EventType::GeofenceEnter, 7, now),
            Event::new(EventType::DeviceMoving, 7, now),
        ];
        let stored = dispatcher.dispatch(events, &device()).await.unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored[0].id < stored[1].id && stored[1].id < stored[2].id);
        let all = store.all();
        assert_eq!(all[0].event_type, EventType::DeviceOnline);
        assert_eq!(all[2].event_type, EventType::DeviceMoving);
    }

    #[tokio::test]
    async fn test_dispatch_publishes_event_and_notification() {
        let (dispatcher, _store, hub) = dispatcher();
        let mut rx = hub.subscribe();
        dispatcher
            .dispatch(vec![Event::new(EventType::DeviceOverspeed, 7, Utc::now())], &device())
            .await
            .unwrap();

        let event_msg = rx.recv().await.unwrap();
        assert_eq!(event_msg.topic, Topic::Events);
        // Granted user and admin both receive.
        assert!(event_msg.recipients.contains(&1));
        assert!(event_msg.recipients.contains(&9));

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.topic, Topic::Notifications);
    }

    #[tokio::test]
    async fn test_dispatch_empty_is_noop() {
        let (dispatcher, store, hub) = dispatcher();
        let mut rx = hub.subscribe();
        let stored = dispatcher.dispatch(Vec::new(), &device()).await.unwrap();
        assert!(stored.is_empty());
        assert!(store.all().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_describe_overspeed_mentions_limit() {
        let mut event = Event::new(EventType::DeviceOverspeed, 7, Utc::now());
        event.attributes.set("speedLimit", 80.0);
        let text = EventDispatcher::describe(&event, &device());
        assert!(text.contains("Truck 12"));
        assert!(text.contains("80 km/h"));
    }
}

//! Live fan-out hub.
//!
//! One broadcast channel feeds every connected operator. Publishing never
//! blocks the position pipeline; a slow subscriber lags on its own receiver
//! and is told so with a `stale` control frame by its sender task. Delivery
//! is FIFO per subscriber and unordered across subscribers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use domain::models::{Device, DeviceStatus, Event, EventSeverity, Position};

/// Topics an operator may subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Positions,
    Events,
    Devices,
    Notifications,
}

impl Topic {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "positions" => Some(Topic::Positions),
            "events" => Some(Topic::Events),
            "devices" => Some(Topic::Devices),
            "notifications" => Some(Topic::Notifications),
            _ => None,
        }
    }
}

/// Server-to-operator frame, serialized as `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    Position(Position),
    Event(Event),
    DeviceStatus {
        #[serde(rename = "deviceId")]
        device_id: i64,
        status: DeviceStatus,
        #[serde(rename = "lastUpdate")]
        last_update: Option<DateTime<Utc>>,
    },
    Notification {
        severity: EventSeverity,
        message: String,
        #[serde(rename = "deviceId")]
        device_id: i64,
        #[serde(rename = "eventType")]
        event_type: String,
        timestamp: DateTime<Utc>,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
    Info {
        message: String,
    },
    Stale {
        dropped: u64,
    },
}

/// A published message together with its routing scope.
#[derive(Debug, Clone)]
pub struct HubMessage {
    pub topic: Topic,
    /// Users allowed to see the message.
    pub recipients: HashSet<i64>,
    pub frame: ServerFrame,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Per-subscriber buffered queue bound.
    pub queue_bound: usize,
    pub heartbeat_interval: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            queue_bound: 256,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Broadcast hub handle.
#[derive(Clone)]
pub struct LiveHub {
    tx: broadcast::Sender<Arc<HubMessage>>,
    settings: HubSettings,
}

impl LiveHub {
    pub fn new(settings: HubSettings) -> Self {
        let (tx, _) = broadcast::channel(settings.queue_bound.max(1));
        Self { tx, settings }
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Attaches a new subscriber queue.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<HubMessage>> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn publish(&self, message: HubMessage) {
        // Send only fails with zero subscribers, which is not an error here.
        let _ = self.tx.send(Arc::new(message));
        metrics::counter!("hub_messages_published_total").increment(1);
    }

    pub fn publish_position(&self, position: &Position, recipients: HashSet<i64>) {
        self.publish(HubMessage {
            topic: Topic::Positions,
            recipients,
            frame: ServerFrame::Position(position.clone()),
        });
    }

    pub fn publish_event(&self, event: &Event, recipients: HashSet<i64>) {
        self.publish(HubMessage {
            topic: Topic::Events,
            recipients,
            frame: ServerFrame::Event(event.clone()),
        });
    }

    pub fn publish_device_status(&self, device: &Device, recipients: HashSet<i64>) {
        self.publish(HubMessage {
            topic: Topic::Devices,
            recipients,
            frame: ServerFrame::DeviceStatus {
                device_id: device.id,
                status: device.status,
                last_update: device.last_update,
            },
        });
    }

    pub fn publish_notification(&self, event: &Event, message: String, recipients: HashSet<i64>) {
        self.publish(HubMessage {
            topic: Topic::Notifications,
            recipients,
            frame: ServerFrame::Notification {
                severity: event.event_type.severity(),
                message,
                device_id: event.device_id,
                event_type: event.event_type.as_str().to_string(),
                timestamp: event.event_time,
            },
        });
    }
}

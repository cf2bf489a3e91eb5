//! Device session registry.
//!
//! Maps live transport connections to device identities so that position
//! decoding can attribute frames without a database lookup and the command
//! engine can find an outbound channel. Reads vastly outnumber writes; the
//! maps sit behind readers-writer locks and every mutation is linearizable.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;

use crate::protocol::Transport;

/// Reason a session was closed, observed by its connection task.
pub type CloseReason = &'static str;

/// One live transport binding.
///
/// TCP sessions live as long as their connection; UDP sessions are keyed by
/// source address and reused across datagrams; HTTP requests are sessions of
/// length one.
pub struct Session {
    pub id: Uuid,
    pub protocol: String,
    pub transport: Transport,
    pub remote_addr: SocketAddr,
    pub port: u16,
    pub started_at: DateTime<Utc>,
    device_id: RwLock<Option<i64>>,
    unique_id: RwLock<Option<String>>,
    last_seen: RwLock<DateTime<Utc>>,
    outbound: mpsc::Sender<Vec<u8>>,
    close_tx: watch::Sender<Option<CloseReason>>,
}

impl Session {
    /// Creates a session around an outbound byte channel. The returned
    /// receiver fires when the session is closed.
    pub fn new(
        protocol: impl Into<String>,
        transport: Transport,
        remote_addr: SocketAddr,
        port: u16,
        outbound: mpsc::Sender<Vec<u8>>,
    ) -> (Arc<Self>, watch::Receiver<Option<CloseReason>>) {
        let (close_tx, close_rx) = watch::channel(None);
        let now = Utc::now();
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            protocol: protocol.into(),
            transport,
            remote_addr,
            port,
            started_at: now,
            device_id: RwLock::new(None),
            unique_id: RwLock::new(None),
            last_seen: RwLock::new(now),
            outbound,
            close_tx,
        });
        (session, close_rx)
    }

    pub fn device_id(&self) -> Option<i64> {
        *self.device_id.read().unwrap()
    }

    pub fn unique_id(&self) -> Option<String> {
        self.unique_id.read().unwrap().clone()
    }

    pub fn set_unique_id(&self, unique_id: &str) {
        *self.unique_id.write().unwrap() = Some(unique_id.to_string());
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.read().unwrap()
    }

    /// Bumps the liveness instant.
    pub fn touch(&self) {
        *self.last_seen.write().unwrap() = Utc::now();
    }

    /// Queues bytes for the connection writer task.
    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), SessionSendError> {
        self.outbound
            .send(bytes)
            .await
            .map_err(|_| SessionSendError::Closed)
    }

    /// Signals the owning connection task to close. Takes effect even when
    /// the connection task already went away.
    pub fn close(&self, reason: CloseReason) {
        self.close_tx.send_replace(Some(reason));
    }

    pub fn is_closed(&self) -> bool {
        self.close_tx.borrow().is_some()
    }
}

/// Error writing to a session.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SessionSendError {
    #[error("session transport closed")]
    Closed,
}

/// Outcome of releasing a session.
#[derive(Debug, PartialEq)]
pub struct ReleaseOutcome {
    /// Set when the released session was the device's last: the device has
    /// gone offline.
    pub device_now_offline: Option<i64>,
}

/// Shared registry of live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    by_device: RwLock<HashMap<i64, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a freshly accepted session.
    pub fn register(&self, session: Arc<Session>) {
        self.sessions.write().unwrap().insert(session.id, session);
    }

    /// Associates a session with a device after identification. Any prior
    /// binding for the device is superseded and its session closed.
    pub fn bind(&self, session: &Arc<Session>, device_id: i64) -> Option<Arc<Session>> {
        *session.device_id.write().unwrap() = Some(device_id);
        let previous = {
            let mut by_device = self.by_device.write().unwrap();
            by_device.insert(device_id, Arc::clone(session))
        };
        match previous {
            Some(old) if old.id != session.id => {
                info!(
                    device_id,
                    old_session = %old.id,
                    new_session = %session.id,
                    "Superseding previous device session"
                );
                old.close("superseded");
                Some(old)
            }
            _ => None,
        }
    }

    /// The live session bound to a device, if any.
    pub fn lookup_by_device(&self, device_id: i64) -> Option<Arc<Session>> {
        self.by_device.read().unwrap().get(&device_id).cloned()
    }

    /// Drops a session when its transport closes. Reports whether the device
    /// lost its last session.
    pub fn release(&self, session: &Session) -> ReleaseOutcome {
        self.sessions.write().unwrap().remove(&session.id);
        let mut device_now_offline = None;
        if let Some(device_id) = session.device_id() {
            let mut by_device = self.by_device.write().unwrap();
            if by_device
                .get(&device_id)
                .map(|bound| bound.id == session.id)
                .unwrap_or(false)
            {
                by_device.remove(&device_id);
                device_now_offline = Some(device_id);
            }
        }
        debug!(session = %session.id, ?device_now_offline, "Session released");
        ReleaseOutcome { device_now_offline }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Closes every session, used during shutdown.
    pub fn close_all(&self, reason: CloseReason) {
        for session in self.sessions.read().unwrap().values() {
            session.close(reason);
        }
    }
}

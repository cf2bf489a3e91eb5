//! Transport listeners and the ingestion manager.
//!
//! Each enabled `(protocol, port, transport)` endpoint gets a dedicated
//! accept loop; every accepted TCP connection gets one reader task whose
//! lifetime equals the connection. Framing errors are tolerated up to a
//! bound, then the connection is closed as hostile. One bad frame never
//! takes down a listener.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use domain::services::DeviceStore;

use crate::commands::CommandEngine;
use crate::pipeline::{FrameSource, PositionPipeline};
use crate::protocol::{Decoded, DecodeContext, DecodeError, FrameOutcome, Protocol, Transport};
use crate::session::{Session, SessionRegistry};

/// Listener tuning.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Per-frame read deadline for TCP connections.
    pub read_timeout: Duration,
    pub max_frame_len: usize,
    /// Consecutive framing errors before a connection is closed as hostile.
    pub max_frame_errors: u32,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(180),
            max_frame_len: 2048,
            max_frame_errors: 10,
        }
    }
}

/// One configured transport endpoint.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub port: u16,
    pub transport: Transport,
}

fn default_enabled() -> bool {
    true
}

/// Collaborators shared by every listener.
#[derive(Clone)]
pub struct IngestDeps {
    pub pipeline: Arc<PositionPipeline>,
    pub sessions: Arc<SessionRegistry>,
    pub devices: Arc<dyn DeviceStore>,
    pub engine: CommandEngine,
}

struct RunningListener {
    protocol: String,
    port: u16,
    transport: Transport,
    handle: JoinHandle<()>,
}

/// Owns the lifecycle of all socket listeners. The single place that knows
/// how to start, stop and list them.
pub struct IngestionManager {
    protocols: super::ProtocolRegistry,
    deps: IngestDeps,
    settings: IngestSettings,
    listeners: Vec<RunningListener>,
    shutdown_tx: watch::Sender<bool>,
}

impl IngestionManager {
    pub fn new(
        protocols: super::ProtocolRegistry,
        deps: IngestDeps,
        settings: IngestSettings,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            protocols,
            deps,
            settings,
            listeners: Vec::new(),
            shutdown_tx,
        }
    }

    /// Binds and starts every enabled socket endpoint. Sockets are bound
    /// before this returns; HTTP endpoints are served by the web stack.
    pub async fn start(
        &mut self,
        endpoints: &HashMap<String, EndpointConfig>,
    ) -> anyhow::Result<()> {
        for (name, endpoint) in endpoints {
            if !endpoint.enabled || endpoint.transport == Transport::Http {
                continue;
            }
            let Some(handler) = self.protocols.get(name) else {
                warn!(protocol = %name, "No handler registered; endpoint skipped");
                continue;
            };
            let addr = SocketAddr::from(([0, 0, 0, 0], endpoint.port));
            let handle = match endpoint.transport {
                Transport::Tcp => {
                    let listener = TcpListener::bind(addr).await?;
                    info!(protocol = %name, port = endpoint.port, "TCP listener bound");
                    tokio::spawn(run_tcp_listener(
                        listener,
                        handler,
                        self.deps.clone(),
                        self.settings.clone(),
                        endpoint.port,
                        self.shutdown_tx.subscribe(),
                    ))
                }
                Transport::Udp => {
                    let socket = UdpSocket::bind(addr).await?;
                    info!(protocol = %name, port = endpoint.port, "UDP listener bound");
                    tokio::spawn(run_udp_listener(
                        socket,
                        handler,
                        self.deps.clone(),
                        self.settings.clone(),
                        endpoint.port,
                        self.shutdown_tx.subscribe(),
                    ))
                }
                Transport::Http => unreachable!(),
            };
            self.listeners.push(RunningListener {
                protocol: name.clone(),
                port: endpoint.port,
                transport: endpoint.transport,
                handle,
            });
        }
        Ok(())
    }

    /// Running socket endpoints as `(protocol, port, transport)`.
    pub fn running(&self) -> Vec<(String, u16, Transport)> {
        self.listeners
            .iter()
            .map(|l| (l.protocol.clone(), l.port, l.transport))
            .collect()
    }

    /// Stops accepting, closes sessions and waits for reader tasks.
    pub async fn stop(self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        self.deps.sessions.close_all("shutdown");
        let drain = async {
            for listener in self.listeners {
                let _ = listener.handle.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("Listener shutdown timed out after {:?}", grace);
        }
    }
}

pub(crate) async fn run_tcp_listener(
    listener: TcpListener,
    handler: Arc<dyn Protocol>,
    deps: IngestDeps,
    settings: IngestSettings,
    port: u16,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let handler = Arc::clone(&handler);
                        let deps = deps.clone();
                        let settings = settings.clone();
                        tokio::spawn(async move {
                            handle_tcp_connection(stream, peer, handler, deps, settings, port).await;
                        });
                    }
                    Err(e) => {
                        warn!(port, error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!(port, "Listener stopping");
                    break;
                }
            }
        }
    }
}

async fn handle_tcp_connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn Protocol>,
    deps: IngestDeps,
    settings: IngestSettings,
    port: u16,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(16);
    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = outbound_rx.recv().await {
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let (session, mut close_rx) =
        Session::new(handler.name(), Transport::Tcp, peer, port, outbound_tx);
    deps.sessions.register(Arc::clone(&session));
    metrics::gauge!("ingest_sessions_active").increment(1.0);
    debug!(protocol = handler.name(), %peer, "Connection accepted");

    let mut ctx = DecodeContext::default();
    let mut buffer: Vec<u8> = Vec::with_capacity(settings.max_frame_len);
    let mut chunk = vec![0u8; settings.max_frame_len];
    let mut consecutive_bad = 0u32;

    'connection: loop {
        let read = tokio::select! {
            read = tokio::time::timeout(settings.read_timeout, reader.read(&mut chunk)) => read,
            _ = close_rx.changed() => {
                debug!(%peer, reason = ?*close_rx.borrow(), "Session closed by registry");
                break 'connection;
            }
        };
        let n = match read {
            Ok(Ok(0)) => break 'connection,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!(%peer, error = %e, "Read failed");
                break 'connection;
            }
            Err(_) => {
                debug!(%peer, "Read deadline expired; closing idle connection");
                break 'connection;
            }
        };
        buffer.extend_from_slice(&chunk[..n]);

        loop {
            match handler.frame(&buffer, settings.max_frame_len) {
                FrameOutcome::NeedMore => break,
                FrameOutcome::Bad { discard } => {
                    let discard = discard.clamp(1, buffer.len());
                    buffer.drain(..discard);
                    consecutive_bad += 1;
                    metrics::counter!("ingest_frames_bad_total").increment(1);
                    if consecutive_bad >= settings.max_frame_errors {
                        warn!(%peer, protocol = handler.name(), "Closing hostile connection");
                        break 'connection;
                    }
                }
                FrameOutcome::Frame { len } => {
                    consecutive_bad = 0;
                    let frame: Vec<u8> = buffer.drain(..len).collect();
                    handle_frame(&frame, &handler, &mut ctx, &session, &deps, port, Transport::Tcp)
                        .await;
                }
            }
        }
    }

    let outcome = deps.sessions.release(&session);
    metrics::gauge!("ingest_sessions_active").decrement(1.0);
    if let Some(device_id) = outcome.device_now_offline {
        if let Some(unique_id) = session.unique_id() {
            deps.pipeline.device_offline(&unique_id, device_id).await;
        }
    }
    writer_task.abort();
    debug!(%peer, "Connection finished");
}

pub(crate) async fn run_udp_listener(
    socket: UdpSocket,
    handler: Arc<dyn Protocol>,
    deps: IngestDeps,
    settings: IngestSettings,
    port: u16,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let socket = Arc::new(socket);
    // UDP sessions are keyed per source address and identified per datagram.
    let mut peers: HashMap<SocketAddr, (Arc<Session>, DecodeContext)> = HashMap::new();
    let mut buf = vec![0u8; settings.max_frame_len];

    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        };
        let (n, peer) = match received {
            Ok(ok) => ok,
            Err(e) => {
                warn!(port, error = %e, "UDP receive failed");
                continue;
            }
        };

        if !peers.contains_key(&peer) {
            let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(16);
            let reply_socket = Arc::clone(&socket);
            tokio::spawn(async move {
                while let Some(bytes) = outbound_rx.recv().await {
                    if reply_socket.send_to(&bytes, peer).await.is_err() {
                        break;
                    }
                }
            });
            let (session, _close_rx) =
                Session::new(handler.name(), Transport::Udp, peer, port, outbound_tx);
            deps.sessions.register(Arc::clone(&session));
            peers.insert(peer, (session, DecodeContext::default()));
        }
        // Bound the peer map: drop sessions idle past the read deadline.
        if peers.len() > 1024 {
            let horizon = chrono::Utc::now()
                - chrono::Duration::from_std(settings.read_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(180));
            peers.retain(|_, (session, _)| {
                let keep = session.last_seen() > horizon;
                if !keep {
                    deps.sessions.release(session);
                }
                keep
            });
        }

        let (session, ctx) = peers.get_mut(&peer).expect("peer session just inserted");
        let mut datagram = &buf[..n];
        while !datagram.is_empty() {
            match handler.frame(datagram, settings.max_frame_len) {
                FrameOutcome::Frame { len } => {
                    let frame = datagram[..len].to_vec();
                    datagram = &datagram[len..];
                    handle_frame(&frame, &handler, ctx, session, &deps, port, Transport::Udp).await;
                }
                FrameOutcome::NeedMore | FrameOutcome::Bad { .. } => {
                    metrics::counter!("ingest_frames_bad_total").increment(1);
                    break;
                }
            }
        }
    }
}

/// Decodes one frame and routes the result. Decode errors keep the session
/// open; the raw bytes go to the log for diagnosis.
async fn handle_frame(
    frame: &[u8],
    handler: &Arc<dyn Protocol>,
    ctx: &mut DecodeContext,
    session: &Arc<Session>,
    deps: &IngestDeps,
    port: u16,
    transport: Transport,
) {
    session.touch();
    let decoded = match handler.decode(frame, ctx) {
        Ok(decoded) => decoded,
        Err(DecodeError::BadFrame(reason)) => {
            warn!(
                protocol = handler.name(),
                reason = %reason,
                raw = %hex_preview(frame),
                "Frame failed to decode"
            );
            return;
        }
        Err(DecodeError::UnsupportedKind(kind)) => {
            warn!(protocol = handler.name(), kind = %kind, "Skipping unsupported message kind");
            return;
        }
    };

    match decoded {
        Decoded::Login { unique_id, reply } => {
            session.set_unique_id(&unique_id);
            identify(session, deps, &unique_id).await;
            if let Some(reply) = reply {
                let _ = session.send(reply).await;
            }
        }
        Decoded::Heartbeat { reply } => {
            if let Some(reply) = reply {
                let _ = session.send(reply).await;
            }
        }
        Decoded::Positions(positions) => {
            metrics::counter!(
                "ingest_frames_decoded_total",
                "protocol" => handler.name().to_string()
            )
            .increment(1);
            for position in positions {
                if session.device_id().is_none() {
                    session.set_unique_id(&position.unique_id);
                    identify(session, deps, &position.unique_id).await;
                }
                deps.pipeline
                    .submit(position, FrameSource { port, transport })
                    .await;
            }
        }
        Decoded::CommandResponse { executed, response } => {
            if let Some(device_id) = session.device_id() {
                if let Err(e) = deps.engine.handle_response(device_id, executed, &response).await {
                    warn!(device_id, error = %e, "Command response handling failed");
                }
            }
        }
        Decoded::Ignored => {}
    }
}

/// Binds the session to a registered device, superseding any prior session
/// for that device. Unregistered identifiers stay unbound; their positions
/// take the unknown-device path in the pipeline.
async fn identify(session: &Arc<Session>, deps: &IngestDeps, unique_id: &str) {
    if session.device_id().is_some() {
        return;
    }
    match deps.devices.find_by_unique_id(unique_id).await {
        Ok(Some(device)) => {
            deps.sessions.bind(session, device.id);
        }
        Ok(None) => {}
        Err(e) => {
            warn!(unique_id = %unique_id, error = %e, "Device lookup failed during identify");
        }
    }
}

fn hex_preview(bytes: &[u8]) -> String {
    const MAX: usize = 32;
    let mut out = String::with_capacity(MAX * 2 + 3);
    for byte in bytes.iter().take(MAX) {
        out.push_str(&format!("{:02x}", byte));
    }
    if bytes.len() > MAX {
        out.push_str("...");
    }
    out
}

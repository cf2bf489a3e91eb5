//! Protocol handler contract and registry.
//!
//! A protocol turns raw transport bytes into discrete frames, frames into
//! protocol-neutral intermediates, and outbound commands into wire bytes.
//! Handlers are registered by name and looked up by the ingestion manager
//! and the command engine.

pub mod gt06;
pub mod h02;
pub mod listener;
pub mod osmand;
pub mod suntech;

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use domain::models::{Command, CommandType, DecodedPosition, Device};

/// Transport a listener binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
    Http,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
            Transport::Http => "http",
        }
    }
}

/// Result of scanning the receive buffer for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A complete frame occupies the first `len` bytes.
    Frame { len: usize },
    /// The buffer holds only a frame prefix; re-enter once it grows.
    NeedMore,
    /// The buffer head is not a frame; drop `discard` bytes and rescan.
    Bad { discard: usize },
}

/// Mutable per-connection state a decoder may update (e.g. identity bound by
/// a login frame).
#[derive(Debug, Default)]
pub struct DecodeContext {
    pub unique_id: Option<String>,
}

/// Protocol-neutral intermediate produced by `decode`.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// One or more position reports.
    Positions(Vec<DecodedPosition>),
    /// Identity announcement; `reply` goes back on the wire when set.
    Login {
        unique_id: String,
        reply: Option<Vec<u8>>,
    },
    /// Keep-alive; `reply` goes back on the wire when set.
    Heartbeat { reply: Option<Vec<u8>> },
    /// Reply correlating to an outstanding command.
    CommandResponse { executed: bool, response: String },
    /// Recognized but carrying nothing the pipeline consumes.
    Ignored,
}

/// Errors raised while decoding a frame.
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("bad frame: {0}")]
    BadFrame(String),
    #[error("unsupported message kind: {0}")]
    UnsupportedKind(String),
}

/// Errors raised while rendering an outbound command.
#[derive(Debug, Error, PartialEq)]
pub enum CommandEncodeError {
    #[error("command type {0} not supported by this protocol")]
    Unsupported(CommandType),
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),
}

/// Contract every protocol handler implements.
///
/// `frame` must be pure over the buffer and never block; memory is bounded
/// by `max_frame_len` (oversized heads come back as `Bad`).
pub trait Protocol: Send + Sync {
    fn name(&self) -> &'static str;

    fn frame(&self, buf: &[u8], max_frame_len: usize) -> FrameOutcome;

    fn decode(&self, frame: &[u8], ctx: &mut DecodeContext) -> Result<Decoded, DecodeError>;

    fn encode_command(
        &self,
        command: &Command,
        device: &Device,
    ) -> Result<Vec<u8>, CommandEncodeError>;

    /// SMS rendering of a command; defaults to the wire rendering when it is
    /// printable text.
    fn encode_sms_command(
        &self,
        command: &Command,
        device: &Device,
    ) -> Result<String, CommandEncodeError> {
        let bytes = self.encode_command(command, device)?;
        String::from_utf8(bytes).map_err(|_| CommandEncodeError::Unsupported(command.command_type))
    }
}

/// Name-indexed protocol handlers.
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    handlers: HashMap<String, Arc<dyn Protocol>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in protocol set.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(suntech::SuntechProtocol::new()));
        registry.register(Arc::new(gt06::Gt06Protocol::new()));
        registry.register(Arc::new(h02::H02Protocol::new()));
        registry.register(Arc::new(osmand::OsmandProtocol::new()));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn Protocol>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Protocol>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

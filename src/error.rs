//! Error types for deskpilot subsystems
//!
//! Transport and protocol failures terminate connections; everything a
//! handler can produce is normalized into a response envelope before it
//! leaves the dispatcher, so these enums never cross the wire directly.

use thiserror::Error;

use crate::domain_types::{ConnectionId, CommandName};

/// Frame-level protocol violations; all of these close the connection
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    #[error("first frame must be register, got {frame_type}")]
    RegisterNotFirst { frame_type: String },

    #[error("unknown frame type: {frame_type}")]
    UnknownFrameType { frame_type: String },

    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

/// Broker-side failures
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("no such connection: {0}")]
    NoSuchConnection(ConnectionId),

    #[error("outbound queue overflow for connection {0}")]
    SlowConsumer(ConnectionId),

    #[error("connection {0} closed")]
    ConnectionClosed(ConnectionId),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Dispatcher-side failures, prior to envelope normalization
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown command: {0}")]
    UnknownCommand(CommandName),

    #[error("capability {capability} not advertised for command {command}")]
    CapabilityMissing {
        command: CommandName,
        capability: String,
    },

    #[error("invalid parameter: {reason}")]
    InvalidParam { reason: String },

    #[error("command {command} exceeded its {timeout_secs}s deadline")]
    Timeout {
        command: CommandName,
        timeout_secs: u64,
    },

    #[error("handler panicked: {detail}")]
    HandlerPanic { detail: String },
}

/// GUI-automation failures surfaced by capability handlers
#[derive(Debug, Error)]
pub enum GuiError {
    #[error("window not found: {0}")]
    WindowNotFound(u64),

    #[error("no focusable input element matched (best score {best_score:.2})")]
    NoInputCandidate { best_score: f64 },

    #[error("text was not applied after {attempts} write attempts")]
    InputNotApplied { attempts: u32 },

    #[error("accessibility tree unavailable: {reason}")]
    TreeUnavailable { reason: String },

    #[error("clipboard access failed: {reason}")]
    Clipboard { reason: String },

    #[error("screen capture failed: {reason}")]
    Capture { reason: String },

    #[error("OCR engine {engine} failed: {reason}")]
    Ocr { engine: String, reason: String },

    #[error("OS call failed: {reason}")]
    Os { reason: String },

    #[error("program launch failed: {source}")]
    Launch {
        #[from]
        source: std::io::Error,
    },
}

/// Agent runtime failures outside the dispatcher
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("another agent already owns session {session}")]
    AlreadyRunning { session: String },

    #[error("connection to broker lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("registration rejected: {reason}")]
    RegistrationRejected { reason: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("websocket error: {reason}")]
    WebSocket { reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field} - {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
}

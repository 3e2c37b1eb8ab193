//! Wire protocol: JSON text frames and the uniform response envelope
//!
//! Every frame is a JSON object with a `type` field. The frame set is a
//! closed sum type; a frame whose `type` is unknown is a protocol violation
//! and terminates the connection. The response envelope is the single shape
//! every handler returns — failures are values, never exceptions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain_types::{CommandName, ConnectionId, CorrelationId};
use crate::error::{DispatchError, ProtocolError};

/// Advertised capability flags, treated as opaque tags by the broker
pub type CapabilitySet = BTreeMap<String, bool>;

/// Returns true when `caps` advertises `name` as enabled
#[must_use]
pub fn advertises(caps: &CapabilitySet, name: &str) -> bool {
    caps.get(name).copied().unwrap_or(false)
}

/// Connection role declared at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Agent,
    Manager,
    Monitor,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Agent => write!(f, "agent"),
            Role::Manager => write!(f, "manager"),
            Role::Monitor => write!(f, "monitor"),
        }
    }
}

/// Admin queries a manager may issue via the `request` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminRequest {
    ListClients,
}

/// Forward-ack status reported back to the issuing manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardStatus {
    Queued,
    NoSuchTarget,
}

/// The inner command object carried by `forward_command`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Wire tag; always `"command"`
    #[serde(rename = "type", default = "command_tag")]
    pub tag: String,
    pub command: CommandName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
}

fn command_tag() -> String {
    "command".to_string()
}

impl CommandSpec {
    /// Creates a command spec with optional parameters
    #[must_use]
    pub fn new(command: CommandName, params: Option<Value>) -> Self {
        Self {
            tag: command_tag(),
            command,
            params,
            command_id: None,
        }
    }

    /// Attaches a client-chosen command id
    #[must_use]
    pub fn with_command_id(mut self, command_id: impl Into<String>) -> Self {
        self.command_id = Some(command_id.into());
        self
    }
}

/// Snapshot of one live connection, as returned by `list_clients`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSummary {
    pub id: ConnectionId,
    pub role: Role,
    pub user_session: String,
    pub capabilities: CapabilitySet,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_start_time: Option<DateTime<Utc>>,
}

/// The closed set of wire frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Required first frame on every connection
    Register {
        role: Role,
        user_session: String,
        #[serde(default)]
        capabilities: CapabilitySet,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_start_time: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system_info: Option<Value>,
    },
    /// Broker reply to a successful register
    Welcome {
        client_id: ConnectionId,
        server_time: DateTime<Utc>,
    },
    /// Liveness signal; no reply is sent
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<DateTime<Utc>>,
    },
    /// Admin query from a manager
    Request { command: AdminRequest },
    /// Reply to `request: list_clients`
    ClientList { clients: Vec<ClientSummary> },
    /// Manager asks the broker to relay a command to an agent
    ForwardCommand {
        target_client: ConnectionId,
        command: CommandSpec,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    /// Immediate broker reply to `forward_command`
    ForwardAck {
        status: ForwardStatus,
        correlation_id: CorrelationId,
    },
    /// Command relayed to an agent, tagged with the broker's correlation id
    Command {
        command: CommandName,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command_id: Option<String>,
        correlation_id: CorrelationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    /// Handler result travelling agent → broker → manager
    CommandResult {
        correlation_id: CorrelationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_client: Option<ConnectionId>,
        result: ResponseEnvelope,
    },
}

impl Frame {
    /// Parses a text frame, distinguishing unknown frame kinds from malformed JSON
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::MalformedFrame` for invalid JSON or a missing
    /// `type` field, and `ProtocolError::UnknownFrameType` for a `type` value
    /// outside the frame set.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::MalformedFrame {
                reason: e.to_string(),
            })?;
        let frame_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MalformedFrame {
                reason: "missing type field".to_string(),
            })?
            .to_string();

        serde_json::from_value(value).map_err(|e| {
            if e.to_string().contains("unknown variant") {
                ProtocolError::UnknownFrameType { frame_type }
            } else {
                ProtocolError::MalformedFrame {
                    reason: e.to_string(),
                }
            }
        })
    }

    /// Serializes the frame to a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails (never for well-formed frames).
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Machine-readable error categories surfaced in `error.code`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Protocol,
    UnknownCommand,
    CapabilityMissing,
    InvalidParam,
    Timeout,
    TargetDead,
    InputNotApplied,
    OsError,
    Internal,
    SlowConsumer,
}

/// Structured error carried inside a failed envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Execution metadata attached to command results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResponseMetadata {
    pub command: String,
    /// Wall-clock handler time in seconds
    pub execution_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Which write path applied text, for send-text results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

/// The uniform shape every handler returns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResponseMetadata>,
}

impl ResponseEnvelope {
    /// Builds a successful envelope carrying `data`
    #[must_use]
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            timestamp: Utc::now(),
            error: None,
            data: Some(data),
            message: None,
            metadata: None,
        }
    }

    /// Builds a successful envelope with an operator-facing message
    #[must_use]
    pub fn success_with_message(data: Value, message: impl Into<String>) -> Self {
        let mut envelope = Self::success(data);
        envelope.message = Some(message.into());
        envelope
    }

    /// Builds a failed envelope
    #[must_use]
    pub fn failure(
        code: ErrorCode,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            timestamp: Utc::now(),
            error: Some(ErrorInfo {
                message: message.into(),
                error_type: error_type.into(),
                code: Some(code),
                details: None,
            }),
            data: None,
            message: None,
            metadata: None,
        }
    }

    /// Attaches structured detail to a failed envelope
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        if let Some(error) = self.error.as_mut() {
            error.details = Some(details);
        }
        self
    }

    /// Attaches execution metadata
    #[must_use]
    pub fn with_metadata(mut self, metadata: ResponseMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Normalizes a dispatcher-boundary error into an envelope
    #[must_use]
    pub fn from_dispatch_error(error: &DispatchError) -> Self {
        let code = match error {
            DispatchError::UnknownCommand(_) => ErrorCode::UnknownCommand,
            DispatchError::CapabilityMissing { .. } => ErrorCode::CapabilityMissing,
            DispatchError::InvalidParam { .. } => ErrorCode::InvalidParam,
            DispatchError::Timeout { .. } => ErrorCode::Timeout,
            DispatchError::HandlerPanic { .. } => ErrorCode::Internal,
        };
        let error_type = match error {
            DispatchError::UnknownCommand(_) => "UnknownCommand",
            DispatchError::CapabilityMissing { .. } => "CapabilityMissing",
            DispatchError::InvalidParam { .. } => "InvalidParam",
            DispatchError::Timeout { .. } => "Timeout",
            DispatchError::HandlerPanic { .. } => "HandlerPanic",
        };
        Self::failure(code, error_type, error.to_string())
    }

    /// Checks the envelope invariants
    ///
    /// `success=true` requires a null error and present data; `success=false`
    /// requires a non-empty error message.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated invariant.
    pub fn validate(&self) -> Result<(), String> {
        if self.success {
            if self.error.is_some() {
                return Err("successful envelope carries an error".to_string());
            }
            if self.data.is_none() {
                return Err("successful envelope has no data".to_string());
            }
        } else {
            match &self.error {
                None => return Err("failed envelope has no error".to_string()),
                Some(info) if info.message.is_empty() => {
                    return Err("failed envelope has an empty error message".to_string());
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

//! Wire message types.
//!
//! # Message Types
//!
//! - **Request**: client to host; names a `command` and carries `params`
//! - **Response**: host to client; carries the command's `result`
//! - **Error**: host to client; carries an [`ErrorRecord`]
//!
//! A response or error always echoes the `id` of the request it answers.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::protocol::version::PROTOCOL_VERSION;

/// Command arguments: an ordered mapping of name to JSON value.
pub type Params = Map<String, Value>;

/// The closed set of failure kinds that may appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Undecodable or structurally invalid frame.
    #[serde(rename = "MalformedMessageError")]
    MalformedMessage,
    /// Major/minor protocol version mismatch.
    #[serde(rename = "ProtocolVersionError")]
    ProtocolVersion,
    /// Socket closed or never established.
    #[serde(rename = "ConnectionClosedError")]
    ConnectionClosed,
    /// No matching response within the deadline.
    #[serde(rename = "TimeoutError")]
    Timeout,
    /// The command raised while executing on the host's main thread.
    #[serde(rename = "ExecutionError")]
    Execution,
    /// Command name not registered on the host.
    #[serde(rename = "UnknownCommandError")]
    UnknownCommand,
}

impl ErrorCode {
    /// Every error code, in taxonomy order.
    pub const ALL: [Self; 6] = [
        Self::MalformedMessage,
        Self::ProtocolVersion,
        Self::ConnectionClosed,
        Self::Timeout,
        Self::Execution,
        Self::UnknownCommand,
    ];

    /// Returns the wire name of this code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MalformedMessage => "MalformedMessageError",
            Self::ProtocolVersion => "ProtocolVersionError",
            Self::ConnectionClosed => "ConnectionClosedError",
            Self::Timeout => "TimeoutError",
            Self::Execution => "ExecutionError",
            Self::UnknownCommand => "UnknownCommandError",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error carried by an `error` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Failure kind.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional structured context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl ErrorRecord {
    /// Creates a record without detail.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    /// Attaches structured context.
    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Record for a request whose version the host cannot speak.
    #[must_use]
    pub fn version_mismatch(request_version: &str, host_version: &str) -> Self {
        Self::new(
            ErrorCode::ProtocolVersion,
            format!(
                "Protocol version mismatch: request uses {request_version}, host uses {host_version}"
            ),
        )
        .with_detail(json!({
            "request_version": request_version,
            "host_version": host_version,
        }))
    }

    /// Record for a command name the host does not know.
    #[must_use]
    pub fn unknown_command(command: &str, available: &[String]) -> Self {
        Self::new(
            ErrorCode::UnknownCommand,
            format!("Unknown command: {command:?}. Valid commands: {available:?}"),
        )
        .with_detail(json!({
            "command": command,
            "available_commands": available,
        }))
    }
}

/// The `type` discriminator of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Client to host.
    Request,
    /// Successful reply.
    Response,
    /// Failed reply.
    Error,
}

impl MessageType {
    /// Parses a wire `type` string.
    #[must_use]
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "request" => Some(Self::Request),
            "response" => Some(Self::Response),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Error => "error",
        })
    }
}

/// Type-specific payload of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Body {
    /// Invoke `command` with `params`.
    Request {
        /// Remote operation name.
        command: String,
        /// Arguments.
        #[serde(default)]
        params: Params,
    },
    /// The command's result.
    Response {
        /// JSON-compatible result value.
        result: Value,
    },
    /// The command failed.
    Error {
        /// What went wrong.
        error: ErrorRecord,
    },
}

/// The atomic wire unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Sender's protocol version.
    pub protocol_version: String,
    /// Correlation id, generated by the client per call.
    pub id: String,
    /// Request, response or error payload.
    #[serde(flatten)]
    pub body: Body,
}

impl Message {
    /// Creates a request with a fresh id.
    #[must_use]
    pub fn request(command: impl Into<String>, params: Params) -> Self {
        Self::request_with_id(Uuid::new_v4().to_string(), command, params)
    }

    /// Creates a request with a caller-chosen id.
    #[must_use]
    pub fn request_with_id(id: impl Into<String>, command: impl Into<String>, params: Params) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            id: id.into(),
            body: Body::Request {
                command: command.into(),
                params,
            },
        }
    }

    /// Creates a successful reply.
    #[must_use]
    pub fn response(id: impl Into<String>, result: Value) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            id: id.into(),
            body: Body::Response { result },
        }
    }

    /// Creates a failed reply.
    #[must_use]
    pub fn error(id: impl Into<String>, error: ErrorRecord) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            id: id.into(),
            body: Body::Error { error },
        }
    }

    /// Stamps a protocol version other than the build's own.
    #[must_use]
    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    /// Returns the `type` discriminator.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self.body {
            Body::Request { .. } => MessageType::Request,
            Body::Response { .. } => MessageType::Response,
            Body::Error { .. } => MessageType::Error,
        }
    }

    /// Returns the command name if this is a request.
    #[must_use]
    pub fn command(&self) -> Option<&str> {
        match &self.body {
            Body::Request { command, .. } => Some(command),
            _ => None,
        }
    }

    /// Returns the error record if this is an error reply.
    #[must_use]
    pub const fn error_record(&self) -> Option<&ErrorRecord> {
        match &self.body {
            Body::Error { error } => Some(error),
            _ => None,
        }
    }
}

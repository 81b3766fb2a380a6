//! Error types for blender-mcp-bridge.
//!
//! - [`ConfigError`]: configuration loading and validation.
//! - [`BridgeError`]: the closed taxonomy of failures a caller of the bridge
//!   can observe. Every variant maps onto exactly one wire [`ErrorCode`].
//! - [`CommandError`]: domain failures raised by host-side commands. These
//!   never cross the wire as-is; the dispatcher reports them as
//!   `ExecutionError` records.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;

use crate::protocol::{ErrorCode, ErrorRecord};

/// Errors that can occur during configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file not found.
    #[error("configuration file not found: {path}")]
    NotFound {
        /// Path where the configuration file was expected.
        path: PathBuf,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation failure.
        message: String,
    },
}

/// A typed failure surfaced to callers of the bridge.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// A frame could not be decoded, or was structurally invalid.
    #[error("malformed message: {message}")]
    MalformedMessage {
        /// What was wrong with the frame.
        message: String,
    },

    /// The two endpoints disagree on the protocol's major or minor version.
    #[error("protocol version mismatch: local {local}, remote {remote}")]
    ProtocolVersion {
        /// Version spoken by this side.
        local: String,
        /// Version spoken by the peer.
        remote: String,
    },

    /// The socket is closed, was never established, or was lost mid-call.
    #[error("connection closed: {message}")]
    ConnectionClosed {
        /// Actionable description of the failure.
        message: String,
    },

    /// No matching response arrived before the deadline.
    #[error("command '{command}' timed out after {:.1}s", .timeout.as_secs_f64())]
    Timeout {
        /// The command that was abandoned.
        command: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The command raised while executing on the host's main thread.
    #[error("execution failed: {message}")]
    Execution {
        /// Human-readable failure.
        message: String,
        /// Structured context from the host (command, kind, ...).
        detail: Option<Value>,
    },

    /// The host has no command registered under this name.
    #[error("unknown command: {command}")]
    UnknownCommand {
        /// The unrecognised command name.
        command: String,
    },
}

impl BridgeError {
    /// Returns the wire error code for this failure.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::MalformedMessage { .. } => ErrorCode::MalformedMessage,
            Self::ProtocolVersion { .. } => ErrorCode::ProtocolVersion,
            Self::ConnectionClosed { .. } => ErrorCode::ConnectionClosed,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Execution { .. } => ErrorCode::Execution,
            Self::UnknownCommand { .. } => ErrorCode::UnknownCommand,
        }
    }

    /// Returns `true` if the failure is at the connection level and the
    /// reconnection policy applies.
    #[must_use]
    pub const fn is_connection_level(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. })
    }

    /// Converts this error into a wire record.
    #[must_use]
    pub fn to_record(&self) -> ErrorRecord {
        let record = ErrorRecord::new(self.code(), self.to_string());
        match self {
            Self::MalformedMessage { .. } | Self::ConnectionClosed { .. } => record,
            Self::ProtocolVersion { local, remote } => ErrorRecord::version_mismatch(local, remote),
            Self::Timeout { command, timeout } => record.with_detail(json!({
                "command": command,
                "timeout_ms": u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })),
            Self::Execution { detail, .. } => match detail {
                Some(detail) => record.with_detail(detail.clone()),
                None => record,
            },
            Self::UnknownCommand { command } => record.with_detail(json!({ "command": command })),
        }
    }
}

fn detail_str(detail: Option<&Value>, key: &str) -> Option<String> {
    detail
        .and_then(|d| d.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
}

impl From<ErrorRecord> for BridgeError {
    /// Rebuilds a typed error from a record received over the wire.
    ///
    /// Records are read from the requesting side's point of view, so on a
    /// version mismatch `local` is the request's version and `remote` the
    /// host's.
    fn from(record: ErrorRecord) -> Self {
        let detail = record.detail.as_ref();
        match record.code {
            ErrorCode::MalformedMessage => Self::MalformedMessage {
                message: record.message,
            },
            ErrorCode::ProtocolVersion => Self::ProtocolVersion {
                local: detail_str(detail, "request_version").unwrap_or_else(|| "unknown".into()),
                remote: detail_str(detail, "host_version").unwrap_or_else(|| "unknown".into()),
            },
            ErrorCode::ConnectionClosed => Self::ConnectionClosed {
                message: record.message,
            },
            ErrorCode::Timeout => Self::Timeout {
                command: detail_str(detail, "command").unwrap_or_default(),
                timeout: detail
                    .and_then(|d| d.get("timeout_ms"))
                    .and_then(Value::as_u64)
                    .map(Duration::from_millis)
                    .unwrap_or_default(),
            },
            ErrorCode::Execution => Self::Execution {
                message: record.message,
                detail: record.detail,
            },
            ErrorCode::UnknownCommand => Self::UnknownCommand {
                command: detail_str(detail, "command").unwrap_or(record.message),
            },
        }
    }
}

/// A failure raised by a host-side command implementation.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The parameters were missing, of the wrong type, or out of range.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// A named host object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Any other failure.
    #[error("{0}")]
    Failed(String),
}

impl CommandError {
    /// Short machine-readable name for the `detail.kind` field.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidParams(_) => "invalid_params",
            Self::NotFound(_) => "not_found",
            Self::Failed(_) => "failed",
        }
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(error: serde_json::Error) -> Self {
        Self::InvalidParams(error.to_string())
    }
}

//! Newline-delimited JSON framing.
//!
//! - Messages are UTF-8 encoded JSON objects
//! - Messages are delimited by a single `\n`
//! - Messages must not contain embedded newlines
//!
//! Decoding checks structure before deserialising, so every failure is
//! reported as [`BridgeError::MalformedMessage`] with a reason that names the
//! offending field.

use serde_json::{Map, Value};

use crate::error::BridgeError;
use crate::protocol::message::{Message, MessageType};

fn malformed(message: impl Into<String>) -> BridgeError {
    BridgeError::MalformedMessage {
        message: message.into(),
    }
}

/// Encodes a message as one line of JSON terminated by `\n`.
///
/// # Errors
///
/// Returns `MalformedMessage` if the message cannot be serialised.
pub fn encode(message: &Message) -> Result<Vec<u8>, BridgeError> {
    let mut frame =
        serde_json::to_vec(message).map_err(|e| malformed(format!("cannot encode: {e}")))?;

    debug_assert!(
        !frame.contains(&b'\n'),
        "JSON message must not contain embedded newlines"
    );

    frame.push(b'\n');
    Ok(frame)
}

/// Strips a trailing `\n` or `\r\n` from a frame.
fn trim_frame(frame: &[u8]) -> &[u8] {
    let frame = frame.strip_suffix(b"\n").unwrap_or(frame);
    frame.strip_suffix(b"\r").unwrap_or(frame)
}

fn require_str<'a>(obj: &'a Map<String, Value>, field: &str) -> Result<&'a str, BridgeError> {
    match obj.get(field) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(malformed(format!("field '{field}' must be a string"))),
        None => Err(malformed(format!("missing required field: {field}"))),
    }
}

/// Decodes one frame into a message.
///
/// # Errors
///
/// Returns `MalformedMessage` if the frame is not UTF-8, not a JSON object,
/// lacks `protocol_version`, `id` or `type`, has an unknown `type`, or lacks
/// the fields its type requires.
pub fn decode(frame: &[u8]) -> Result<Message, BridgeError> {
    let text = std::str::from_utf8(trim_frame(frame))
        .map_err(|e| malformed(format!("frame is not valid UTF-8: {e}")))?;

    let value: Value =
        serde_json::from_str(text).map_err(|e| malformed(format!("invalid JSON: {e}")))?;

    let obj = value
        .as_object()
        .ok_or_else(|| malformed("frame is not a JSON object"))?;

    require_str(obj, "protocol_version")?;
    require_str(obj, "id")?;
    let ty = require_str(obj, "type")?;
    let ty = MessageType::from_wire(ty).ok_or_else(|| malformed(format!("unknown message type: {ty:?}")))?;

    match ty {
        MessageType::Request => {
            if require_str(obj, "command")?.is_empty() {
                return Err(malformed("field 'command' cannot be empty"));
            }
            if obj.get("params").is_some_and(|p| !p.is_object()) {
                return Err(malformed("field 'params' must be an object"));
            }
        }
        MessageType::Response => {
            if !obj.contains_key("result") {
                return Err(malformed("missing required field: result"));
            }
        }
        MessageType::Error => {
            if !obj.get("error").is_some_and(Value::is_object) {
                return Err(malformed("missing required field: error"));
            }
        }
    }

    serde_json::from_value(value).map_err(|e| malformed(format!("invalid {ty} message: {e}")))
}

/// Decodes a frame that must be a request.
///
/// # Errors
///
/// Returns `MalformedMessage` on any [`decode`] failure or if the frame is a
/// reply.
pub fn decode_request(frame: &[u8]) -> Result<Message, BridgeError> {
    let message = decode(frame)?;
    match message.message_type() {
        MessageType::Request => Ok(message),
        other => Err(malformed(format!("expected a request, got a {other}"))),
    }
}

/// Decodes a frame that must be a response or an error.
///
/// # Errors
///
/// Returns `MalformedMessage` on any [`decode`] failure or if the frame is a
/// request.
pub fn decode_reply(frame: &[u8]) -> Result<Message, BridgeError> {
    let message = decode(frame)?;
    match message.message_type() {
        MessageType::Request => Err(malformed("expected a response or error, got a request")),
        _ => Ok(message),
    }
}

/// Best-effort recovery of the `id` of a frame that failed to decode.
///
/// Used to correlate an error reply with an otherwise broken request.
#[must_use]
pub fn salvage_id(frame: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(trim_frame(frame)).ok()?;
    value.get("id")?.as_str().map(str::to_string)
}

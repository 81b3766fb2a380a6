//! Integration tests for the wire protocol.
//!
//! These tests pin the exact wire format through the public API: what a
//! non-Rust peer sends and expects back must keep decoding the same way.

use std::time::Duration;

use blender_mcp_bridge::error::BridgeError;
use blender_mcp_bridge::protocol::{
    compatible, decode, decode_reply, decode_request, encode, Body, ErrorCode, ErrorRecord,
    Message, MessageType, Params, PROTOCOL_VERSION,
};
use serde_json::json;

// =============================================================================
// Wire Format
// =============================================================================

#[test]
fn test_request_wire_format() {
    let mut params = Params::new();
    params.insert("name".into(), json!("Cube"));
    params.insert("location".into(), json!([0.0, 1.5, 2.0]));
    let message = Message::request_with_id("42", "create_object", params);

    let bytes = encode(&message).unwrap();
    assert_eq!(
        String::from_utf8(bytes).unwrap(),
        concat!(
            r#"{"protocol_version":"0.1.0","id":"42","type":"request","#,
            r#""command":"create_object","params":{"name":"Cube","location":[0.0,1.5,2.0]}}"#,
            "\n"
        )
    );
}

#[test]
fn test_decode_foreign_response() {
    let frame = br#"{"type": "response", "result": {"objects": ["Cube", "Light"]}, "id": "9", "protocol_version": "0.1.2"}
"#;
    let message = decode_reply(frame).unwrap();
    assert_eq!(message.id, "9");
    assert_eq!(message.protocol_version, "0.1.2");
    assert_eq!(message.message_type(), MessageType::Response);
    assert_eq!(
        message.body,
        Body::Response {
            result: json!({"objects": ["Cube", "Light"]})
        }
    );
}

#[test]
fn test_decode_foreign_error() {
    let frame = br#"{"protocol_version":"0.1.0","id":"3","type":"error","error":{"code":"ExecutionError","message":"boom","detail":{"kind":"failed"}}}"#;
    let message = decode(frame).unwrap();
    let record = message.error_record().unwrap();
    assert_eq!(record.code, ErrorCode::Execution);

    let err = BridgeError::from(record.clone());
    assert_eq!(
        err,
        BridgeError::Execution {
            message: "boom".to_string(),
            detail: Some(json!({"kind": "failed"})),
        }
    );
}

#[test]
fn test_request_without_params_gets_empty_params() {
    let frame = br#"{"protocol_version":"0.1.0","id":"1","type":"request","command":"ping"}"#;
    let message = decode_request(frame).unwrap();
    assert_eq!(message.command(), Some("ping"));
    let Body::Request { params, .. } = message.body else {
        panic!("expected request");
    };
    assert!(params.is_empty());
}

#[test]
fn test_direction_is_enforced() {
    let request = encode(&Message::request_with_id("1", "ping", Params::new())).unwrap();
    let response = encode(&Message::response("1", json!("pong"))).unwrap();

    assert!(matches!(
        decode_reply(&request),
        Err(BridgeError::MalformedMessage { .. })
    ));
    assert!(matches!(
        decode_request(&response),
        Err(BridgeError::MalformedMessage { .. })
    ));
}

#[test]
fn test_rejects_unknown_error_code() {
    let frame = br#"{"protocol_version":"0.1.0","id":"1","type":"error","error":{"code":"Oops","message":"?"}}"#;
    assert!(matches!(decode(frame), Err(BridgeError::MalformedMessage { .. })));
}

// =============================================================================
// Versions And Errors
// =============================================================================

#[test]
fn test_compatibility_rules() {
    assert!(compatible(PROTOCOL_VERSION, "0.1.7"));
    assert!(!compatible("0.2.0", "0.1.3"));
    assert!(!compatible("1.1.0", "2.1.0"));
    assert!(!compatible("0.1.0", "not-a-version"));
}

#[test]
fn test_version_error_names_both_sides() {
    let record = ErrorRecord::version_mismatch("0.2.0", "0.1.3");
    let err = BridgeError::from(record);
    let text = err.to_string();
    assert!(text.contains("0.2.0"));
    assert!(text.contains("0.1.3"));
}

#[test]
fn test_timeout_error_survives_the_wire() {
    let err = BridgeError::Timeout {
        command: "bake".to_string(),
        timeout: Duration::from_millis(1500),
    };
    let reply = Message::error("5", err.to_record());
    let decoded = decode_reply(&encode(&reply).unwrap()).unwrap();
    let record = decoded.error_record().unwrap().clone();
    assert_eq!(BridgeError::from(record), err);
}

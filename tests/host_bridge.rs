//! Integration tests for the host side.
//!
//! A raw socket client talks to a [`HostBridge`] driven by a stand-in main
//! thread, checking what goes over the wire.

mod common;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use blender_mcp_bridge::error::CommandError;
use blender_mcp_bridge::host::CommandResult;
use blender_mcp_bridge::protocol::{Params, PROTOCOL_VERSION};
use serde_json::{json, Value};

use common::{request_line, spawn_host, spawn_host_with_version, RawClient};

// =============================================================================
// Request / Response
// =============================================================================

#[test]
fn test_ping_round_trip() {
    let host = spawn_host(|_| {});
    let mut client = RawClient::connect(host.addr());

    let reply = client.exchange(
        r#"{"protocol_version":"0.1.0","id":"1","type":"request","command":"ping","params":{}}"#,
    );

    assert_eq!(reply["id"], "1");
    assert_eq!(reply["type"], "response");
    assert_eq!(reply["result"], "pong");
    assert_eq!(reply["protocol_version"], PROTOCOL_VERSION);

    let status = host.shutdown();
    assert_eq!(status.commands_executed, 1);
    assert_eq!(status.last_command.as_deref(), Some("ping"));
}

#[test]
fn test_get_version_lists_commands() {
    let host = spawn_host(|registry| {
        registry.register("scene_info", |_: &Params| -> CommandResult {
            Ok(json!({"objects": 3}))
        });
    });
    let mut client = RawClient::connect(host.addr());

    let reply = client.exchange(&request_line(PROTOCOL_VERSION, "v", "get_version", &json!({})));

    assert_eq!(reply["result"]["protocol_version"], PROTOCOL_VERSION);
    assert_eq!(
        reply["result"]["available_commands"],
        json!(["get_version", "ping", "scene_info"])
    );
}

#[test]
fn test_get_version_reports_host_version() {
    let host = spawn_host_with_version("0.1.3", |_| {});
    let mut client = RawClient::connect(host.addr());

    let reply = client.exchange(&request_line("0.1.0", "v", "get_version", &json!({})));

    assert_eq!(reply["protocol_version"], "0.1.3");
    assert_eq!(reply["result"]["protocol_version"], "0.1.3");
}

#[test]
fn test_commands_run_in_arrival_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let host = spawn_host(move |registry| {
        registry.register("record", move |params: &Params| -> CommandResult {
            log.lock().unwrap().push(params["n"].clone());
            Ok(params["n"].clone())
        });
    });
    let mut client = RawClient::connect(host.addr());

    // Pipelined: all requests are written before any reply is read.
    for n in 0..5 {
        client.send(&request_line(PROTOCOL_VERSION, &n.to_string(), "record", &json!({"n": n})));
    }
    for n in 0..5 {
        let reply = client.receive();
        assert_eq!(reply["id"], n.to_string());
        assert_eq!(reply["result"], n);
    }

    assert_eq!(*seen.lock().unwrap(), (0..5).map(Value::from).collect::<Vec<_>>());
}

#[test]
fn test_blank_lines_are_ignored() {
    let host = spawn_host(|_| {});
    let mut client = RawClient::connect(host.addr());

    client.send("");
    client.send("   ");
    let reply = client.exchange(&request_line(PROTOCOL_VERSION, "after-blank", "ping", &json!({})));

    assert_eq!(reply["id"], "after-blank");
    assert_eq!(reply["result"], "pong");
}

// =============================================================================
// Error Replies
// =============================================================================

#[test]
fn test_execution_error_keeps_host_serving() {
    let host = spawn_host(|registry| {
        registry
            .register("explode", |_: &Params| -> CommandResult {
                Err(CommandError::Failed("modifier stack is corrupt".into()))
            })
            .register("panic", |_: &Params| -> CommandResult {
                panic!("bpy context is missing");
            });
    });
    let mut client = RawClient::connect(host.addr());

    let reply = client.exchange(&request_line(PROTOCOL_VERSION, "e1", "explode", &json!({})));
    assert_eq!(reply["id"], "e1");
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["error"]["code"], "ExecutionError");
    assert!(reply["error"]["message"]
        .as_str()
        .unwrap()
        .contains("modifier stack is corrupt"));
    assert_eq!(reply["error"]["detail"]["kind"], "failed");
    assert_eq!(reply["error"]["detail"]["command"], "explode");

    let reply = client.exchange(&request_line(PROTOCOL_VERSION, "e2", "panic", &json!({})));
    assert_eq!(reply["error"]["code"], "ExecutionError");
    assert_eq!(reply["error"]["detail"]["kind"], "panic");

    let reply = client.exchange(&request_line(PROTOCOL_VERSION, "p", "ping", &json!({})));
    assert_eq!(reply["result"], "pong");
}

#[test]
fn test_unknown_command() {
    let host = spawn_host(|_| {});
    let mut client = RawClient::connect(host.addr());

    let reply = client.exchange(&request_line(PROTOCOL_VERSION, "u", "delete_everything", &json!({})));

    assert_eq!(reply["id"], "u");
    assert_eq!(reply["error"]["code"], "UnknownCommandError");
    assert_eq!(reply["error"]["detail"]["command"], "delete_everything");
}

#[test]
fn test_incompatible_version_is_not_executed() {
    let executed = Arc::new(Mutex::new(0_u32));
    let counter = Arc::clone(&executed);
    let host = spawn_host_with_version("0.1.3", move |registry| {
        registry.register("record", move |_: &Params| -> CommandResult {
            *counter.lock().unwrap() += 1;
            Ok(Value::Null)
        });
    });
    let mut client = RawClient::connect(host.addr());

    let reply = client.exchange(&request_line("0.2.0", "v1", "record", &json!({})));

    assert_eq!(reply["id"], "v1");
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["protocol_version"], "0.1.3");
    assert_eq!(reply["error"]["code"], "ProtocolVersionError");
    let message = reply["error"]["message"].as_str().unwrap();
    assert!(message.contains("0.2.0"));
    assert!(message.contains("0.1.3"));

    // Patch differences are compatible.
    let reply = client.exchange(&request_line("0.1.9", "v2", "ping", &json!({})));
    assert_eq!(reply["result"], "pong");

    let status = host.shutdown();
    assert_eq!(*executed.lock().unwrap(), 0);
    assert_eq!(status.commands_executed, 1);
}

#[test]
fn test_malformed_frames_get_error_replies() {
    let host = spawn_host(|_| {});
    let mut client = RawClient::connect(host.addr());

    let reply = client.exchange("this is not json");
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["error"]["code"], "MalformedMessageError");
    assert!(reply["id"].is_string());

    // The id is echoed when it can be recovered.
    let reply = client.exchange(r#"{"protocol_version":"0.1.0","id":"7","type":"request"}"#);
    assert_eq!(reply["id"], "7");
    assert_eq!(reply["error"]["code"], "MalformedMessageError");

    let reply = client.exchange(&request_line(PROTOCOL_VERSION, "ok", "ping", &json!({})));
    assert_eq!(reply["result"], "pong");
}

// =============================================================================
// Connection Handling
// =============================================================================

#[test]
fn test_second_client_is_refused() {
    let host = spawn_host(|_| {});
    let mut first = RawClient::connect(host.addr());
    let reply = first.exchange(&request_line(PROTOCOL_VERSION, "a", "ping", &json!({})));
    assert_eq!(reply["result"], "pong");

    let mut second = RawClient::connect(host.addr());
    assert!(second.is_closed());

    let reply = first.exchange(&request_line(PROTOCOL_VERSION, "b", "ping", &json!({})));
    assert_eq!(reply["result"], "pong");

    let status = host.shutdown();
    assert_eq!(status.connections_accepted, 1);
    assert!(status.connections_refused >= 1);
}

#[test]
fn test_new_client_accepted_after_disconnect() {
    let host = spawn_host(|_| {});

    let mut first = RawClient::connect(host.addr());
    first.exchange(&request_line(PROTOCOL_VERSION, "a", "ping", &json!({})));
    drop(first);

    let mut next = RawClient::connect(host.addr());
    let reply = next.exchange(&request_line(PROTOCOL_VERSION, "b", "ping", &json!({})));
    assert_eq!(reply["result"], "pong");

    let status = host.shutdown();
    assert_eq!(status.connections_accepted, 2);
    assert_eq!(status.connections_refused, 0);
}

#[test]
fn test_client_gone_during_slow_command_frees_slot() {
    let host = spawn_host(|registry| {
        registry.register("bake", |_: &Params| -> CommandResult {
            thread::sleep(Duration::from_millis(1500));
            Ok(json!("baked"))
        });
    });

    let mut first = RawClient::connect(host.addr());
    first.send(&request_line(PROTOCOL_VERSION, "a", "bake", &json!({})));
    thread::sleep(Duration::from_millis(100));
    drop(first);

    // Accepted although "bake" is still running on the main thread.
    let mut next = RawClient::connect(host.addr());
    let reply = next.exchange(&request_line(PROTOCOL_VERSION, "b", "ping", &json!({})));
    assert_eq!(reply["id"], "b");
    assert_eq!(reply["result"], "pong");

    let status = host.shutdown();
    assert_eq!(status.connections_accepted, 2);
    assert_eq!(status.connections_refused, 0);
    assert_eq!(status.commands_executed, 2);
}

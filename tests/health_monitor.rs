//! Integration tests for the health monitor.

mod common;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use blender_mcp_bridge::client::{
    Backoff, BridgeClient, ConnectionManager, ConnectionSettings, ConnectionState, HealthEventKind,
    HealthMonitor, HealthSettings,
};
use blender_mcp_bridge::config::Verbosity;
use blender_mcp_bridge::protocol::Params;

use common::spawn_host;

fn quick_connection() -> ConnectionSettings {
    ConnectionSettings {
        connect_timeout: Duration::from_secs(1),
        call_timeout: Duration::from_secs(5),
        backoff: Backoff::new(Duration::from_millis(5), Duration::from_millis(20), 3),
    }
}

fn quick_health(interval: Duration) -> HealthSettings {
    HealthSettings {
        interval,
        ping_timeout: Duration::from_secs(2),
        ..HealthSettings::default()
    }
}

/// A port with nothing listening on it.
fn closed_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    listener.local_addr().unwrap()
}

fn reconnect_events(monitor: &HealthMonitor) -> Vec<HealthEventKind> {
    monitor
        .export_report()
        .history
        .into_iter()
        .map(|event| event.kind)
        .filter(|kind| matches!(kind, HealthEventKind::ReconnectAttempt { .. }))
        .collect()
}

// =============================================================================
// Manual Checks
// =============================================================================

#[tokio::test]
async fn test_check_counts_successful_ping() {
    let host = spawn_host(|_| {});
    let connection = Arc::new(ConnectionManager::new(host.addr(), quick_connection()));
    connection.connect().await.unwrap();
    let monitor = HealthMonitor::new(Arc::clone(&connection), quick_health(Duration::from_secs(30)));

    let before = monitor.get_status();
    let after = monitor.check().await;

    assert_eq!(after.total_pings, before.total_pings + 1);
    assert_eq!(after.successful_pings, 1);
    assert_eq!(after.consecutive_failures, 0);
    assert!(after.healthy);
    assert_eq!(after.latency_history.len(), 1);
    assert!(after.last_success_ago.is_some());

    let report = monitor.export_report();
    assert!(matches!(report.history[0].kind, HealthEventKind::Ok { .. }));
}

#[tokio::test]
async fn test_threshold_triggers_one_reconnect() {
    let connection = Arc::new(ConnectionManager::new(closed_port(), quick_connection()));
    let monitor = HealthMonitor::new(Arc::clone(&connection), quick_health(Duration::from_secs(30)));

    for _ in 0..2 {
        monitor.check().await;
    }
    assert!(reconnect_events(&monitor).is_empty());

    let status = monitor.check().await;
    assert_eq!(status.consecutive_failures, 3);
    assert_eq!(status.reconnect_attempts, 1);
    assert!(!status.healthy);
    assert_eq!(connection.state(), ConnectionState::Failed);

    for _ in 0..4 {
        monitor.check().await;
    }
    let status = monitor.get_status();
    assert_eq!(status.consecutive_failures, 7);
    assert_eq!(status.reconnect_attempts, 1);

    let events = reconnect_events(&monitor);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0],
        HealthEventKind::ReconnectAttempt {
            success: false,
            attempt_number: 1,
            ..
        }
    ));
}

#[tokio::test]
async fn test_reconnect_restores_health() {
    let host = spawn_host(|_| {});
    let connection = Arc::new(ConnectionManager::new(host.addr(), quick_connection()));
    let monitor = HealthMonitor::new(Arc::clone(&connection), quick_health(Duration::from_secs(30)));

    // Never connected: each check is a "not_connected" failure until the
    // threshold makes the monitor reconnect.
    for _ in 0..3 {
        monitor.check().await;
    }
    let status = monitor.get_status();
    assert_eq!(status.reconnect_attempts, 1);
    assert_eq!(status.consecutive_failures, 0);
    assert!(connection.state().is_usable());

    let status = monitor.check().await;
    assert!(status.healthy);
    assert_eq!(status.successful_pings, 1);
    assert_eq!(status.total_pings, 4);
}

// =============================================================================
// Background Task
// =============================================================================

#[tokio::test]
async fn test_background_pings() {
    let host = spawn_host(|_| {});
    let connection = Arc::new(ConnectionManager::new(host.addr(), quick_connection()));
    connection.connect().await.unwrap();
    let monitor = HealthMonitor::new(Arc::clone(&connection), quick_health(Duration::from_millis(30)));

    assert!(monitor.start());
    assert!(monitor.start(), "start is idempotent");
    assert!(monitor.is_running());

    tokio::time::sleep(Duration::from_millis(400)).await;
    monitor.stop();
    assert!(!monitor.is_running());

    let status = monitor.get_status();
    assert!(status.total_pings >= 2, "{status:?}");
    assert_eq!(status.consecutive_failures, 0);
    assert!(status.healthy);
}

#[test]
fn test_start_outside_runtime_is_refused() {
    let connection = Arc::new(ConnectionManager::new(closed_port(), quick_connection()));
    let monitor = HealthMonitor::new(connection, HealthSettings::default());
    assert!(!monitor.start());
    assert!(!monitor.is_running());
}

// =============================================================================
// Client Facade
// =============================================================================

#[tokio::test]
async fn test_client_logs_connection_loss() {
    let host = spawn_host(|_| {});
    let manager = ConnectionManager::new(host.addr(), quick_connection());
    let client =
        BridgeClient::from_connection(manager, quick_health(Duration::from_secs(30)), Verbosity::Lean);

    client.call("ping", Params::new(), None).await.unwrap();
    drop(host);

    let err = client.call("ping", Params::new(), None).await.unwrap_err();
    assert!(err.is_connection_level(), "{err:?}");

    let report = client.export_report();
    assert!(report
        .history
        .iter()
        .any(|event| matches!(event.kind, HealthEventKind::ConnectionLost { .. })));
    assert_eq!(client.performance_report().total_errors, 1);

    client.shutdown().await;
}

#[tokio::test]
async fn test_client_reconnect_is_recorded() {
    let host = spawn_host(|_| {});
    let manager = ConnectionManager::new(host.addr(), quick_connection());
    let client =
        BridgeClient::from_connection(manager, quick_health(Duration::from_secs(30)), Verbosity::Lean);

    client.reconnect().await.unwrap();
    let status = client.status();
    assert!(status.connection.state.is_usable());
    assert_eq!(status.health.reconnect_attempts, 1);

    client.shutdown().await;
}

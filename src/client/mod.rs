//! Automation-side client.
//!
//! [`BridgeClient`] is the one object a tool layer holds: it owns the
//! [`ConnectionManager`], the [`HealthMonitor`] pinging through it and the
//! [`OperationStats`] sink timing every call. It connects lazily on the
//! first call and is torn down with [`BridgeClient::shutdown`].
//!
//! ```no_run
//! # async fn demo() -> Result<(), blender_mcp_bridge::error::BridgeError> {
//! use blender_mcp_bridge::client::BridgeClient;
//! use blender_mcp_bridge::config::Config;
//! use blender_mcp_bridge::protocol::Params;
//!
//! let client = BridgeClient::new(&Config::default());
//! let version = client.call("get_version", Params::new(), None).await?;
//! println!("{version}");
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod connection;
pub mod health;

pub use backoff::{Backoff, INITIAL_BACKOFF, MAX_ATTEMPTS, MAX_BACKOFF};
pub use connection::{
    ConnectionInfo, ConnectionManager, ConnectionSettings, ConnectionState, CONNECT_TIMEOUT,
    DEFAULT_CALL_TIMEOUT,
};
pub use health::{
    HealthEvent, HealthEventKind, HealthMonitor, HealthRecord, HealthReport, HealthSettings,
    HealthSnapshot,
};

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::config::{Config, Verbosity};
use crate::error::BridgeError;
use crate::instrument::{self, OperationStats, PerformanceReport};
use crate::protocol::Params;

/// Connection description plus health counters.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    /// Connection state and addressing.
    pub connection: ConnectionInfo,
    /// Health monitor counters.
    pub health: HealthSnapshot,
}

/// Long-lived handle to one host.
#[derive(Debug)]
pub struct BridgeClient {
    connection: Arc<ConnectionManager>,
    monitor: HealthMonitor,
    stats: Arc<OperationStats>,
    verbosity: Verbosity,
}

impl BridgeClient {
    /// Creates a client for the configured host with default timeouts.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self::with_settings(
            config,
            ConnectionSettings::default(),
            HealthSettings::default(),
        )
    }

    /// Creates a client with explicit connection and monitor tuning.
    #[must_use]
    pub fn with_settings(
        config: &Config,
        connection: ConnectionSettings,
        health: HealthSettings,
    ) -> Self {
        Self::from_connection(
            ConnectionManager::new(config.socket_addr(), connection),
            health,
            config.logging.mode,
        )
    }

    /// Wraps an already configured connection manager.
    #[must_use]
    pub fn from_connection(
        connection: ConnectionManager,
        health: HealthSettings,
        verbosity: Verbosity,
    ) -> Self {
        let connection = Arc::new(connection);
        Self {
            monitor: HealthMonitor::new(Arc::clone(&connection), health),
            connection,
            stats: Arc::new(OperationStats::new()),
            verbosity,
        }
    }

    /// Sends `command` to the host and returns its result.
    ///
    /// `timeout` defaults to the connection's call timeout. The first call
    /// also starts the health monitor.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::call`].
    pub async fn call(
        &self,
        command: &str,
        params: Params,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        self.monitor.start();
        let timeout = timeout.unwrap_or(self.connection.settings().call_timeout);

        let logged = params.clone();
        let started = Instant::now();
        let outcome = self.connection.call(command, params, timeout).await;
        instrument::observe(
            command,
            self.verbosity,
            &logged,
            outcome.as_ref(),
            started.elapsed(),
            &self.stats,
        );

        if let Err(e @ BridgeError::ConnectionClosed { .. }) = &outcome {
            if self.connection.state() == ConnectionState::Reconnecting {
                self.monitor.record_connection_lost(e.to_string());
            }
        }
        outcome
    }

    /// Connection description and health counters. Never touches the
    /// network.
    #[must_use]
    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            connection: self.connection.info(),
            health: self.monitor.get_status(),
        }
    }

    /// Runs one health check now.
    pub async fn check_health(&self) -> HealthSnapshot {
        self.monitor.check().await
    }

    /// Drops the socket and reconnects with backoff. Also clears
    /// [`ConnectionState::Failed`].
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` if every attempt fails.
    pub async fn reconnect(&self) -> Result<(), BridgeError> {
        let outcome = self.connection.reconnect().await;
        self.monitor
            .record_reconnect_attempt(outcome.as_ref().map(|_| ()).map_err(ToString::to_string));
        outcome
    }

    /// Health counters plus recent events.
    #[must_use]
    pub fn export_report(&self) -> HealthReport {
        self.monitor.export_report()
    }

    /// Per-command timings of calls made through this client.
    #[must_use]
    pub fn performance_report(&self) -> PerformanceReport {
        self.stats.report()
    }

    /// The underlying connection.
    #[must_use]
    pub const fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// The health monitor.
    #[must_use]
    pub const fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    /// Stops the health monitor and closes the connection.
    pub async fn shutdown(&self) {
        self.monitor.stop();
        self.connection.disconnect().await;
        info!("Bridge client shut down");
    }
}

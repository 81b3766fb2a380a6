//! Host-side lifecycle.
//!
//! [`HostBridge`] owns the dispatcher and the socket server. The host wires
//! [`HostBridge::tick`] into its timer mechanism: each call executes at most
//! one queued command and returns the delay until the next call, or `None`
//! once the bridge is stopped and the timer should unregister.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::host::dispatcher::{Dispatcher, Submitter};
use crate::host::registry::CommandRegistry;
use crate::host::server::HostServer;
use crate::protocol::PROTOCOL_VERSION;

/// Interval between ticks while the bridge is running.
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Coarse lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeStatus {
    /// Not listening.
    Stopped,
    /// Listening for a client.
    Listening,
    /// The last start attempt failed.
    Error,
}

/// Point-in-time view of the host side, safe to send across threads.
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    /// Lifecycle state.
    pub status: BridgeStatus,
    /// Bound address while listening.
    pub address: Option<SocketAddr>,
    /// Protocol version requests must be compatible with.
    pub protocol_version: String,
    /// Whether a client is connected.
    pub client_connected: bool,
    /// Connections accepted since the last start.
    pub connections_accepted: u64,
    /// Connections refused since the last start.
    pub connections_refused: u64,
    /// Commands executed since creation.
    pub commands_executed: u64,
    /// Name of the most recent command.
    pub last_command: Option<String>,
    /// When the most recent command was dispatched.
    pub last_command_at: Option<DateTime<Local>>,
    /// Why the last start attempt failed.
    pub last_error: Option<String>,
}

/// Dispatcher plus server, driven by the host's main thread.
#[derive(Debug)]
pub struct HostBridge {
    dispatcher: Dispatcher,
    submitter: Submitter,
    server: Option<HostServer>,
    protocol_version: String,
    last_error: Option<String>,
}

impl HostBridge {
    /// Creates a stopped bridge over `registry`.
    #[must_use]
    pub fn new(registry: CommandRegistry) -> Self {
        let (dispatcher, submitter) = Dispatcher::new(registry);
        Self {
            dispatcher,
            submitter,
            server: None,
            protocol_version: PROTOCOL_VERSION.to_string(),
            last_error: None,
        }
    }

    /// Speaks `version` instead of the build's own protocol version.
    #[must_use]
    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        let version = version.into();
        self.dispatcher.set_protocol_version(version.clone());
        self.protocol_version = version;
        self
    }

    /// Starts listening on `127.0.0.1:port`.
    ///
    /// Calling this while already running returns the current address.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be started; the status becomes
    /// [`BridgeStatus::Error`].
    pub fn start(&mut self, port: u16) -> io::Result<SocketAddr> {
        if let Some(server) = &self.server {
            warn!(addr = %server.local_addr(), "Bridge already running");
            return Ok(server.local_addr());
        }

        match HostServer::start(port, self.submitter.clone(), self.protocol_version.clone()) {
            Ok(server) => {
                let addr = server.local_addr();
                self.server = Some(server);
                self.last_error = None;
                info!(%addr, protocol_version = %self.protocol_version, "Bridge started");
                Ok(addr)
            }
            Err(e) => {
                error!(port, error = %e, "Failed to start bridge");
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Stops the server and answers any queued commands with
    /// `ConnectionClosedError`. Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut server) = self.server.take() {
            server.stop();
            self.dispatcher.cancel_pending("host bridge stopped");
            info!("Bridge stopped");
        }
    }

    /// Runs one frame of the bridge on the calling (main) thread.
    ///
    /// Returns the delay until the next tick, or `None` when stopped.
    pub fn tick(&mut self) -> Option<Duration> {
        self.server.as_ref()?;
        self.dispatcher.drain_one();
        Some(TICK_INTERVAL)
    }

    /// Returns `true` while listening.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.server.is_some()
    }

    /// The dispatcher's command registry.
    #[must_use]
    pub const fn registry(&self) -> &CommandRegistry {
        self.dispatcher.registry()
    }

    /// Snapshot of the host side.
    #[must_use]
    pub fn status(&self) -> HostStatus {
        let status = match (&self.server, &self.last_error) {
            (Some(_), _) => BridgeStatus::Listening,
            (None, Some(_)) => BridgeStatus::Error,
            (None, None) => BridgeStatus::Stopped,
        };
        let last = self.dispatcher.last_command();

        HostStatus {
            status,
            address: self.server.as_ref().map(HostServer::local_addr),
            protocol_version: self.protocol_version.clone(),
            client_connected: self.server.as_ref().is_some_and(HostServer::client_connected),
            connections_accepted: self.server.as_ref().map_or(0, HostServer::connections_accepted),
            connections_refused: self.server.as_ref().map_or(0, HostServer::connections_refused),
            commands_executed: self.dispatcher.executed(),
            last_command: last.map(|(name, _)| name.to_string()),
            last_command_at: last.map(|(_, at)| at),
            last_error: self.last_error.clone(),
        }
    }
}

impl Drop for HostBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

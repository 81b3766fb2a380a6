//! Outbound connection to the host.
//!
//! # State machine
//!
//! ```text
//!  Disconnected ──connect──▶ Connecting ──ok──▶ Handshaking ──compatible reply──▶ Ready
//!       ▲                        │                   │                              │
//!       └────────fail────────────┘            incompatible                     I/O error
//!                                                    ▼                              ▼
//!                                                 Failed ◀──attempts exhausted── Reconnecting
//!                                                    │
//!                                               reconnect()
//! ```
//!
//! One call is on the wire at a time. Callers queue on a FIFO guard; the
//! reply deadline is measured from the moment the request is sent, so time
//! spent waiting for the guard does not count against it.
//!
//! The host closes a connection it cannot serve (another client holds its
//! single slot) without writing anything. A new socket that is closed before
//! its first reply therefore counts as a failed connect attempt, and the
//! request is sent again on the next one.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::futures::Notified;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::backoff::Backoff;
use crate::error::BridgeError;
use crate::protocol::{self, Body, Message, Params, PROTOCOL_VERSION};

/// Bound on a single TCP connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Reply deadline used when the caller does not choose one.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle of the outbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No socket.
    Disconnected,
    /// TCP connect in progress.
    Connecting,
    /// Socket open; no compatible reply seen yet.
    Handshaking,
    /// At least one compatible reply received.
    Ready,
    /// Socket lost; the next call reconnects with backoff.
    Reconnecting,
    /// Reconnection gave up or the host is incompatible. Only
    /// [`ConnectionManager::reconnect`] leaves this state.
    Failed,
}

impl ConnectionState {
    /// Returns `true` if a request can be sent without connecting first.
    #[must_use]
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Handshaking | Self::Ready)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        })
    }
}

/// Timeouts and reconnection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Bound on one TCP connect attempt.
    pub connect_timeout: Duration,
    /// Default reply deadline.
    pub call_timeout: Duration,
    /// Reconnection policy.
    pub backoff: Backoff,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            backoff: Backoff::default(),
        }
    }
}

/// Read-only description of the connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Current state.
    pub state: ConnectionState,
    /// Host address.
    pub host: IpAddr,
    /// Host port.
    pub port: u16,
    /// Protocol version this client speaks.
    pub protocol_version: String,
    /// Protocol version of the host, once a reply has been seen.
    pub remote_protocol_version: Option<String>,
    /// Successful TCP connects so far.
    pub connection_count: u64,
    /// Seconds since the current socket was opened.
    pub uptime_secs: Option<f64>,
    /// Most recent connection-level failure.
    pub last_error: Option<String>,
}

/// A request on the wire awaiting its reply.
#[derive(Debug)]
struct PendingCall {
    id: String,
    command: String,
    sent_at: Instant,
    deadline: Instant,
}

/// Line-framed socket halves.
#[derive(Debug)]
struct Transport {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Survives cancelled reads so a partly received line is not lost.
    buffer: Vec<u8>,
}

impl Transport {
    fn new(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer: write,
            buffer: Vec::new(),
        }
    }

    async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await
    }

    /// Reads the next complete line. `None` on EOF.
    async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if self.reader.read_until(b'\n', &mut self.buffer).await? == 0 {
                return Ok(None);
            }
            if self.buffer.ends_with(b"\n") {
                return Ok(Some(std::mem::take(&mut self.buffer)));
            }
        }
    }
}

/// Reads until the reply to `pending` arrives.
///
/// The outer error is an I/O failure; the inner one a reply with the right
/// id that could not be decoded.
async fn exchange(
    transport: &mut Transport,
    frame: &[u8],
    pending: &PendingCall,
) -> io::Result<Result<Message, BridgeError>> {
    transport.send(frame).await?;

    loop {
        let Some(line) = transport.read_frame().await? else {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "host closed the connection",
            ));
        };

        match protocol::decode_reply(&line) {
            Ok(reply) if reply.id == pending.id => return Ok(Ok(reply)),
            Ok(reply) => {
                warn!(
                    id = %reply.id,
                    expected = %pending.id,
                    "Dropping reply for an abandoned call"
                );
            }
            Err(e) if protocol::salvage_id(&line).as_deref() == Some(pending.id.as_str()) => {
                return Ok(Err(e));
            }
            Err(e) => warn!(error = %e, "Dropping undecodable frame"),
        }
    }
}

enum Outcome {
    Reply(Result<Message, BridgeError>),
    Io(io::Error),
    TimedOut,
    Cancelled,
}

/// Runs `future` unless the connection is closed by the caller first.
async fn unless_cancelled<F: Future>(
    future: F,
    cancelled: Pin<&mut Notified<'_>>,
) -> Option<F::Output> {
    tokio::select! {
        output = future => Some(output),
        () = cancelled => None,
    }
}

/// I/O errors that mean the peer closed the socket.
fn is_hangup(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

fn abandoned(what: &str) -> BridgeError {
    BridgeError::ConnectionClosed {
        message: format!("'{what}' abandoned: connection closed by caller"),
    }
}

#[derive(Debug, Default)]
struct Session {
    transport: Option<Transport>,
}

#[derive(Debug, Default)]
struct Stats {
    connected_at: Option<Instant>,
    remote_version: Option<String>,
    connection_count: u64,
    last_error: Option<String>,
}

/// Owns the outbound socket and serialises calls over it.
#[derive(Debug)]
pub struct ConnectionManager {
    addr: SocketAddr,
    settings: ConnectionSettings,
    protocol_version: String,
    /// FIFO call guard; holding it means owning the wire.
    session: tokio::sync::Mutex<Session>,
    state: watch::Sender<ConnectionState>,
    stats: Mutex<Stats>,
    /// Aborts the in-flight call on disconnect or explicit reconnect.
    cancel: Notify,
}

impl ConnectionManager {
    /// Creates a disconnected manager for `addr`. No I/O happens until the
    /// first call.
    #[must_use]
    pub fn new(addr: SocketAddr, settings: ConnectionSettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            addr,
            settings,
            protocol_version: PROTOCOL_VERSION.to_string(),
            session: tokio::sync::Mutex::new(Session::default()),
            state,
            stats: Mutex::new(Stats::default()),
            cancel: Notify::new(),
        }
    }

    /// Speaks `version` instead of the build's own protocol version.
    #[must_use]
    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    /// The host address.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Timeouts and reconnection policy.
    #[must_use]
    pub const fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Describes the connection without touching the network.
    #[must_use]
    pub fn info(&self) -> ConnectionInfo {
        let stats = self.stats();
        ConnectionInfo {
            state: self.state(),
            host: self.addr.ip(),
            port: self.addr.port(),
            protocol_version: self.protocol_version.clone(),
            remote_protocol_version: stats.remote_version.clone(),
            connection_count: stats.connection_count,
            uptime_secs: stats.connected_at.map(|at| at.elapsed().as_secs_f64()),
            last_error: stats.last_error.clone(),
        }
    }

    /// Opens the socket if it is not already open.
    ///
    /// Makes a single attempt bounded by the connect timeout. Sends nothing:
    /// the version handshake happens on the first reply.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` naming the address if the connect fails.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        let mut session = self.session.lock().await;
        if session.transport.is_some() && self.state().is_usable() {
            return Ok(());
        }
        let mut cancelled = self.armed_cancel();
        self.connect_once(&mut session, cancelled.as_mut()).await
    }

    /// Closes the socket. A call in flight, including one waiting out a
    /// reconnection backoff, fails with `ConnectionClosed`.
    pub async fn disconnect(&self) {
        self.cancel.notify_waiters();
        let mut session = self.session.lock().await;
        if session.transport.take().is_some() {
            info!(addr = %self.addr, "Disconnected from host");
        }
        self.stats().connected_at = None;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Caller-initiated reset: drops the socket and runs a full reconnection
    /// cycle. The only way out of [`ConnectionState::Failed`].
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` if every attempt fails.
    pub async fn reconnect(&self) -> Result<(), BridgeError> {
        self.cancel.notify_waiters();
        let mut session = self.session.lock().await;
        let mut cancelled = self.armed_cancel();
        session.transport = None;
        self.set_state(ConnectionState::Reconnecting);
        self.reconnect_with_backoff(&mut session, cancelled.as_mut()).await
    }

    /// Monitor-initiated reconnection. Refuses to leave
    /// [`ConnectionState::Failed`].
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` if the connection is failed or every
    /// attempt fails.
    pub async fn recover(&self) -> Result<(), BridgeError> {
        let mut session = self.session.lock().await;
        if self.state() == ConnectionState::Failed {
            return Err(self.failed_error());
        }
        let mut cancelled = self.armed_cancel();
        session.transport = None;
        self.set_state(ConnectionState::Reconnecting);
        self.reconnect_with_backoff(&mut session, cancelled.as_mut()).await
    }

    /// Sends `command` and waits up to `timeout` for its reply.
    ///
    /// Connects first if needed; after a lost socket, reconnects with
    /// backoff. If a new socket is closed before its first reply, the request
    /// is sent again on a fresh one, within the same attempt budget.
    ///
    /// # Errors
    ///
    /// - `ConnectionClosed`: no socket could be opened, or it was lost
    ///   during the call
    /// - `ProtocolVersion`: the host speaks an incompatible version; the
    ///   connection becomes [`ConnectionState::Failed`]
    /// - `Timeout`: no reply before the deadline; the connection stays open
    /// - `MalformedMessage`, `Execution`, `UnknownCommand`: reported by or
    ///   about the reply
    pub async fn call(
        &self,
        command: &str,
        params: Params,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        self.call_with_latency(command, params, timeout)
            .await
            .map(|(result, _)| result)
    }

    /// Calls the host's `ping` command and returns the round-trip time.
    ///
    /// # Errors
    ///
    /// As [`call`](Self::call).
    pub async fn ping(&self, timeout: Duration) -> Result<Duration, BridgeError> {
        self.call_with_latency("ping", Params::new(), timeout)
            .await
            .map(|(_, latency)| latency)
    }

    async fn call_with_latency(
        &self,
        command: &str,
        params: Params,
        timeout: Duration,
    ) -> Result<(Value, Duration), BridgeError> {
        let mut session = self.session.lock().await;
        let mut cancelled = self.armed_cancel();

        let request = Message::request(command, params)
            .with_protocol_version(self.protocol_version.clone());
        let frame = protocol::encode(&request)?;
        let backoff = self.settings.backoff;
        let mut unanswered = 0;

        loop {
            self.ensure_connected(&mut session, cancelled.as_mut()).await?;
            let fresh = self.state() == ConnectionState::Handshaking;

            let Some(transport) = session.transport.as_mut() else {
                return Err(BridgeError::ConnectionClosed {
                    message: format!("no connection to {}", self.addr),
                });
            };

            let sent_at = Instant::now();
            let pending = PendingCall {
                id: request.id.clone(),
                command: command.to_string(),
                sent_at,
                deadline: sent_at + timeout,
            };
            debug!(id = %pending.id, command, "Sending request");

            let outcome = tokio::select! {
                result = exchange(transport, &frame, &pending) => match result {
                    Ok(reply) => Outcome::Reply(reply),
                    Err(e) => Outcome::Io(e),
                },
                () = tokio::time::sleep_until(pending.deadline) => Outcome::TimedOut,
                () = cancelled.as_mut() => Outcome::Cancelled,
            };

            match outcome {
                Outcome::Io(e) if fresh && is_hangup(&e) => {
                    unanswered += 1;
                    let reason = self.discard_unanswered(&mut session, &e);
                    if unanswered >= backoff.max_attempts() {
                        return Err(self.give_up(unanswered, &reason));
                    }
                    let delay = backoff.delay(unanswered - 1);
                    let slept =
                        unless_cancelled(tokio::time::sleep(delay), cancelled.as_mut()).await;
                    if slept.is_none() {
                        return Err(abandoned(command));
                    }
                }
                outcome => return self.settle(&mut session, outcome, pending, timeout),
            }
        }
    }

    /// Turns the outcome of one exchange into the call's result.
    fn settle(
        &self,
        session: &mut Session,
        outcome: Outcome,
        pending: PendingCall,
        timeout: Duration,
    ) -> Result<(Value, Duration), BridgeError> {
        match outcome {
            Outcome::Reply(Ok(reply)) => {
                let latency = pending.sent_at.elapsed();
                self.accept_reply(session, reply)
                    .map(|result| (result, latency))
            }
            Outcome::Reply(Err(e)) => Err(e),
            Outcome::Io(e) => {
                session.transport = None;
                self.stats().connected_at = None;
                self.set_state(ConnectionState::Reconnecting);
                let message = format!(
                    "lost connection to {} during '{}': {e}",
                    self.addr, pending.command
                );
                warn!(addr = %self.addr, error = %e, "Connection lost");
                self.record_error(&message);
                Err(BridgeError::ConnectionClosed { message })
            }
            Outcome::TimedOut => {
                warn!(id = %pending.id, command = %pending.command, ?timeout, "Call timed out");
                Err(BridgeError::Timeout {
                    command: pending.command,
                    timeout,
                })
            }
            Outcome::Cancelled => {
                session.transport = None;
                Err(abandoned(&pending.command))
            }
        }
    }

    /// Drops a new socket the host closed before its first reply. Returns
    /// the reason, for the eventual error.
    fn discard_unanswered(&self, session: &mut Session, e: &io::Error) -> String {
        session.transport = None;
        self.stats().connected_at = None;
        self.set_state(ConnectionState::Reconnecting);
        let message = format!(
            "{} closed the connection before replying ({e}); is another client connected?",
            self.addr
        );
        warn!(addr = %self.addr, error = %e, "Host closed new connection before replying");
        self.record_error(&message);
        message
    }

    /// Applies the handshake rules to a matching reply and unwraps it.
    fn accept_reply(&self, session: &mut Session, reply: Message) -> Result<Value, BridgeError> {
        if !protocol::compatible(&self.protocol_version, &reply.protocol_version) {
            warn!(
                local = %self.protocol_version,
                remote = %reply.protocol_version,
                "Incompatible host protocol version"
            );
            session.transport = None;
            let error = BridgeError::ProtocolVersion {
                local: self.protocol_version.clone(),
                remote: reply.protocol_version.clone(),
            };
            {
                let mut stats = self.stats();
                stats.remote_version = Some(reply.protocol_version);
                stats.connected_at = None;
                stats.last_error = Some(error.to_string());
            }
            self.set_state(ConnectionState::Failed);
            return Err(error);
        }

        if self.state() == ConnectionState::Handshaking {
            info!(remote_version = %reply.protocol_version, "Handshake complete");
            self.stats().remote_version = Some(reply.protocol_version.clone());
            self.set_state(ConnectionState::Ready);
        }

        match reply.body {
            Body::Response { result } => Ok(result),
            Body::Error { error } => Err(BridgeError::from(error)),
            Body::Request { .. } => Err(BridgeError::MalformedMessage {
                message: "host sent a request".to_string(),
            }),
        }
    }

    async fn ensure_connected(
        &self,
        session: &mut Session,
        cancelled: Pin<&mut Notified<'_>>,
    ) -> Result<(), BridgeError> {
        match self.state() {
            state if state.is_usable() && session.transport.is_some() => Ok(()),
            ConnectionState::Failed => Err(self.failed_error()),
            ConnectionState::Reconnecting => self.reconnect_with_backoff(session, cancelled).await,
            _ => self.connect_once(session, cancelled).await,
        }
    }

    async fn connect_once(
        &self,
        session: &mut Session,
        cancelled: Pin<&mut Notified<'_>>,
    ) -> Result<(), BridgeError> {
        self.set_state(ConnectionState::Connecting);
        let Some(opened) = unless_cancelled(self.open(), cancelled).await else {
            self.set_state(ConnectionState::Disconnected);
            return Err(abandoned("connect"));
        };
        match opened {
            Ok(transport) => {
                self.install(session, transport);
                Ok(())
            }
            Err(message) => {
                self.set_state(ConnectionState::Disconnected);
                self.record_error(&message);
                Err(BridgeError::ConnectionClosed { message })
            }
        }
    }

    async fn reconnect_with_backoff(
        &self,
        session: &mut Session,
        mut cancelled: Pin<&mut Notified<'_>>,
    ) -> Result<(), BridgeError> {
        let backoff = self.settings.backoff;
        let mut delays = backoff.delays();
        let mut last_error = String::new();

        for attempt in 1..=backoff.max_attempts() {
            let Some(opened) = unless_cancelled(self.open(), cancelled.as_mut()).await else {
                return Err(abandoned("reconnect"));
            };
            match opened {
                Ok(transport) => {
                    info!(attempt, "Reconnected to host");
                    self.install(session, transport);
                    return Ok(());
                }
                Err(message) => {
                    warn!(attempt, error = %message, "Reconnect attempt failed");
                    last_error = message;
                }
            }

            if let Some(delay) = delays.next() {
                debug!(attempt, ?delay, "Waiting before next reconnect attempt");
                let slept = unless_cancelled(tokio::time::sleep(delay), cancelled.as_mut()).await;
                if slept.is_none() {
                    return Err(abandoned("reconnect"));
                }
            }
        }

        Err(self.give_up(backoff.max_attempts(), &last_error))
    }

    /// Ends a reconnection cycle in [`ConnectionState::Failed`].
    fn give_up(&self, attempts: u32, last_error: &str) -> BridgeError {
        let message = format!(
            "gave up reconnecting to {} after {attempts} attempts ({last_error}); call reconnect() to try again",
            self.addr
        );
        self.record_error(&message);
        self.set_state(ConnectionState::Failed);
        BridgeError::ConnectionClosed { message }
    }

    /// One bounded connect attempt. Errors are actionable messages.
    async fn open(&self) -> Result<Transport, String> {
        let timeout = self.settings.connect_timeout;
        match tokio::time::timeout(timeout, TcpStream::connect(self.addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "Cannot disable Nagle");
                }
                Ok(Transport::new(stream))
            }
            Ok(Err(e)) => Err(format!(
                "cannot connect to Blender at {}: {e}; is the bridge add-on running?",
                self.addr
            )),
            Err(_) => Err(format!(
                "connecting to Blender at {} timed out after {}s",
                self.addr,
                timeout.as_secs_f64()
            )),
        }
    }

    fn install(&self, session: &mut Session, transport: Transport) {
        session.transport = Some(transport);
        {
            let mut stats = self.stats();
            stats.connection_count += 1;
            stats.connected_at = Some(Instant::now());
            stats.remote_version = None;
        }
        info!(addr = %self.addr, "Connected to host");
        self.set_state(ConnectionState::Handshaking);
    }

    /// A cancellation future already registered with [`Notify`], so a
    /// `notify_waiters()` issued before it is first polled still counts.
    fn armed_cancel(&self) -> Pin<Box<Notified<'_>>> {
        let mut cancelled = Box::pin(self.cancel.notified());
        cancelled.as_mut().enable();
        cancelled
    }

    fn failed_error(&self) -> BridgeError {
        let reason = self
            .stats()
            .last_error
            .clone()
            .unwrap_or_else(|| "connection failed".to_string());
        BridgeError::ConnectionClosed {
            message: format!("{reason}; call reconnect() to reset the connection"),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Connection state changed");
        }
    }

    fn record_error(&self, message: &str) {
        self.stats().last_error = Some(message.to_string());
    }

    fn stats(&self) -> MutexGuard<'_, Stats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

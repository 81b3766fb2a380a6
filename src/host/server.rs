//! Loopback TCP server on the host side.
//!
//! - Binds `127.0.0.1` only; the caller chooses the port
//! - Serves exactly one client at a time. A connection arriving while the
//!   slot is taken gets [`HANDOFF_GRACE`] for the previous client's thread
//!   to let go, then is closed
//! - A client that hangs up while its command is queued releases the slot
//!   at once; the command still runs and its reply is dropped
//! - Accepting and reading happen on background threads, never on the
//!   host's main thread
//!
//! Each decoded request is handed to the [`Dispatcher`](super::Dispatcher)
//! through a [`Submitter`]; the client's thread blocks until the main thread
//! replies, then writes the reply on the same socket.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::host::dispatcher::{QueuedCommand, Submitter};
use crate::protocol::{self, Body, ErrorCode, ErrorRecord, Message};

/// How long a request may wait for the main thread when it names no timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Added to the request's own timeout before the network thread gives up.
pub const COMPLETION_GRACE: Duration = Duration::from_secs(10);

/// How long a new connection waits for the previous client to release the
/// slot before it is refused.
pub const HANDOFF_GRACE: Duration = Duration::from_millis(500);

/// How often a waiting network thread checks whether its client hung up.
const HANGUP_POLL: Duration = Duration::from_millis(50);

const SLOT_POLL: Duration = Duration::from_millis(10);

/// State shared between the server handle and its threads.
#[derive(Debug)]
struct Shared {
    running: AtomicBool,
    active: Mutex<Option<TcpStream>>,
    accepted: AtomicU64,
    refused: AtomicU64,
    protocol_version: String,
}

impl Shared {
    fn active(&self) -> MutexGuard<'_, Option<TcpStream>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks the client slot, first giving a departing client up to
    /// [`HANDOFF_GRACE`] to release it.
    fn claim_slot(&self) -> MutexGuard<'_, Option<TcpStream>> {
        let deadline = Instant::now() + HANDOFF_GRACE;
        loop {
            let active = self.active();
            if active.is_none()
                || Instant::now() >= deadline
                || !self.running.load(Ordering::SeqCst)
            {
                return active;
            }
            drop(active);
            thread::sleep(SLOT_POLL);
        }
    }
}

/// A running host server.
///
/// Stopped on drop.
#[derive(Debug)]
pub struct HostServer {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    accept_thread: Option<JoinHandle<()>>,
}

impl HostServer {
    /// Binds `127.0.0.1:port` and starts accepting. Port 0 picks a free port.
    ///
    /// Requests must be compatible with `protocol_version`; replies built by
    /// the server itself are stamped with it.
    ///
    /// # Errors
    ///
    /// Returns an error if the port cannot be bound or the accept thread
    /// cannot be spawned.
    pub fn start(
        port: u16,
        submitter: Submitter,
        protocol_version: impl Into<String>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            active: Mutex::new(None),
            accepted: AtomicU64::new(0),
            refused: AtomicU64::new(0),
            protocol_version: protocol_version.into(),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_thread = thread::Builder::new()
            .name("mcp-accept".to_string())
            .spawn(move || accept_loop(&listener, &accept_shared, &submitter))?;

        info!(addr = %local_addr, "Host server listening");

        Ok(Self {
            local_addr,
            shared,
            accept_thread: Some(accept_thread),
        })
    }

    /// The bound address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns `true` until [`stop`](Self::stop) is called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Returns `true` while a client is connected.
    #[must_use]
    pub fn client_connected(&self) -> bool {
        self.shared.active().is_some()
    }

    /// Total connections accepted and served.
    #[must_use]
    pub fn connections_accepted(&self) -> u64 {
        self.shared.accepted.load(Ordering::Relaxed)
    }

    /// Total connections refused because a client was already connected.
    #[must_use]
    pub fn connections_refused(&self) -> u64 {
        self.shared.refused.load(Ordering::Relaxed)
    }

    /// Stops accepting, disconnects the active client and joins the accept
    /// thread. Idempotent.
    pub fn stop(&mut self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        // Unblock accept() with a throwaway connection.
        if let Err(e) = TcpStream::connect_timeout(&self.local_addr, Duration::from_millis(250)) {
            debug!(error = %e, "Wake-up connection failed");
        }

        if let Some(stream) = self.shared.active().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }

        if let Some(handle) = self.accept_thread.take() {
            if handle.join().is_err() {
                error!("Accept thread panicked");
            }
        }

        info!(addr = %self.local_addr, "Host server stopped");
    }
}

impl Drop for HostServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: &TcpListener, shared: &Arc<Shared>, submitter: &Submitter) {
    for stream in listener.incoming() {
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                continue;
            }
        };

        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) => {
                debug!(error = %e, "Connection vanished before it could be served");
                continue;
            }
        };

        {
            let mut active = shared.claim_slot();
            if active.is_some() {
                shared.refused.fetch_add(1, Ordering::Relaxed);
                warn!(%peer, "Refusing connection: a client is already connected");
                let _ = stream.shutdown(Shutdown::Both);
                continue;
            }
            match stream.try_clone() {
                Ok(handle) => *active = Some(handle),
                Err(e) => {
                    error!(%peer, error = %e, "Cannot track client socket");
                    continue;
                }
            }
        }

        shared.accepted.fetch_add(1, Ordering::Relaxed);
        info!(%peer, "Client connected");

        let client_shared = Arc::clone(shared);
        let client_submitter = submitter.clone();
        let spawned = thread::Builder::new()
            .name("mcp-client".to_string())
            .spawn(move || {
                if let Err(e) = serve_client(&stream, peer, &client_shared, &client_submitter) {
                    debug!(%peer, error = %e, "Client connection ended with error");
                }
                client_shared.active().take();
                info!(%peer, "Client disconnected");
            });

        if let Err(e) = spawned {
            error!(%peer, error = %e, "Cannot spawn client thread");
            shared.active().take();
        }
    }

    debug!("Accept loop exited");
}

fn serve_client(
    stream: &TcpStream,
    peer: SocketAddr,
    shared: &Shared,
    submitter: &Submitter,
) -> io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut writer = stream;
    let mut frame = Vec::new();

    loop {
        frame.clear();
        if reader.read_until(b'\n', &mut frame)? == 0 {
            return Ok(());
        }
        if frame.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let Some(reply) = handle_frame(&frame, peer, &shared.protocol_version, submitter, || {
            peer_hung_up(stream)
        }) else {
            info!(%peer, "Client hung up while its command was pending");
            return Ok(());
        };
        match protocol::encode(&reply) {
            Ok(bytes) => {
                writer.write_all(&bytes)?;
                writer.flush()?;
            }
            Err(e) => error!(id = %reply.id, error = %e, "Cannot encode reply"),
        }

        if !shared.running.load(Ordering::SeqCst) {
            return Ok(());
        }
    }
}

/// Returns `true` if the client has closed its end and sent nothing more.
///
/// Only called from the thread that owns the socket, between reads.
fn peer_hung_up(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return false;
    }
    let mut byte = [0_u8; 1];
    let hung_up = match stream.peek(&mut byte) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => e.kind() != io::ErrorKind::WouldBlock,
    };
    if let Err(e) = stream.set_nonblocking(false) {
        debug!(error = %e, "Cannot restore blocking mode");
        return true;
    }
    hung_up
}

/// Turns one inbound frame into the reply to send back.
///
/// Returns `None` if `hung_up` reports the client gone while its command was
/// waiting for the main thread.
fn handle_frame<F>(
    frame: &[u8],
    peer: SocketAddr,
    version: &str,
    submitter: &Submitter,
    hung_up: F,
) -> Option<Message>
where
    F: Fn() -> bool,
{
    let request = match protocol::decode_request(frame) {
        Ok(request) => request,
        Err(e) => {
            warn!(%peer, error = %e, "Rejecting malformed frame");
            let id = protocol::salvage_id(frame).unwrap_or_else(|| Uuid::new_v4().to_string());
            return Some(Message::error(id, e.to_record()).with_protocol_version(version));
        }
    };

    if !protocol::compatible(version, &request.protocol_version) {
        warn!(
            %peer,
            request_version = %request.protocol_version,
            host_version = version,
            "Rejecting request with incompatible protocol version"
        );
        let record = ErrorRecord::version_mismatch(&request.protocol_version, version);
        return Some(Message::error(request.id, record).with_protocol_version(version));
    }

    let id = request.id.clone();
    let command = request.command().unwrap_or_default().to_string();
    let wait = completion_timeout(&request);

    let (queued, completion) = QueuedCommand::new(request, peer);
    if let Err(e) = submitter.submit(queued) {
        return Some(Message::error(id, e.to_record()).with_protocol_version(version));
    }
    debug!(id = %id, command = %command, "Request queued");

    let started = Instant::now();
    let outcome = loop {
        let remaining = wait.saturating_sub(started.elapsed());
        match completion.wait(remaining.min(HANGUP_POLL)) {
            Err(RecvTimeoutError::Timeout) if !remaining.is_zero() => {
                if hung_up() {
                    debug!(id = %id, command = %command, "Abandoning wait: client hung up");
                    return None;
                }
            }
            outcome => break outcome,
        }
    };

    let reply = match outcome {
        Ok(reply) => reply,
        Err(RecvTimeoutError::Timeout) => {
            warn!(id = %id, command = %command, ?wait, "Main thread did not reply in time");
            let record = ErrorRecord::new(
                ErrorCode::Timeout,
                format!("command '{command}' was not executed within {}s", wait.as_secs()),
            )
            .with_detail(json!({
                "command": command,
                "timeout_ms": u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            }));
            Message::error(id, record).with_protocol_version(version)
        }
        Err(RecvTimeoutError::Disconnected) => {
            let record = ErrorRecord::new(
                ErrorCode::ConnectionClosed,
                "host dispatcher dropped the command",
            );
            Message::error(id, record).with_protocol_version(version)
        }
    };
    Some(reply)
}

/// `params.timeout` seconds (or the default) plus the grace period.
fn completion_timeout(request: &Message) -> Duration {
    let requested = match &request.body {
        Body::Request { params, .. } => params
            .get("timeout")
            .and_then(Value::as_f64)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok()),
        _ => None,
    };
    requested.unwrap_or(DEFAULT_COMMAND_TIMEOUT) + COMPLETION_GRACE
}

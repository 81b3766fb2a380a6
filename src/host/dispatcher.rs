//! Main-thread command queue.
//!
//! Network threads [`submit`](Submitter::submit) decoded requests; the host's
//! per-frame callback calls [`Dispatcher::drain_one`] to execute at most one
//! of them on the privileged thread. The dispatcher never spawns a thread of
//! its own.
//!
//! ```text
//!   network thread            main thread
//!   ──────────────            ───────────
//!   submit(cmd) ──queue──▶    drain_one()
//!   completion.wait() ◀────── cmd.complete(reply)
//! ```

use std::any::Any;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde_json::json;
use tracing::{debug, error, warn};

use crate::error::{BridgeError, CommandError};
use crate::host::registry::CommandRegistry;
use crate::protocol::{Body, ErrorCode, ErrorRecord, Message, PROTOCOL_VERSION};

/// A decoded request waiting for the main thread.
#[derive(Debug)]
pub struct QueuedCommand {
    request: Message,
    peer: SocketAddr,
    completion: SyncSender<Message>,
}

impl QueuedCommand {
    /// Wraps a request and returns the handle its submitter waits on.
    #[must_use]
    pub fn new(request: Message, peer: SocketAddr) -> (Self, Completion) {
        let (completion, receiver) = mpsc::sync_channel(1);
        (
            Self {
                request,
                peer,
                completion,
            },
            Completion { receiver },
        )
    }

    /// The request to execute.
    #[must_use]
    pub const fn request(&self) -> &Message {
        &self.request
    }

    /// Address of the client the request arrived from.
    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Hands the reply back to the waiting network thread.
    ///
    /// Returns `false` if nobody is waiting any more (the wait timed out or
    /// the connection was closed).
    pub fn complete(self, reply: Message) -> bool {
        self.completion.try_send(reply).is_ok()
    }
}

/// The network thread's side of a [`QueuedCommand`].
#[derive(Debug)]
pub struct Completion {
    receiver: Receiver<Message>,
}

impl Completion {
    /// Blocks until the main thread replies or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if no reply arrived in time, or `Disconnected` if
    /// the command was dropped without a reply.
    pub fn wait(&self, timeout: Duration) -> Result<Message, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Thread-safe handle for enqueueing commands.
#[derive(Debug, Clone)]
pub struct Submitter {
    sender: Sender<QueuedCommand>,
}

impl Submitter {
    /// Appends a command to the queue.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` if the dispatcher has been dropped.
    pub fn submit(&self, command: QueuedCommand) -> Result<(), BridgeError> {
        self.sender
            .send(command)
            .map_err(|_| BridgeError::ConnectionClosed {
                message: "host dispatcher is no longer running".to_string(),
            })
    }
}

/// Executes queued commands on the thread that owns it.
#[derive(Debug)]
pub struct Dispatcher {
    registry: CommandRegistry,
    queue: Receiver<QueuedCommand>,
    protocol_version: String,
    executed: u64,
    last_command: Option<(String, DateTime<Local>)>,
}

impl Dispatcher {
    /// Creates a dispatcher over `registry` and the submitter feeding it.
    #[must_use]
    pub fn new(registry: CommandRegistry) -> (Self, Submitter) {
        let (sender, queue) = mpsc::channel();
        (
            Self {
                registry,
                queue,
                protocol_version: PROTOCOL_VERSION.to_string(),
                executed: 0,
                last_command: None,
            },
            Submitter { sender },
        )
    }

    /// Stamps replies with `version` instead of the build's own.
    #[must_use]
    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.set_protocol_version(version);
        self
    }

    /// Changes the version stamped on replies and advertised by
    /// `get_version`.
    pub fn set_protocol_version(&mut self, version: impl Into<String>) {
        self.protocol_version = version.into();
        self.registry.set_protocol_version(&self.protocol_version);
    }

    /// Executes at most one queued command.
    ///
    /// Returns `true` if a command was taken from the queue.
    pub fn drain_one(&mut self) -> bool {
        let Ok(queued) = self.queue.try_recv() else {
            return false;
        };

        let reply = self.execute(&queued.request);
        let id = reply.id.clone();
        let peer = queued.peer;
        if !queued.complete(reply) {
            warn!(id = %id, %peer, "Reply dropped: requester stopped waiting");
        }
        true
    }

    /// Answers every queued command with `ConnectionClosedError` without
    /// executing it. Returns how many were cancelled.
    pub fn cancel_pending(&mut self, reason: &str) -> usize {
        let mut cancelled = 0;
        while let Ok(queued) = self.queue.try_recv() {
            let reply = Message::error(
                queued.request.id.clone(),
                ErrorRecord::new(ErrorCode::ConnectionClosed, reason),
            )
            .with_protocol_version(self.protocol_version.clone());
            queued.complete(reply);
            cancelled += 1;
        }
        if cancelled > 0 {
            debug!(cancelled, reason, "Cancelled queued commands");
        }
        cancelled
    }

    /// Number of commands executed so far.
    #[must_use]
    pub const fn executed(&self) -> u64 {
        self.executed
    }

    /// Name and time of the most recent command.
    #[must_use]
    pub fn last_command(&self) -> Option<(&str, DateTime<Local>)> {
        self.last_command
            .as_ref()
            .map(|(name, at)| (name.as_str(), *at))
    }

    /// The registry commands are looked up in.
    #[must_use]
    pub const fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    fn reply(&self, id: &str, body: Result<serde_json::Value, ErrorRecord>) -> Message {
        let message = match body {
            Ok(result) => Message::response(id, result),
            Err(record) => Message::error(id, record),
        };
        message.with_protocol_version(self.protocol_version.clone())
    }

    fn execute(&mut self, request: &Message) -> Message {
        let Body::Request { command, params } = &request.body else {
            return self.reply(
                &request.id,
                Err(ErrorRecord::new(
                    ErrorCode::MalformedMessage,
                    format!("expected a request, got a {}", request.message_type()),
                )),
            );
        };

        self.last_command = Some((command.clone(), Local::now()));

        if !self.registry.contains(command) {
            warn!(command = %command, "Unknown command");
            let record = ErrorRecord::unknown_command(command, &self.registry.names());
            return self.reply(&request.id, Err(record));
        }

        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.registry.execute(command, params)));
        self.executed += 1;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let body = match outcome {
            Ok(Some(Ok(result))) => {
                debug!(command = %command, elapsed_ms, "Command completed");
                Ok(result)
            }
            Ok(Some(Err(err))) => {
                error!(command = %command, kind = err.kind(), error = %err, "Command failed");
                Err(execution_record(command, &err))
            }
            Ok(None) => Err(ErrorRecord::unknown_command(command, &self.registry.names())),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(command = %command, panic = %message, "Command panicked");
                Err(ErrorRecord::new(ErrorCode::Execution, message.clone()).with_detail(json!({
                    "command": command,
                    "kind": "panic",
                    "message": message,
                })))
            }
        };

        self.reply(&request.id, body)
    }
}

fn execution_record(command: &str, err: &CommandError) -> ErrorRecord {
    ErrorRecord::new(ErrorCode::Execution, err.to_string()).with_detail(json!({
        "command": command,
        "kind": err.kind(),
        "message": err.to_string(),
    }))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "command panicked".to_string())
}

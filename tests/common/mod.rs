//! Shared fixtures for integration tests.
//!
//! [`spawn_host`] runs a [`HostBridge`] on its own thread, standing in for
//! Blender's main thread: it builds the registry, starts the server on an
//! ephemeral port and calls `tick()` until told to stop.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use blender_mcp_bridge::host::{CommandRegistry, HostBridge, HostStatus};
use blender_mcp_bridge::protocol::PROTOCOL_VERSION;
use serde_json::Value;

/// Tick period of the test host; shorter than the production interval.
const TEST_TICK: Duration = Duration::from_millis(5);

/// A host running on a background thread.
pub struct TestHost {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<HostStatus>>,
}

impl TestHost {
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops the host and returns its final status.
    pub fn shutdown(mut self) -> HostStatus {
        self.stop.store(true, Ordering::SeqCst);
        self.thread
            .take()
            .unwrap()
            .join()
            .expect("host thread panicked")
    }
}

impl Drop for TestHost {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Spawns a host speaking the build's protocol version with the built-in
/// commands plus whatever `configure` registers.
pub fn spawn_host<F>(configure: F) -> TestHost
where
    F: FnOnce(&mut CommandRegistry) + Send + 'static,
{
    spawn_host_with_version(PROTOCOL_VERSION, configure)
}

/// As [`spawn_host`], speaking `version`.
pub fn spawn_host_with_version<F>(version: &str, configure: F) -> TestHost
where
    F: FnOnce(&mut CommandRegistry) + Send + 'static,
{
    let version = version.to_string();
    let stop = Arc::new(AtomicBool::new(false));
    let (addr_tx, addr_rx) = mpsc::channel();

    let flag = Arc::clone(&stop);
    let thread = thread::spawn(move || {
        let mut registry = CommandRegistry::with_builtins();
        configure(&mut registry);

        let mut bridge = HostBridge::new(registry).with_protocol_version(version);
        let addr = bridge.start(0).expect("host failed to start");
        addr_tx.send(addr).unwrap();

        while !flag.load(Ordering::SeqCst) {
            if bridge.tick().is_none() {
                break;
            }
            thread::sleep(TEST_TICK);
        }

        let status = bridge.status();
        bridge.stop();
        status
    });

    let addr = addr_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("host did not report its address");

    TestHost {
        addr,
        stop,
        thread: Some(thread),
    }
}

/// A blocking line-oriented client for talking to a host by hand.
pub struct RawClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl RawClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        Self {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
        }
    }

    /// Writes `line` followed by a newline.
    pub fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).unwrap();
        self.writer.write_all(b"\n").unwrap();
        self.writer.flush().unwrap();
    }

    /// Reads one reply line as JSON.
    pub fn receive(&mut self) -> Value {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).unwrap();
        assert!(read > 0, "host closed the connection");
        serde_json::from_str(&line).unwrap()
    }

    /// Sends `line` and returns the reply.
    pub fn exchange(&mut self, line: &str) -> Value {
        self.send(line);
        self.receive()
    }

    /// Sends `line` and returns the reply, or `None` if the host closed the
    /// connection instead.
    pub fn try_exchange(&mut self, line: &str) -> Option<Value> {
        self.writer.write_all(format!("{line}\n").as_bytes()).ok()?;
        let mut reply = String::new();
        match self.reader.read_line(&mut reply) {
            Ok(n) if n > 0 => serde_json::from_str(&reply).ok(),
            _ => None,
        }
    }

    /// Returns `true` if the host has closed this connection.
    pub fn is_closed(&mut self) -> bool {
        let mut line = String::new();
        matches!(self.reader.read_line(&mut line), Ok(0) | Err(_))
    }
}

/// A request line with the given version, id, command and params.
pub fn request_line(version: &str, id: &str, command: &str, params: &Value) -> String {
    serde_json::json!({
        "protocol_version": version,
        "id": id,
        "type": "request",
        "command": command,
        "params": params,
    })
    .to_string()
}

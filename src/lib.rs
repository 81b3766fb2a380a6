//! blender-mcp-bridge: main-thread-safe command bridge between an automation
//! client and Blender
//!
//! Blender only allows its scene to be changed from its main thread. This
//! library lets an out-of-process client drive it over a loopback TCP socket
//! without breaking that rule.
//!
//! # Architecture
//!
//! - **Host side** ([`host`]): a socket server on background threads decodes
//!   requests and queues them; the host's timer callback drains the queue on
//!   the main thread, one command per tick, and hands each result back
//! - **Client side** ([`client`]): a connection manager serialises calls over
//!   one socket, checks protocol compatibility and reconnects with backoff; a
//!   health monitor pings in the background
//!
//! Both sides speak newline-delimited JSON ([`protocol`]).
//!
//! # Modules
//!
//! - [`protocol`]: Wire messages, codec and version rules
//! - [`host`]: Dispatcher, command registry and socket server
//! - [`client`]: Connection manager, health monitor and client facade
//! - [`instrument`]: Operation timing and logging middleware
//! - [`config`]: Configuration loading and validation
//! - [`error`]: Error types

pub mod client;
pub mod config;
pub mod error;
pub mod host;
pub mod instrument;
pub mod protocol;

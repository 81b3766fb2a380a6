//! GUI-side half of the bridge.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── host process ────────────────────────────┐
//! │                                                                      │
//! │  background threads                    main thread                   │
//! │  ┌──────────────┐   QueuedCommand    ┌──────────────┐                │
//! │  │  HostServer  │──────────────────▶│  Dispatcher  │──▶ Registry    │
//! │  │ (accept/read)│◀──────────────────│ (drain_one)  │                │
//! │  └──────────────┘    Completion      └──────────────┘                │
//! │         ▲                                   ▲                        │
//! │         │ TCP 127.0.0.1                     │ HostBridge::tick()     │
//! └─────────┼───────────────────────────────────┼────────────────────────┘
//!           │                                   │
//!        client                        host timer callback
//! ```
//!
//! Commands never run concurrently: only the thread calling
//! [`HostBridge::tick`] executes them, one per tick, in arrival order.

pub mod bridge;
pub mod commands;
pub mod dispatcher;
pub mod registry;
pub mod server;

pub use bridge::{BridgeStatus, HostBridge, HostStatus, TICK_INTERVAL};
pub use dispatcher::{Completion, Dispatcher, QueuedCommand, Submitter};
pub use registry::{CommandHandler, CommandRegistry, CommandResult};
pub use server::HostServer;

//! Wire protocol shared by the client and the host.
//!
//! Messages are UTF-8 JSON objects, one per line, over TCP. Every message
//! carries the sender's `protocol_version`; two endpoints can talk iff the
//! major and minor components match.
//!
//! ```text
//! → {"protocol_version":"0.1.0","id":"1","type":"request","command":"ping","params":{}}
//! ← {"protocol_version":"0.1.0","id":"1","type":"response","result":"pong"}
//! ```
//!
//! This module is pure data and validation. It performs no I/O.

pub mod codec;
pub mod message;
pub mod version;

pub use codec::{decode, decode_reply, decode_request, encode, salvage_id};
pub use message::{Body, ErrorCode, ErrorRecord, Message, MessageType, Params};
pub use version::{compatible, PROTOCOL_VERSION};

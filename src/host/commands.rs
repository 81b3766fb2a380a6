//! Built-in host commands.

use serde_json::{json, Value};

use crate::host::registry::CommandResult;
use crate::protocol::Params;

/// Liveness probe used by the client's health monitor.
///
/// # Errors
///
/// Never fails.
pub fn ping(_params: &Params) -> CommandResult {
    Ok(json!("pong"))
}

/// Describes this host: the protocol version it speaks, its build version and
/// the commands it accepts.
#[must_use]
pub fn get_version(protocol_version: &str, available_commands: &[String]) -> Value {
    json!({
        "protocol_version": protocol_version,
        "addon_version": env!("CARGO_PKG_VERSION"),
        "available_commands": available_commands,
    })
}

/// Returns its parameters unchanged.
///
/// # Errors
///
/// Never fails.
pub fn echo(params: &Params) -> CommandResult {
    Ok(Value::Object(params.clone()))
}

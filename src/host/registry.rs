//! Command registry.
//!
//! Maps command names to handlers. Handlers run only on the thread that owns
//! the dispatcher, so they are not required to be `Send` and may hold `Rc`
//! or `RefCell` state.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::CommandError;
use crate::host::commands;
use crate::protocol::{Params, PROTOCOL_VERSION};

/// What a command produces.
pub type CommandResult = Result<Value, CommandError>;

/// A synchronous command executed on the host's main thread.
pub trait CommandHandler {
    /// Runs the command.
    ///
    /// # Errors
    ///
    /// Returns a [`CommandError`] describing the domain failure. The
    /// dispatcher reports it to the client as an `ExecutionError`.
    fn execute(&mut self, params: &Params) -> CommandResult;
}

impl<F> CommandHandler for F
where
    F: FnMut(&Params) -> CommandResult,
{
    fn execute(&mut self, params: &Params) -> CommandResult {
        self(params)
    }
}

/// Name to handler mapping consulted by the dispatcher.
pub struct CommandRegistry {
    handlers: BTreeMap<String, Box<dyn CommandHandler>>,
    /// Sorted command names, shared with `get_version`.
    names: Rc<RefCell<Vec<String>>>,
    /// Version `get_version` advertises; follows the dispatcher's.
    protocol_version: Rc<RefCell<String>>,
}

impl CommandRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
            names: Rc::new(RefCell::new(Vec::new())),
            protocol_version: Rc::new(RefCell::new(PROTOCOL_VERSION.to_string())),
        }
    }

    /// Creates a registry holding the built-in `ping` and `get_version`
    /// commands.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("ping", commands::ping);

        let names = Rc::clone(&registry.names);
        let version = Rc::clone(&registry.protocol_version);
        registry.register("get_version", move |_: &Params| -> CommandResult {
            Ok(commands::get_version(&version.borrow(), &names.borrow()))
        });

        registry
    }

    /// Registers `handler` under `name`, replacing any previous handler.
    pub fn register<H>(&mut self, name: impl Into<String>, handler: H) -> &mut Self
    where
        H: CommandHandler + 'static,
    {
        let name = name.into();
        if self.handlers.insert(name.clone(), Box::new(handler)).is_some() {
            warn!(command = %name, "Replaced existing command handler");
        } else {
            debug!(command = %name, "Registered command");
        }
        *self.names.borrow_mut() = self.handlers.keys().cloned().collect();
        self
    }

    /// Replaces every registered handler with `wrap(name, handler)`.
    pub fn wrap_handlers<F>(&mut self, mut wrap: F)
    where
        F: FnMut(&str, Box<dyn CommandHandler>) -> Box<dyn CommandHandler>,
    {
        let handlers = std::mem::take(&mut self.handlers);
        self.handlers = handlers
            .into_iter()
            .map(|(name, handler)| {
                let wrapped = wrap(&name, handler);
                (name, wrapped)
            })
            .collect();
    }

    /// Sets the protocol version `get_version` reports.
    pub fn set_protocol_version(&mut self, version: &str) {
        *self.protocol_version.borrow_mut() = version.to_string();
    }

    /// Runs the handler registered under `name`.
    ///
    /// Returns `None` if no such command exists.
    pub fn execute(&mut self, name: &str, params: &Params) -> Option<CommandResult> {
        self.handlers
            .get_mut(name)
            .map(|handler| handler.execute(params))
    }

    /// Returns `true` if a command is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Returns the registered command names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.names.borrow().clone()
    }

    /// Returns the number of registered commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no commands are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtins_are_registered() {
        let registry = CommandRegistry::with_builtins();
        assert!(registry.contains("ping"));
        assert!(registry.contains("get_version"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn get_version_lists_later_registrations() {
        let mut registry = CommandRegistry::with_builtins();
        registry.register("export_mesh", |_: &Params| -> CommandResult { Ok(Value::Null) });

        let version = registry.execute("get_version", &Params::new()).unwrap().unwrap();
        assert_eq!(
            version["available_commands"],
            json!(["export_mesh", "get_version", "ping"])
        );
    }

    #[test]
    fn get_version_follows_protocol_version() {
        let mut registry = CommandRegistry::with_builtins();
        registry.set_protocol_version("0.1.3");

        let version = registry.execute("get_version", &Params::new()).unwrap().unwrap();
        assert_eq!(version["protocol_version"], "0.1.3");
    }

    #[test]
    fn wrap_handlers_keeps_names_and_behaviour() {
        let mut registry = CommandRegistry::with_builtins();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&calls);
        registry.wrap_handlers(|name, mut handler| {
            let name = name.to_string();
            let seen = Rc::clone(&seen);
            Box::new(move |params: &Params| -> CommandResult {
                seen.borrow_mut().push(name.clone());
                handler.execute(params)
            })
        });

        assert_eq!(registry.names(), ["get_version", "ping"]);
        assert_eq!(registry.execute("ping", &Params::new()).unwrap().unwrap(), json!("pong"));
        assert_eq!(*calls.borrow(), ["ping"]);
    }

    #[test]
    fn closures_keep_state_between_calls() {
        let mut registry = CommandRegistry::new();
        let mut count = 0_u32;
        registry.register("count", move |_: &Params| -> CommandResult {
            count += 1;
            Ok(json!(count))
        });

        registry.execute("count", &Params::new());
        let second = registry.execute("count", &Params::new()).unwrap().unwrap();
        assert_eq!(second, json!(2));
    }

    #[test]
    fn unknown_command_is_none() {
        let mut registry = CommandRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.execute("missing", &Params::new()).is_none());
    }

    #[test]
    fn register_replaces_existing_handler() {
        let mut registry = CommandRegistry::new();
        registry
            .register("cmd", |_: &Params| -> CommandResult { Ok(json!(1)) })
            .register("cmd", |_: &Params| -> CommandResult { Ok(json!(2)) });

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.execute("cmd", &Params::new()).unwrap().unwrap(), json!(2));
    }
}

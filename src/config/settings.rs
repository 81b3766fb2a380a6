//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default host port.
pub const DEFAULT_PORT: u16 = 9876;

/// Overrides `host`.
pub const ENV_HOST: &str = "BLENDER_HOST";
/// Overrides `port`.
pub const ENV_PORT: &str = "BLENDER_PORT";
/// Overrides `logging.log_dir`.
pub const ENV_LOG_DIR: &str = "BLENDERMCP_LOG_DIR";
/// Overrides `logging.level`; `DEBUG` also selects verbose mode.
pub const ENV_LOG_LEVEL: &str = "BLENDERMCP_LOG_LEVEL";

/// Root configuration structure.
///
/// This is the top-level structure that matches the JSON config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// Address of the host. Must be a loopback address.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port the host listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            _schema: None,
            _comment: None,
            host: default_host(),
            port: default_port(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.host.is_loopback() {
            return Err(ConfigError::ValidationError {
                message: format!(
                    "host '{}' is not a loopback address; the bridge only listens on 127.0.0.1",
                    self.host
                ),
            });
        }
        if self.port == 0 {
            return Err(ConfigError::ValidationError {
                message: "port must be between 1 and 65535".to_string(),
            });
        }
        Ok(())
    }

    /// Applies environment overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if `BLENDER_HOST` or `BLENDER_PORT` cannot be parsed.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_HOST) {
            self.host = if host.eq_ignore_ascii_case("localhost") {
                default_host()
            } else {
                host.parse().map_err(|_| ConfigError::ValidationError {
                    message: format!("{ENV_HOST}='{host}' is not an IP address"),
                })?
            };
        }

        if let Some(port) = lookup(ENV_PORT) {
            self.port = port.parse().map_err(|_| ConfigError::ValidationError {
                message: format!("{ENV_PORT}='{port}' is not a valid port"),
            })?;
        }

        if let Some(dir) = lookup(ENV_LOG_DIR) {
            self.logging.log_dir = Some(PathBuf::from(dir));
        }

        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.logging.mode = if level.eq_ignore_ascii_case("debug") {
                Verbosity::Verbose
            } else {
                Verbosity::Lean
            };
            self.logging.level = level.to_lowercase();
        }

        Ok(())
    }

    /// Host address and port.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

const fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

const fn default_port() -> u16 {
    DEFAULT_PORT
}

/// How much operation detail is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    /// Summaries at debug, failures at error.
    #[default]
    Lean,
    /// Also parameters and results, at info.
    Verbose,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Lean or verbose operation logging.
    #[serde(default)]
    pub mode: Verbosity,

    /// Directory for JSON log files. No file logging when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            mode: Verbosity::default(),
            log_dir: None,
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

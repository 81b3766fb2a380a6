//! Configuration file loading and parsing.
//!
//! This module handles loading the configuration file from disk, applying
//! environment overrides and validating the result.
//!
//! # Configuration File Locations
//!
//! The configuration file is searched in the following order:
//!
//! 1. Path specified via `--config` CLI flag
//! 2. Default location:
//!    - **Linux/macOS:** `~/.blender-mcp-bridge/config.json`
//!    - **Windows:** `%USERPROFILE%\.blender-mcp-bridge\config.json`
//!
//! A missing file at the default location is not an error: built-in
//! defaults are used.
//!
//! # Environment
//!
//! `BLENDER_HOST`, `BLENDER_PORT`, `BLENDERMCP_LOG_DIR` and
//! `BLENDERMCP_LOG_LEVEL` override the file.

mod settings;

pub use settings::{
    Config, LoggingConfig, Verbosity, DEFAULT_PORT, ENV_HOST, ENV_LOG_DIR, ENV_LOG_LEVEL,
    ENV_PORT,
};

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Returns the default configuration directory.
///
/// - **Linux/macOS:** `~/.blender-mcp-bridge/`
/// - **Windows:** `%USERPROFILE%\.blender-mcp-bridge\`
#[must_use]
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".blender-mcp-bridge"))
}

/// Returns the platform-specific default configuration file path.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join("config.json"))
}

/// Loads the configuration file and applies process environment overrides.
///
/// If `path` is `None`, uses the platform-specific default location.
///
/// # Errors
///
/// Returns an error if:
/// - An explicitly given file cannot be found
/// - The file cannot be read
/// - The JSON is malformed
/// - An environment override cannot be parsed
/// - Validation fails
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    load_config_with(path, |key| std::env::var(key).ok())
}

/// [`load_config`] with an explicit environment lookup.
///
/// # Errors
///
/// As [`load_config`].
pub fn load_config_with<F>(path: Option<&Path>, env: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match path {
        Some(p) => {
            if !p.exists() {
                return Err(ConfigError::NotFound {
                    path: p.to_path_buf(),
                });
            }
            read_config(p)?
        }
        None => match default_config_path() {
            Some(p) if p.exists() => read_config(&p)?,
            _ => Config::default(),
        },
    };

    config.apply_env(env)?;

    // Validate the configuration
    config.validate()?;

    Ok(config)
}

fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;

    serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })
}

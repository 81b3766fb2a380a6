//! blender-mcp-bridge: command bridge between an automation client and Blender
//!
//! Runs a standalone host for testing clients, or acts as a one-shot client
//! against a running host.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use blender_mcp_bridge::client::BridgeClient;
use blender_mcp_bridge::config::{self, Config};
use blender_mcp_bridge::host::{commands, CommandRegistry, HostBridge};
use blender_mcp_bridge::instrument::{instrument_all, OperationStats};
use blender_mcp_bridge::protocol::Params;

/// Main-thread-safe TCP command bridge between an automation client and
/// Blender.
#[derive(Parser, Debug)]
#[command(name = "blender-mcp-bridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a standalone host that serves the built-in commands plus `echo`
    Host {
        /// Port to listen on (defaults to the configured port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Send one command to the host and print its result
    Call {
        /// Command name
        command: String,

        /// Parameters as a JSON object
        #[arg(default_value = "{}")]
        params: String,

        /// Reply deadline in seconds
        #[arg(short, long, value_name = "SECONDS")]
        timeout: Option<f64>,
    },

    /// Ping the host and print the round-trip time
    Ping,

    /// Ping the host once and print connection and health status
    Status,
}

/// Determines the log level from CLI arguments.
#[allow(clippy::match_same_arms)] // Explicit "warn" arm for clarity
fn get_log_level(verbose: u8, quiet: bool, config_level: &str) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => match config_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN, // Default to warn for unknown levels
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber for logging.
///
/// Logs go to stderr and, when `log_dir` is set, to a daily JSON file in it.
/// The returned guard flushes the file writer when dropped.
fn init_tracing(level: Level, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let file = match log_dir.map(|dir| std::fs::create_dir_all(dir).map(|()| dir)) {
        Some(Ok(dir)) => Some(tracing_appender::non_blocking(
            tracing_appender::rolling::daily(dir, "blender-mcp-bridge.log"),
        )),
        Some(Err(e)) => {
            eprintln!("Cannot create log directory: {e}");
            None
        }
        None => None,
    };
    let (writer, guard) = file.unzip();

    let file_layer = writer.map(|writer| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(writer)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

/// Sets `flag` when Ctrl+C is pressed.
fn watch_ctrl_c(flag: Arc<AtomicBool>) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;
    thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    flag.store(true, Ordering::SeqCst);
                }
            });
        })?;
    Ok(())
}

/// Runs the host on this thread until Ctrl+C.
fn run_host(cfg: &Config, port: Option<u16>) -> ExitCode {
    let stats = Arc::new(OperationStats::new());
    let mut registry = CommandRegistry::with_builtins();
    registry.register("echo", commands::echo);
    instrument_all(&mut registry, &stats, cfg.logging.mode);

    let mut bridge = HostBridge::new(registry);
    let addr = match bridge.start(port.unwrap_or(cfg.port)) {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("Cannot start host: {e}");
            return ExitCode::FAILURE;
        }
    };
    eprintln!("Listening on {addr}; press Ctrl+C to stop");

    let shutdown = Arc::new(AtomicBool::new(false));
    if let Err(e) = watch_ctrl_c(Arc::clone(&shutdown)) {
        warn!(error = %e, "Cannot install Ctrl+C handler");
    }

    while !shutdown.load(Ordering::SeqCst) {
        match bridge.tick() {
            Some(delay) => thread::sleep(delay),
            None => break,
        }
    }

    bridge.stop();
    let report = stats.report();
    info!(
        commands = bridge.status().commands_executed,
        instrumented_calls = report.total_calls,
        "Host shut down"
    );
    ExitCode::SUCCESS
}

fn print_json(value: &impl Serialize) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Cannot serialise output: {e}");
            ExitCode::FAILURE
        }
    }
}

/// A client subcommand with its arguments parsed.
enum ClientAction {
    Call {
        command: String,
        params: Params,
        timeout: Option<Duration>,
    },
    Ping,
    Status,
}

impl ClientAction {
    fn call(command: String, params: &str, timeout: Option<f64>) -> Result<Self, String> {
        let params: Params = serde_json::from_str(params)
            .map_err(|e| format!("Parameters must be a JSON object: {e}"))?;
        let timeout = timeout
            .map(Duration::try_from_secs_f64)
            .transpose()
            .map_err(|e| format!("Invalid timeout: {e}"))?;
        Ok(Self::Call {
            command,
            params,
            timeout,
        })
    }
}

/// Runs one client action against the configured host.
async fn run_client(cfg: &Config, action: ClientAction) -> ExitCode {
    let client = BridgeClient::new(cfg);

    let code = match action {
        ClientAction::Call {
            command,
            params,
            timeout,
        } => match client.call(&command, params, timeout).await {
            Ok(result) => print_json(&result),
            Err(e) => {
                error!(code = %e.code(), "Call failed");
                eprintln!("{e}");
                ExitCode::FAILURE
            }
        },
        ClientAction::Ping => {
            let timeout = client.connection().settings().call_timeout;
            match client.connection().ping(timeout).await {
                Ok(latency) => {
                    println!("pong in {:.1} ms", latency.as_secs_f64() * 1000.0);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{e}");
                    ExitCode::FAILURE
                }
            }
        }
        ClientAction::Status => {
            if let Err(e) = client.connection().connect().await {
                warn!(error = %e, "Host unreachable");
            }
            client.check_health().await;
            print_json(&client.status())
        }
    };

    client.shutdown().await;
    code
}

/// Entry point for blender-mcp-bridge.
fn main() -> ExitCode {
    let args = Args::parse();

    // Load configuration
    let config_path = args.config.as_deref();
    let cfg = match config::load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            if config_path.is_none() {
                if let Some(default_path) = config::default_config_path() {
                    eprintln!("\nConfig is read from: {}", default_path.display());
                    eprintln!("Create one based on config/example-config.json");
                }
            }
            return ExitCode::FAILURE;
        }
    };

    // Initialise logging
    let log_level = get_log_level(args.verbose, args.quiet, &cfg.logging.level);
    let _log_guard = init_tracing(log_level, cfg.logging.log_dir.as_deref());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = ?cfg.logging.mode,
        "Starting blender-mcp-bridge"
    );

    let action = match args.command {
        Command::Host { port } => return run_host(&cfg, port),
        Command::Call {
            command,
            params,
            timeout,
        } => match ClientAction::call(command, &params, timeout) {
            Ok(action) => action,
            Err(message) => {
                eprintln!("{message}");
                return ExitCode::FAILURE;
            }
        },
        Command::Ping => ClientAction::Ping,
        Command::Status => ClientAction::Status,
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run_client(&cfg, action))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn quiet_wins_over_config() {
        assert_eq!(get_log_level(0, true, "debug"), Level::ERROR);
        assert_eq!(get_log_level(0, false, "DEBUG"), Level::DEBUG);
        assert_eq!(get_log_level(0, false, "bogus"), Level::WARN);
        assert_eq!(get_log_level(2, false, "error"), Level::DEBUG);
    }

    #[test]
    fn call_params_default_to_empty_object() {
        let args = Args::try_parse_from(["blender-mcp-bridge", "call", "ping"]).unwrap();
        let Command::Call { params, timeout, .. } = args.command else {
            panic!("expected call");
        };
        assert_eq!(params, "{}");
        assert!(timeout.is_none());
    }

    #[test]
    fn call_action_rejects_bad_input() {
        assert!(ClientAction::call("ping".into(), "[1, 2]", None).is_err());
        assert!(ClientAction::call("ping".into(), "{}", Some(-1.0)).is_err());
        assert!(matches!(
            ClientAction::call("echo".into(), r#"{"a": 1}"#, Some(2.5)),
            Ok(ClientAction::Call { timeout: Some(t), .. }) if t == Duration::from_millis(2500)
        ));
    }
}

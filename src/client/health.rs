//! Connection health monitor.
//!
//! A background task pings the host through the [`ConnectionManager`] every
//! interval and records the outcome. When consecutive failures reach the
//! threshold the monitor asks the manager to reconnect, once per crossing.
//!
//! The first ping happens one interval after [`HealthMonitor::start`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::client::connection::ConnectionManager;
use crate::error::BridgeError;

/// Time between background pings.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Reply deadline for a health ping.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive failures that trigger a reconnection.
pub const FAILURE_THRESHOLD: u32 = 3;

/// Latency samples kept.
pub const LATENCY_WINDOW: usize = 20;

/// Events kept for [`HealthMonitor::export_report`].
pub const MAX_HISTORY: usize = 50;

/// Monitor tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSettings {
    /// Time between pings.
    pub interval: Duration,
    /// Deadline for each ping.
    pub ping_timeout: Duration,
    /// Consecutive failures that trigger a reconnection.
    pub failure_threshold: u32,
    /// Latency samples kept.
    pub latency_window: usize,
    /// Events kept.
    pub history_limit: usize,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: PING_INTERVAL,
            ping_timeout: PING_TIMEOUT,
            failure_threshold: FAILURE_THRESHOLD,
            latency_window: LATENCY_WINDOW,
            history_limit: MAX_HISTORY,
        }
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn millis(d: Duration) -> f64 {
    round1(d.as_secs_f64() * 1000.0)
}

fn ser_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(round1(d.as_secs_f64()))
}

#[allow(clippy::ref_option)] // signature fixed by serde's serialize_with
fn ser_opt_secs<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&round1(d.as_secs_f64())),
        None => s.serialize_none(),
    }
}

fn ser_millis_list<S: Serializer>(list: &[Duration], s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(list.iter().copied().map(millis))
}

/// Point-in-time copy of the monitor's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    /// Connection usable and the last check succeeded.
    pub healthy: bool,
    /// Checks performed.
    pub total_pings: u64,
    /// Checks that got a reply.
    pub successful_pings: u64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Time since the last successful check.
    #[serde(rename = "last_success_ago_s", serialize_with = "ser_opt_secs")]
    pub last_success_ago: Option<Duration>,
    /// Reconnections attempted.
    pub reconnect_attempts: u64,
    /// Recent round-trip times, oldest first.
    #[serde(rename = "latency_history_ms", serialize_with = "ser_millis_list")]
    pub latency_history: Vec<Duration>,
    /// Time since the monitor was created.
    #[serde(rename = "monitor_uptime_s", serialize_with = "ser_secs")]
    pub monitor_uptime: Duration,
    /// Configured ping interval.
    #[serde(rename = "ping_interval_s", serialize_with = "ser_secs")]
    pub ping_interval: Duration,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HealthEventKind {
    /// Ping succeeded.
    Ok {
        /// Round-trip time.
        latency_ms: f64,
    },
    /// Ping succeeded after one or more failures.
    Recovered {
        /// Round-trip time.
        latency_ms: f64,
        /// Failures that preceded it.
        consecutive_failures_before: u32,
    },
    /// Ping failed or was not possible.
    Failure {
        /// Why.
        reason: String,
        /// Failures in a row, including this one.
        consecutive_failures: u32,
    },
    /// A reconnection was attempted.
    ReconnectAttempt {
        /// Whether it succeeded.
        success: bool,
        /// Running count of attempts.
        attempt_number: u64,
        /// Failure description.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A call failed because the connection dropped.
    ConnectionLost {
        /// Why.
        reason: String,
    },
}

/// Timestamped history entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthEvent {
    /// When it was recorded.
    pub ts: DateTime<Local>,
    /// What happened.
    #[serde(flatten)]
    pub kind: HealthEventKind,
}

/// Snapshot plus recent history.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Counters at export time.
    #[serde(flatten)]
    pub status: HealthSnapshot,
    /// Oldest first.
    pub history: Vec<HealthEvent>,
}

/// Counters and history, independent of any I/O.
#[derive(Debug)]
pub struct HealthRecord {
    settings: HealthSettings,
    started_at: Instant,
    total_pings: u64,
    successful_pings: u64,
    consecutive_failures: u32,
    last_success: Option<Instant>,
    reconnect_attempts: u64,
    latencies: VecDeque<Duration>,
    history: VecDeque<HealthEvent>,
}

impl HealthRecord {
    /// Creates an empty record.
    #[must_use]
    pub fn new(settings: HealthSettings) -> Self {
        Self {
            settings,
            started_at: Instant::now(),
            total_pings: 0,
            successful_pings: 0,
            consecutive_failures: 0,
            last_success: None,
            reconnect_attempts: 0,
            latencies: VecDeque::with_capacity(settings.latency_window),
            history: VecDeque::with_capacity(settings.history_limit),
        }
    }

    /// Records a successful ping.
    pub fn record_success(&mut self, latency: Duration) {
        let before = self.consecutive_failures;
        self.total_pings += 1;
        self.successful_pings += 1;
        self.consecutive_failures = 0;
        self.last_success = Some(Instant::now());

        if self.settings.latency_window > 0 {
            if self.latencies.len() == self.settings.latency_window {
                self.latencies.pop_front();
            }
            self.latencies.push_back(latency);
        }

        let latency_ms = millis(latency);
        if before > 0 {
            info!(failures = before, latency_ms, "Host connection recovered");
            self.push(HealthEventKind::Recovered {
                latency_ms,
                consecutive_failures_before: before,
            });
        } else {
            debug!(latency_ms, "Ping ok");
            self.push(HealthEventKind::Ok { latency_ms });
        }
    }

    /// Records a failed check.
    ///
    /// Returns `true` exactly when this failure reaches the threshold, so a
    /// run of failures triggers one reconnection.
    pub fn record_failure(&mut self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.total_pings += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        warn!(
            reason = %reason,
            consecutive = self.consecutive_failures,
            "Ping failed"
        );
        self.push(HealthEventKind::Failure {
            reason,
            consecutive_failures: self.consecutive_failures,
        });
        self.consecutive_failures == self.settings.failure_threshold
    }

    /// Records the outcome of a reconnection. Success clears the failure run.
    pub fn record_reconnect_attempt(&mut self, outcome: Result<(), String>) {
        self.reconnect_attempts += 1;
        let attempt_number = self.reconnect_attempts;
        match outcome {
            Ok(()) => {
                info!(attempt = attempt_number, "Reconnect succeeded");
                self.consecutive_failures = 0;
                self.last_success = Some(Instant::now());
                self.push(HealthEventKind::ReconnectAttempt {
                    success: true,
                    attempt_number,
                    error: None,
                });
            }
            Err(error) => {
                warn!(attempt = attempt_number, error = %error, "Reconnect failed");
                self.push(HealthEventKind::ReconnectAttempt {
                    success: false,
                    attempt_number,
                    error: Some(error),
                });
            }
        }
    }

    /// Records that a call failed because the connection dropped.
    pub fn record_connection_lost(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(reason = %reason, "Connection lost");
        self.push(HealthEventKind::ConnectionLost { reason });
    }

    /// Current counters. `connected` is whether the connection is usable.
    #[must_use]
    pub fn snapshot(&self, connected: bool) -> HealthSnapshot {
        HealthSnapshot {
            healthy: connected && self.consecutive_failures == 0,
            total_pings: self.total_pings,
            successful_pings: self.successful_pings,
            consecutive_failures: self.consecutive_failures,
            last_success_ago: self.last_success.map(|at| at.elapsed()),
            reconnect_attempts: self.reconnect_attempts,
            latency_history: self.latencies.iter().copied().collect(),
            monitor_uptime: self.started_at.elapsed(),
            ping_interval: self.settings.interval,
        }
    }

    /// Recent events, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<HealthEvent> {
        self.history.iter().cloned().collect()
    }

    fn push(&mut self, kind: HealthEventKind) {
        if self.settings.history_limit == 0 {
            return;
        }
        if self.history.len() == self.settings.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(HealthEvent {
            ts: Local::now(),
            kind,
        });
    }
}

fn lock(record: &Mutex<HealthRecord>) -> MutexGuard<'_, HealthRecord> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One health check. The record lock is never held across an await.
async fn check_once(
    connection: &ConnectionManager,
    record: &Mutex<HealthRecord>,
    settings: &HealthSettings,
) {
    let failure = if connection.state().is_usable() {
        match connection.ping(settings.ping_timeout).await {
            Ok(latency) => {
                lock(record).record_success(latency);
                return;
            }
            Err(BridgeError::Timeout { .. }) => "ping_timeout".to_string(),
            Err(e) => e.to_string(),
        }
    } else {
        "not_connected".to_string()
    };

    let crossed = lock(record).record_failure(failure);
    if crossed {
        info!(
            threshold = settings.failure_threshold,
            "Failure threshold reached, reconnecting"
        );
        let outcome = connection.recover().await.map_err(|e| e.to_string());
        lock(record).record_reconnect_attempt(outcome);
    }
}

/// Background pinger bound to one connection.
///
/// Stopped on drop.
#[derive(Debug)]
pub struct HealthMonitor {
    connection: Arc<ConnectionManager>,
    settings: HealthSettings,
    record: Arc<Mutex<HealthRecord>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Creates a stopped monitor.
    #[must_use]
    pub fn new(connection: Arc<ConnectionManager>, settings: HealthSettings) -> Self {
        Self {
            connection,
            settings,
            record: Arc::new(Mutex::new(HealthRecord::new(settings))),
            task: Mutex::new(None),
        }
    }

    /// Starts the background task on the current tokio runtime. Idempotent.
    ///
    /// Returns `false` if called outside a runtime.
    pub fn start(&self) -> bool {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return true;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("Health monitor needs a tokio runtime; not started");
            return false;
        };

        let connection = Arc::clone(&self.connection);
        let record = Arc::clone(&self.record);
        let settings = self.settings;
        *task = Some(handle.spawn(async move {
            let period = settings.interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                check_once(&connection, &record, &settings).await;
            }
        }));

        info!(interval = ?self.settings.interval, "Health monitor started");
        true
    }

    /// Stops the background task. Idempotent.
    pub fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            info!("Health monitor stopped");
        }
    }

    /// Returns `true` while the background task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Performs one check now and returns the resulting snapshot.
    pub async fn check(&self) -> HealthSnapshot {
        check_once(&self.connection, &self.record, &self.settings).await;
        self.get_status()
    }

    /// Current counters. Never touches the network.
    #[must_use]
    pub fn get_status(&self) -> HealthSnapshot {
        let connected = self.connection.state().is_usable();
        lock(&self.record).snapshot(connected)
    }

    /// Counters plus recent events.
    #[must_use]
    pub fn export_report(&self) -> HealthReport {
        let connected = self.connection.state().is_usable();
        let record = lock(&self.record);
        HealthReport {
            status: record.snapshot(connected),
            history: record.history(),
        }
    }

    /// Logs a connection loss seen by a caller.
    pub fn record_connection_lost(&self, reason: impl Into<String>) {
        lock(&self.record).record_connection_lost(reason);
    }

    /// Logs a reconnection initiated outside the monitor.
    pub fn record_reconnect_attempt(&self, outcome: Result<(), String>) {
        lock(&self.record).record_reconnect_attempt(outcome);
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

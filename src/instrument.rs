//! Operation timing and outcome logging.
//!
//! [`Instrumented`] wraps a [`CommandHandler`] at registration time, and
//! [`instrument_all`] wraps every handler already in a registry; the client
//! facade uses [`observe`] directly. Both feed an [`OperationStats`]
//! sink and log according to the configured [`Verbosity`]:
//!
//! - failures are logged at `error` with their parameters, in either mode
//! - lean mode logs successes at `debug` without payloads
//! - verbose mode logs successes at `info` with parameters and a result
//!   preview

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::config::Verbosity;
use crate::host::registry::{CommandHandler, CommandRegistry, CommandResult};
use crate::protocol::Params;

/// Timing samples kept per operation.
pub const MAX_SAMPLES: usize = 100;

const PARAMS_PREVIEW: usize = 500;
const RESULT_PREVIEW: usize = 300;

#[derive(Debug, Default)]
struct Totals {
    samples: BTreeMap<String, VecDeque<Duration>>,
    calls: u64,
    errors: u64,
}

/// Shared per-operation timing sink.
#[derive(Debug)]
pub struct OperationStats {
    started_at: Instant,
    totals: Mutex<Totals>,
}

/// Timing summary for one operation, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationReport {
    /// Samples in the window.
    pub count: usize,
    /// Mean duration.
    pub avg_ms: f64,
    /// Fastest.
    pub min_ms: f64,
    /// Slowest.
    pub max_ms: f64,
    /// Most recent.
    pub last_ms: f64,
}

/// Timing summary for every operation seen.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    /// Operations recorded since creation.
    pub total_calls: u64,
    /// Of which failed.
    pub total_errors: u64,
    /// Seconds since the sink was created.
    pub uptime_secs: f64,
    /// Per-operation summaries, by name.
    pub operations: BTreeMap<String, OperationReport>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

impl OperationStats {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            totals: Mutex::new(Totals::default()),
        }
    }

    /// Records one operation.
    pub fn record(&self, operation: &str, duration: Duration, failed: bool) {
        let mut totals = self.totals();
        totals.calls += 1;
        if failed {
            totals.errors += 1;
        }
        let samples = totals.samples.entry(operation.to_string()).or_default();
        if samples.len() == MAX_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(duration);
    }

    /// Summarises the samples currently held.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // sample counts are at most MAX_SAMPLES
    pub fn report(&self) -> PerformanceReport {
        let totals = self.totals();
        let operations = totals
            .samples
            .iter()
            .filter_map(|(name, samples)| {
                let last = *samples.back()?;
                let total: Duration = samples.iter().sum();
                let min = samples.iter().min().copied().unwrap_or(last);
                let max = samples.iter().max().copied().unwrap_or(last);
                Some((
                    name.clone(),
                    OperationReport {
                        count: samples.len(),
                        avg_ms: round2(ms(total) / samples.len() as f64),
                        min_ms: round2(ms(min)),
                        max_ms: round2(ms(max)),
                        last_ms: round2(ms(last)),
                    },
                ))
            })
            .collect();

        PerformanceReport {
            total_calls: totals.calls,
            total_errors: totals.errors,
            uptime_secs: (self.started_at.elapsed().as_secs_f64() * 10.0).round() / 10.0,
            operations,
        }
    }

    fn totals(&self) -> MutexGuard<'_, Totals> {
        self.totals.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for OperationStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialises `value` and cuts it to `limit` characters.
fn preview(value: &impl Serialize, limit: usize) -> String {
    let text = serde_json::to_string(value).unwrap_or_default();
    if text.chars().count() <= limit {
        return text;
    }
    let mut cut: String = text.chars().take(limit).collect();
    cut.push_str("...");
    cut
}

/// Logs one finished operation and records its duration.
pub fn observe<E: Display>(
    operation: &str,
    verbosity: Verbosity,
    params: &Params,
    outcome: Result<&Value, &E>,
    elapsed: Duration,
    stats: &OperationStats,
) {
    stats.record(operation, elapsed, outcome.is_err());
    let duration_ms = round2(ms(elapsed));

    match (outcome, verbosity) {
        (Err(e), _) => error!(
            op = operation,
            duration_ms,
            params = %preview(params, PARAMS_PREVIEW),
            error = %e,
            "Operation failed"
        ),
        (Ok(_), Verbosity::Lean) => debug!(op = operation, duration_ms, "Operation completed"),
        (Ok(result), Verbosity::Verbose) => info!(
            op = operation,
            duration_ms,
            params = %preview(params, PARAMS_PREVIEW),
            result = %preview(result, RESULT_PREVIEW),
            "Operation completed"
        ),
    }
}

/// A handler wrapped with timing and logging.
#[derive(Debug)]
pub struct Instrumented<H> {
    name: String,
    inner: H,
    stats: Arc<OperationStats>,
    verbosity: Verbosity,
}

impl<H: CommandHandler> CommandHandler for Instrumented<H> {
    fn execute(&mut self, params: &Params) -> CommandResult {
        let started = Instant::now();
        let outcome = self.inner.execute(params);
        observe(
            &self.name,
            self.verbosity,
            params,
            outcome.as_ref(),
            started.elapsed(),
            &self.stats,
        );
        outcome
    }
}

/// Wraps `handler` so every execution is timed, logged and recorded in
/// `stats` under `name`.
pub fn instrument<H: CommandHandler>(
    name: impl Into<String>,
    handler: H,
    stats: &Arc<OperationStats>,
    verbosity: Verbosity,
) -> Instrumented<H> {
    Instrumented {
        name: name.into(),
        inner: handler,
        stats: Arc::clone(stats),
        verbosity,
    }
}

/// Wraps every handler in `registry`, built-ins included, with
/// [`instrument`].
pub fn instrument_all(
    registry: &mut CommandRegistry,
    stats: &Arc<OperationStats>,
    verbosity: Verbosity,
) {
    registry.wrap_handlers(|name, mut handler| {
        Box::new(instrument(
            name,
            move |params: &Params| -> CommandResult { handler.execute(params) },
            stats,
            verbosity,
        ))
    });
}

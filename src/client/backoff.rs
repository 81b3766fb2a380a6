//! Reconnection backoff.
//!
//! Capped doubling without jitter. Delays never decrease within a cycle.

use std::time::Duration;

/// Delay before the second connect attempt.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound on any single delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Connect attempts per reconnection cycle before giving up.
pub const MAX_ATTEMPTS: u32 = 5;

/// Bounded exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_attempts: u32,
}

impl Backoff {
    /// Creates a policy. `max` is raised to `initial` if smaller.
    #[must_use]
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max: max.max(initial),
            max_attempts,
        }
    }

    /// Delay after the `retry`-th failed attempt (0-based).
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1_u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Attempt ceiling.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delays slept between consecutive attempts of one cycle.
    #[must_use]
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts.saturating_sub(1)).map(|retry| self.delay(retry))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF, MAX_ATTEMPTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_then_caps() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5), 10);
        let delays: Vec<u64> = (0..6).map(|n| backoff.delay(n).as_secs()).collect();
        assert_eq!(delays, [1, 2, 4, 5, 5, 5]);
    }

    #[test]
    fn monotonic_up_to_cap() {
        let backoff = Backoff::default();
        let mut previous = Duration::ZERO;
        for retry in 0..64 {
            let delay = backoff.delay(retry);
            assert!(delay >= previous, "retry {retry}: {delay:?} < {previous:?}");
            assert!(delay <= MAX_BACKOFF);
            previous = delay;
        }
        assert_eq!(previous, MAX_BACKOFF);
    }

    #[test]
    fn huge_retry_counts_do_not_overflow() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn delays_between_attempts() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 4);
        let delays: Vec<Duration> = backoff.delays().collect();
        assert_eq!(
            delays,
            [100, 200, 400].map(Duration::from_millis)
        );
    }

    #[test]
    fn max_never_below_initial() {
        let backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(1), 3);
        assert_eq!(backoff.delay(0), Duration::from_secs(2));
    }
}

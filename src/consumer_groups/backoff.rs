use tokio::time::Duration;

/// Capped exponential backoff between restarts of a consumer group session.
///
/// The delay doubles at every failure, up to `max`. After `max_attempts` consecutive
/// failures no further delay is given: the failure is considered persistent.
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    initial: Duration,
    max: Duration,
    max_attempts: u32,
    failures: u32,
}

impl RestartBackoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            max_attempts,
            failures: 0,
        }
    }

    /// Record a failure, and return how long to wait before the next attempt.
    ///
    /// Returns `None` once `max_attempts` consecutive failures have been recorded.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.failures >= self.max_attempts {
            return None;
        }

        let delay = 1u32
            .checked_shl(self.failures)
            .and_then(|factor| self.initial.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max));
        self.failures += 1;

        Some(delay)
    }

    /// Consecutive failures recorded so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

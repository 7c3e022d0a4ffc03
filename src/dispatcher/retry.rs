use std::sync::Arc;

use tokio::time::{Duration, Instant};

use super::delivery::DeliveryOutcome;
use crate::kafka_types::ChannelEvent;

/// How failed deliveries to a subscriber are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_interval: Duration,

    /// Upper bound to the sum of all the retry delays of a single event
    pub max_total_retry_time: Duration,

    /// If `true`, the delay doubles at every retry; otherwise it stays at `initial_interval`
    pub exponential_backoff: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_total_retry_time: Duration::from_millis(300_000),
            exponential_backoff: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry number `retry` (0-based).
    ///
    /// With exponential backoff this is `initial_interval * 2^retry` (saturating),
    /// otherwise it's always `initial_interval`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        if !self.exponential_backoff {
            return self.initial_interval;
        }

        match 1u32.checked_shl(retry) {
            Some(factor) => self.initial_interval.checked_mul(factor).unwrap_or(Duration::MAX),
            None => Duration::MAX,
        }
    }
}

/// What to do with an event, after a delivery attempt concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Event was delivered: its offset can be committed.
    Delivered,

    /// Event should be delivered again, once the given [`Instant`] is reached.
    RetryAt(Instant),

    /// Event failed permanently, or exhausted the retry budget.
    ///
    /// It has to be reported as dead-letter, and its offset committed anyway.
    GiveUp,
}

/// In-flight delivery of an event to a subscription.
///
/// This only lives in memory, for as long as the event is being delivered:
/// nothing of it is persisted. If the process dies while retrying, the event is
/// consumed again from the last committed offset.
///
/// It's a small state machine advanced by [`Self::advance`] with the outcome of each
/// attempt and the current time: the retry timing is entirely determined by the
/// [`RetryPolicy`] and the given instants, so it's independent from any real timer.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub event: Arc<ChannelEvent>,
    pub subscription_id: String,

    /// Number of the current attempt (1-based)
    pub attempt_number: u32,

    /// When the next retry is due, if one is scheduled
    pub next_retry_at: Option<Instant>,

    /// Sum of all the retry delays scheduled so far
    scheduled_retry_time: Duration,
}

impl DeliveryAttempt {
    pub fn new(event: Arc<ChannelEvent>, subscription_id: &str) -> Self {
        Self {
            event,
            subscription_id: subscription_id.to_string(),
            attempt_number: 1,
            next_retry_at: None,
            scheduled_retry_time: Duration::ZERO,
        }
    }

    /// Sum of all the retry delays scheduled so far.
    pub fn scheduled_retry_time(&self) -> Duration {
        self.scheduled_retry_time
    }

    /// `true` if a retry is scheduled and `now` has reached it.
    pub fn is_due(&self, now: Instant) -> bool {
        self.next_retry_at.is_some_and(|at| now >= at)
    }

    /// Advance the state machine with the outcome of the current attempt.
    ///
    /// A retry is scheduled only if the cumulative retry delay, including the new one,
    /// stays within [`RetryPolicy::max_total_retry_time`]: past that point a
    /// [`DeliveryOutcome::Retryable`] is handled as if it was [`DeliveryOutcome::Permanent`].
    ///
    /// # Arguments
    ///
    /// * `outcome` - Outcome of the attempt that just concluded
    /// * `policy` - Retry policy in effect for the subscription
    /// * `now` - Current time, used as base for scheduling the next retry
    pub fn advance(
        &mut self,
        outcome: DeliveryOutcome,
        policy: &RetryPolicy,
        now: Instant,
    ) -> RetryDecision {
        self.next_retry_at = None;

        match outcome {
            DeliveryOutcome::Success => RetryDecision::Delivered,
            DeliveryOutcome::Permanent => RetryDecision::GiveUp,
            DeliveryOutcome::Retryable => {
                let delay = policy.delay_for(self.attempt_number - 1);
                let total = self.scheduled_retry_time.saturating_add(delay);
                let next = now.checked_add(delay).filter(|_| total <= policy.max_total_retry_time);
                let Some(at) = next else {
                    debug!(
                        "Retry budget of {:?} exhausted for event at offset {} (subscription '{}') after {} attempts",
                        policy.max_total_retry_time,
                        self.event.offset,
                        self.subscription_id,
                        self.attempt_number
                    );
                    return RetryDecision::GiveUp;
                };

                self.scheduled_retry_time = total;
                self.attempt_number += 1;
                self.next_retry_at = Some(at);
                RetryDecision::RetryAt(at)
            },
        }
    }
}

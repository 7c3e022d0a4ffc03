// Inner modules
mod dead_letter;
mod delivery;
mod errors;
mod retry;

use std::sync::Arc;

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry, HistogramVec,
    IntCounterVec, Registry,
};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::channel_registry::Subscription;
use crate::config_watcher::ConfigReceiver;
use crate::consumer_groups::{ConsumerSession, SessionResult};
use crate::constants::DELIVERY_TIMEOUT;
use crate::kafka_types::ChannelEvent;
use crate::prometheus_metrics::{LABEL_OUTCOME, LABEL_SUBSCRIPTION};

// Exports
pub use dead_letter::{DeadLetter, DeadLetterReason, DeadLetterReporter, HttpDeadLetterReporter};
pub use delivery::{Deliverer, DeliveryOutcome, HttpDeliverer};
pub use errors::DeliveryResult;
#[cfg(test)]
pub use errors::DeliveryError;
pub use retry::{DeliveryAttempt, RetryDecision, RetryPolicy};

const MET_DELIVERIES_NAME: &str = "dispatcher_deliveries_total";
const MET_DELIVERIES_HELP: &str = "Delivery attempts to subscribers, by outcome";
const MET_DELIVERY_DURATION_NAME: &str = "dispatcher_delivery_duration_seconds";
const MET_DELIVERY_DURATION_HELP: &str = "Duration of delivery attempts to subscribers";

/// How the dispatching of a single event concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// Delivered, or given up on (and reported): its offset can be committed.
    Committable,

    /// Interrupted by shutdown while waiting to retry: it must be consumed again.
    Interrupted,
}

/// Delivers the events consumed by each consumer group session to its subscriber.
///
/// Events of a session are delivered strictly one at a time, in the order they are received:
/// the next event is pulled only once the current one is delivered or given up on.
/// Retries wait on a timer that is interrupted when the session is stopped.
///
/// Retry policy: a [`Subscription`] can carry its own; otherwise the one of the active
/// broker configuration is used, read anew at every attempt.
pub struct Dispatcher {
    deliverer: Arc<dyn Deliverer>,
    reporter: Arc<dyn DeadLetterReporter>,
    config_rx: ConfigReceiver,

    // Prometheus Metrics
    metric_deliveries: IntCounterVec,
    metric_delivery_duration: HistogramVec,
}

impl Dispatcher {
    pub fn new(
        deliverer: Arc<dyn Deliverer>,
        reporter: Arc<dyn DeadLetterReporter>,
        config_rx: ConfigReceiver,
        metrics: Arc<Registry>,
    ) -> Self {
        Self {
            deliverer,
            reporter,
            config_rx,
            metric_deliveries: register_int_counter_vec_with_registry!(
                MET_DELIVERIES_NAME,
                MET_DELIVERIES_HELP,
                &[LABEL_SUBSCRIPTION, LABEL_OUTCOME],
                metrics
            )
            .unwrap_or_else(|e| panic!("Failed to create metric '{MET_DELIVERIES_NAME}': {e}")),
            metric_delivery_duration: register_histogram_vec_with_registry!(
                MET_DELIVERY_DURATION_NAME,
                MET_DELIVERY_DURATION_HELP,
                &[LABEL_SUBSCRIPTION],
                metrics
            )
            .unwrap_or_else(|e| panic!("Failed to create metric '{MET_DELIVERY_DURATION_NAME}': {e}")),
        }
    }

    /// Retry policy currently in effect for the given subscription.
    pub fn retry_policy_for(&self, subscription: &Subscription) -> RetryPolicy {
        subscription.retry_policy.unwrap_or_else(|| {
            self.config_rx.borrow().as_ref().map(|c| c.dispatcher.retry).unwrap_or_default()
        })
    }

    /// Make a single delivery attempt of `event` to `subscription`.
    pub async fn deliver(&self, event: &ChannelEvent, subscription: &Subscription) -> DeliveryResult<()> {
        let start = Instant::now();
        let res = self.deliverer.deliver(event, subscription).await;
        let outcome = DeliveryOutcome::from(&res);

        self.metric_delivery_duration
            .with_label_values(&[subscription.id.as_str()])
            .observe(start.elapsed().as_secs_f64());
        self.metric_deliveries.with_label_values(&[subscription.id.as_str(), outcome.as_str()]).inc();

        res
    }

    /// Deliver `event` to `subscription`, retrying for as long as its [`RetryPolicy`] allows.
    ///
    /// If the event fails permanently, or the retry budget runs out, it's handed to the
    /// [`DeadLetterReporter`] and considered done.
    ///
    /// The delivery in progress is never interrupted: `shutdown_token` only interrupts
    /// the wait between attempts.
    pub async fn dispatch(
        &self,
        event: Arc<ChannelEvent>,
        subscription: &Arc<Subscription>,
        shutdown_token: &CancellationToken,
    ) -> Dispatched {
        let mut attempt = DeliveryAttempt::new(event.clone(), &subscription.id);

        loop {
            let res = self.deliver(&event, subscription).await;
            let outcome = DeliveryOutcome::from(&res);
            let policy = self.retry_policy_for(subscription);

            match attempt.advance(outcome, &policy, Instant::now()) {
                RetryDecision::Delivered => {
                    trace!(
                        "Delivered event {}@{} to '{}' (attempt {})",
                        event.offset,
                        event.topic,
                        subscription.id,
                        attempt.attempt_number
                    );
                    return Dispatched::Committable;
                },
                RetryDecision::GiveUp => {
                    let reason = match outcome {
                        DeliveryOutcome::Permanent => DeadLetterReason::Permanent,
                        _ => DeadLetterReason::RetriesExhausted,
                    };
                    let last_error = res.err().map(|e| e.to_string()).unwrap_or_default();

                    self.reporter
                        .report(DeadLetter {
                            event,
                            subscription: subscription.clone(),
                            attempts: attempt.attempt_number,
                            reason,
                            last_error,
                        })
                        .await;
                    return Dispatched::Committable;
                },
                RetryDecision::RetryAt(at) => {
                    debug!(
                        "Retrying event {} for '{}' in {:?} (attempt {}): {}",
                        event.cloudevent_id().unwrap_or_else(|| event.offset.to_string()),
                        subscription.id,
                        at.saturating_duration_since(Instant::now()),
                        attempt.attempt_number,
                        res.err().map(|e| e.to_string()).unwrap_or_default()
                    );

                    tokio::select! {
                        _ = sleep_until(at) => {},
                        _ = shutdown_token.cancelled() => {
                            debug!(
                                "Retry of event {}@{} for '{}' interrupted by shutdown",
                                event.offset, event.topic, subscription.id
                            );
                            return Dispatched::Interrupted;
                        },
                    }
                },
            }
        }
    }

    /// Pull → deliver → commit loop of a consumer group session.
    ///
    /// Returns `Ok(())` once `shutdown_token` is cancelled, or an error as soon as the
    /// session fails. Events are marked as processed only once dispatched.
    pub async fn run_session(
        &self,
        session: &mut dyn ConsumerSession,
        subscription: Arc<Subscription>,
        shutdown_token: &CancellationToken,
    ) -> SessionResult<()> {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown_token.cancelled() => return Ok(()),
                res = session.recv() => Arc::new(res?),
            };

            match self.dispatch(event.clone(), &subscription, shutdown_token).await {
                Dispatched::Committable => session.mark_processed(&event).await?,
                Dispatched::Interrupted => return Ok(()),
            }
        }
    }
}

pub fn init(config_rx: ConfigReceiver, metrics: Arc<Registry>) -> reqwest::Result<Arc<Dispatcher>> {
    let deliverer = HttpDeliverer::new(DELIVERY_TIMEOUT)?;
    let reporter = HttpDeadLetterReporter::new(deliverer.clone(), metrics.clone());

    let dispatcher = Dispatcher::new(Arc::new(deliverer), Arc::new(reporter), config_rx, metrics);

    debug!("Initialized");
    Ok(Arc::new(dispatcher))
}

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use prometheus::{register_int_counter_vec_with_registry, IntCounterVec, Registry};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use super::delivery::HttpDeliverer;
use crate::channel_registry::Subscription;
use crate::kafka_types::ChannelEvent;
use crate::prometheus_metrics::{LABEL_REASON, LABEL_SUBSCRIPTION};

const MET_DEAD_LETTERS_NAME: &str = "dispatcher_dead_letters_total";
const MET_DEAD_LETTERS_HELP: &str = "Events given up on, after failing permanently or exhausting their retries";

/// HTTP header carrying the [`DeadLetterReason`] of dead-lettered events.
const DEAD_LETTER_REASON_HEADER: &str = "kdispatch-dead-letter-reason";

/// Why an event ended up as a [`DeadLetter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// Subscriber rejected the event in a way retrying can't fix
    Permanent,

    /// Retrying further would have exceeded the retry budget of the subscription
    RetriesExhausted,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::Permanent => "permanent",
            DeadLetterReason::RetriesExhausted => "retries_exhausted",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event that the dispatcher gave up delivering.
///
/// Its offset is committed regardless: the [`DeadLetterReporter`] is the last place where the
/// event is seen.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub event: Arc<ChannelEvent>,
    pub subscription: Arc<Subscription>,
    pub attempts: u32,
    pub reason: DeadLetterReason,
    pub last_error: String,
}

/// Collaborator that receives every [`DeadLetter`].
#[async_trait]
pub trait DeadLetterReporter: Send + Sync {
    async fn report(&self, dead_letter: DeadLetter);
}

/// Reports [`DeadLetter`]s to the dead-letter sink of their subscription, if it has one.
///
/// Without a sink, or if the sink can't be reached, the event is only logged:
/// either way it's counted in the `dispatcher_dead_letters_total` metric.
pub struct HttpDeadLetterReporter {
    deliverer: HttpDeliverer,
    metric_dead_letters: IntCounterVec,
}

impl HttpDeadLetterReporter {
    pub fn new(deliverer: HttpDeliverer, metrics: Arc<Registry>) -> Self {
        Self {
            deliverer,
            metric_dead_letters: register_int_counter_vec_with_registry!(
                MET_DEAD_LETTERS_NAME,
                MET_DEAD_LETTERS_HELP,
                &[LABEL_SUBSCRIPTION, LABEL_REASON],
                metrics
            )
            .unwrap_or_else(|e| panic!("Failed to create metric '{MET_DEAD_LETTERS_NAME}': {e}")),
        }
    }
}

#[async_trait]
impl DeadLetterReporter for HttpDeadLetterReporter {
    async fn report(&self, dl: DeadLetter) {
        let sub = &dl.subscription;
        let ev = &dl.event;
        self.metric_dead_letters.with_label_values(&[sub.id.as_str(), dl.reason.as_str()]).inc();

        let Some(sink) = &sub.dead_letter_uri else {
            error!(
                "Giving up on event {}:{}@{} for subscription '{}' after {} attempts ({}): {}",
                ev.topic, ev.partition, ev.offset, sub.id, dl.attempts, dl.reason, dl.last_error
            );
            return;
        };

        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static(DEAD_LETTER_REASON_HEADER), HeaderValue::from_static(dl.reason.as_str()));

        match self.deliverer.post(sink, ev, headers).await {
            Ok(()) => warn!(
                "Event {}:{}@{} for subscription '{}' sent to dead-letter sink after {} attempts ({})",
                ev.topic, ev.partition, ev.offset, sub.id, dl.attempts, dl.reason
            ),
            Err(e) => error!(
                "Failed to send event {}:{}@{} for subscription '{}' to dead-letter sink {sink}: {e}",
                ev.topic, ev.partition, ev.offset, sub.id
            ),
        }
    }
}

//! In-memory doubles of the Kafka brokers and of the subscribers, shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{sleep, Duration, Instant};

use crate::broker_config::BrokerConfig;
use crate::channel_registry::Subscription;
use crate::consumer_groups::{ConsumerSession, SessionError, SessionFactory, SessionResult};
use crate::dispatcher::{DeadLetter, DeadLetterReporter, Deliverer, DeliveryError, DeliveryResult};
use crate::kafka_types::ChannelEvent;

const BLOCK_ON_CONDITION_CHECK_FREQ: Duration = Duration::from_millis(10);

/// Wait until `f` returns `true`, failing the test after `timeout`.
pub async fn block_on<F, Fut>(f: F, timeout: Duration)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if f().await {
            break;
        }

        assert!(Instant::now().duration_since(start) < timeout, "Timed out waiting on desired condition");
        sleep(BLOCK_ON_CONDITION_CHECK_FREQ).await;
    }
}

/// Lifecycle events of the sessions opened against a [`MockBroker`], in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLog {
    Opened { group: String, config_version: u64 },
    Closed { group: String, committed: i64 },
}

#[derive(Debug, Default)]
struct BrokerState {
    /// Single partition log, per topic
    topics: HashMap<String, Vec<ChannelEvent>>,
    /// Next offset to consume, per group
    committed: HashMap<String, i64>,
    open: HashMap<String, usize>,
    max_open: HashMap<String, usize>,
    log: Vec<SessionLog>,
    /// If set, only sessions authenticating as this user are accepted
    accepted_user: Option<String>,
    /// Number of upcoming `open` calls that fail with a connection error
    failing_opens: u32,
    /// Sessions opened before the current epoch lose their connection
    epoch: u64,
}

/// In-memory Kafka cluster: single-partition topics, committed offsets per group.
#[derive(Debug, Default)]
pub struct MockBroker {
    state: Mutex<BrokerState>,
    appended: Notify,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append an event to `topic`, returning its offset.
    pub fn publish(&self, topic: &str, payload: &str) -> i64 {
        let offset = {
            let mut state = self.state.lock().unwrap();
            let log = state.topics.entry(topic.to_string()).or_default();
            let offset = log.len() as i64;
            log.push(ChannelEvent {
                topic: topic.to_string(),
                partition: 0,
                offset,
                payload: Some(payload.as_bytes().to_vec()),
                headers: vec![("ce_id".to_string(), format!("{topic}-{offset}").into_bytes())],
                ..Default::default()
            });
            offset
        };
        self.appended.notify_waiters();
        offset
    }

    pub fn committed(&self, group: &str) -> i64 {
        self.state.lock().unwrap().committed.get(group).copied().unwrap_or(0)
    }

    pub fn open_sessions(&self, group: &str) -> usize {
        self.state.lock().unwrap().open.get(group).copied().unwrap_or(0)
    }

    /// Highest number of sessions of `group` that were ever open at the same time.
    pub fn max_open_sessions(&self, group: &str) -> usize {
        self.state.lock().unwrap().max_open.get(group).copied().unwrap_or(0)
    }

    pub fn log(&self) -> Vec<SessionLog> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn opened_count(&self, group: &str) -> usize {
        self.log().iter().filter(|l| matches!(l, SessionLog::Opened { group: g, .. } if g == group)).count()
    }

    pub fn accept_only_user(&self, user: &str) {
        self.state.lock().unwrap().accepted_user = Some(user.to_string());
    }

    pub fn fail_next_opens(&self, count: u32) {
        self.state.lock().unwrap().failing_opens = count;
    }

    /// Make every open session fail with a connection error.
    pub fn break_connections(&self) {
        self.state.lock().unwrap().epoch += 1;
        self.appended.notify_waiters();
    }
}

#[async_trait]
impl SessionFactory for Arc<MockBroker> {
    async fn open(
        &self,
        group_id: &str,
        topic: &str,
        config: &BrokerConfig,
    ) -> SessionResult<Box<dyn ConsumerSession>> {
        let mut state = self.state.lock().unwrap();

        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(SessionError::Connection("brokers unreachable".to_string()));
        }
        if let Some(accepted) = &state.accepted_user {
            let user = config.sasl.as_ref().map(|s| s.user.as_str());
            if user != Some(accepted.as_str()) {
                return Err(SessionError::Auth(format!("SASL authentication failed for {user:?}")));
            }
        }

        let open = state.open.entry(group_id.to_string()).or_default();
        *open += 1;
        let open = *open;
        let max = state.max_open.entry(group_id.to_string()).or_default();
        *max = (*max).max(open);
        state.log.push(SessionLog::Opened {
            group: group_id.to_string(),
            config_version: config.version,
        });

        Ok(Box::new(MockSession {
            broker: self.clone(),
            group: group_id.to_string(),
            topic: topic.to_string(),
            position: state.committed.get(group_id).copied().unwrap_or(0),
            stored: None,
            epoch: state.epoch,
            closed: false,
        }))
    }
}

/// Opens sessions against a [`MockBroker`], each open taking `latency`.
pub struct SlowOpening {
    pub broker: Arc<MockBroker>,
    pub latency: Duration,
}

#[async_trait]
impl SessionFactory for SlowOpening {
    async fn open(
        &self,
        group_id: &str,
        topic: &str,
        config: &BrokerConfig,
    ) -> SessionResult<Box<dyn ConsumerSession>> {
        sleep(self.latency).await;
        self.broker.open(group_id, topic, config).await
    }
}

struct MockSession {
    broker: Arc<MockBroker>,
    group: String,
    topic: String,
    position: i64,
    stored: Option<i64>,
    epoch: u64,
    closed: bool,
}

impl MockSession {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            let mut state = self.broker.state.lock().unwrap();
            if let Some(open) = state.open.get_mut(&self.group) {
                *open -= 1;
            }
        }
    }
}

impl Drop for MockSession {
    // A session dropped without closing never commits what it stored
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl ConsumerSession for MockSession {
    async fn recv(&mut self) -> SessionResult<ChannelEvent> {
        loop {
            let appended = self.broker.appended.notified();
            {
                let state = self.broker.state.lock().unwrap();
                if state.epoch != self.epoch {
                    return Err(SessionError::Connection("connection reset by peer".to_string()));
                }
                if let Some(ev) = state.topics.get(&self.topic).and_then(|log| log.get(self.position as usize)) {
                    self.position += 1;
                    return Ok(ev.clone());
                }
            }
            appended.await;
        }
    }

    async fn mark_processed(&mut self, event: &ChannelEvent) -> SessionResult<()> {
        self.stored = Some(event.offset + 1);
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> SessionResult<()> {
        {
            let mut state = self.broker.state.lock().unwrap();
            if let Some(next) = self.stored {
                state.committed.insert(self.group.clone(), next);
            }
            let committed = state.committed.get(&self.group).copied().unwrap_or(0);
            state.log.push(SessionLog::Closed {
                group: self.group.clone(),
                committed,
            });
        }
        self.release();
        Ok(())
    }
}

/// A delivery observed by the [`ScriptedDeliverer`].
#[derive(Debug, Clone)]
pub struct DeliveryCall {
    pub subscription_id: String,
    pub offset: i64,
    pub at: Instant,
}

/// [`Deliverer`] whose results are scripted in advance.
///
/// Results are popped from the script in order; once the script is exhausted,
/// every delivery returns the fallback.
pub struct ScriptedDeliverer {
    script: Mutex<VecDeque<DeliveryResult<()>>>,
    fallback: DeliveryResult<()>,
    calls: Mutex<Vec<DeliveryCall>>,
    latency: Duration,
}

impl ScriptedDeliverer {
    pub fn always(result: DeliveryResult<()>) -> Arc<Self> {
        Self::scripted(vec![], result)
    }

    pub fn succeeding() -> Arc<Self> {
        Self::always(Ok(()))
    }

    pub fn scripted(script: Vec<DeliveryResult<()>>, fallback: DeliveryResult<()>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: Mutex::default(),
            latency: Duration::ZERO,
        })
    }

    /// A deliverer that always succeeds, taking `latency` for each delivery.
    pub fn slow(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::default(),
            fallback: Ok(()),
            calls: Mutex::default(),
            latency,
        })
    }

    pub fn calls(&self) -> Vec<DeliveryCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, subscription_id: &str) -> Vec<DeliveryCall> {
        self.calls().into_iter().filter(|c| c.subscription_id == subscription_id).collect()
    }
}

#[async_trait]
impl Deliverer for ScriptedDeliverer {
    async fn deliver(&self, event: &ChannelEvent, subscription: &Subscription) -> DeliveryResult<()> {
        self.calls.lock().unwrap().push(DeliveryCall {
            subscription_id: subscription.id.clone(),
            offset: event.offset,
            at: Instant::now(),
        });
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

pub fn retryable() -> DeliveryResult<()> {
    Err(DeliveryError::Retryable("503 Service Unavailable".to_string()))
}

pub fn permanent() -> DeliveryResult<()> {
    Err(DeliveryError::Permanent("400 Bad Request".to_string()))
}

/// [`DeadLetterReporter`] that keeps everything it's given.
#[derive(Default)]
pub struct RecordingReporter {
    reported: Mutex<Vec<DeadLetter>>,
}

impl RecordingReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reported(&self) -> Vec<DeadLetter> {
        self.reported.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterReporter for RecordingReporter {
    async fn report(&self, dead_letter: DeadLetter) {
        self.reported.lock().unwrap().push(dead_letter);
    }
}

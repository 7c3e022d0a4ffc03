use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rdkafka::{
    client::ClientContext,
    consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer},
    error::{KafkaError, RDKafkaErrorCode},
};
use tokio::sync::Notify;

use super::errors::{SessionError, SessionResult};
use super::session::{ConsumerSession, SessionFactory};
use crate::broker_config::BrokerConfig;
use crate::kafka_types::ChannelEvent;

/// Consecutive receive errors after which the session is considered disconnected.
const MAX_CONSECUTIVE_RECV_ERRORS: u32 = 10;

/// `true` if the error means the brokers rejected our credentials or permissions.
fn is_auth_error(error: &KafkaError) -> bool {
    matches!(
        error.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::Authentication
                | RDKafkaErrorCode::SaslAuthenticationFailed
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::GroupAuthorizationFailed
                | RDKafkaErrorCode::ClusterAuthorizationFailed
        )
    )
}

fn classify(error: KafkaError) -> SessionError {
    if is_auth_error(&error) {
        SessionError::Auth(error.to_string())
    } else {
        SessionError::Connection(error.to_string())
    }
}

/// Raised by the client context when librdkafka reports an authentication failure.
///
/// Those are reported asynchronously, by the background threads of librdkafka:
/// the session learns about them only through this signal.
#[derive(Debug, Default)]
struct AuthSignal {
    raised: Notify,
    reason: Mutex<Option<String>>,
}

impl AuthSignal {
    fn raise(&self, reason: String) {
        if let Ok(mut r) = self.reason.lock() {
            r.get_or_insert(reason);
        }
        self.raised.notify_one();
    }

    fn reason(&self) -> Option<String> {
        self.reason.lock().ok().and_then(|r| r.clone())
    }
}

struct SessionContext {
    group_id: String,
    auth: Arc<AuthSignal>,
}

impl ClientContext for SessionContext {
    fn error(&self, error: KafkaError, reason: &str) {
        if is_auth_error(&error) {
            error!("Consumer group '{}' failed to authenticate: {error} ({reason})", self.group_id);
            self.auth.raise(format!("{error}: {reason}"));
        } else {
            warn!("Consumer group '{}' client error: {error} ({reason})", self.group_id);
        }
    }
}

impl ConsumerContext for SessionContext {}

type SessionConsumer = StreamConsumer<SessionContext>;

/// Opens [`ConsumerSession`]s backed by an `rdkafka` [`StreamConsumer`].
#[derive(Debug, Default, Clone)]
pub struct KafkaSessionFactory {
    /// Client configuration applied on top of the one derived from the [`BrokerConfig`]
    overrides: Vec<(String, String)>,
}

impl KafkaSessionFactory {
    pub fn new(overrides: Vec<(String, String)>) -> Self {
        Self {
            overrides,
        }
    }
}

#[async_trait]
impl SessionFactory for KafkaSessionFactory {
    async fn open(
        &self,
        group_id: &str,
        topic: &str,
        config: &BrokerConfig,
    ) -> SessionResult<Box<dyn ConsumerSession>> {
        let auth = Arc::new(AuthSignal::default());
        let context = SessionContext {
            group_id: group_id.to_string(),
            auth: auth.clone(),
        };

        let mut client_config = config.consumer_client_config(group_id);
        for (k, v) in &self.overrides {
            client_config.set(k, v);
        }

        let consumer: Arc<SessionConsumer> = Arc::new(client_config.create_with_context(context).map_err(classify)?);

        // Fetching metadata is blocking: it's also where bad credentials surface first
        let (c, t, timeout) = (consumer.clone(), topic.to_string(), config.admin_timeout);
        let metadata_res = tokio::task::spawn_blocking(move || {
            c.fetch_metadata(Some(&t), timeout)
                .map(|m| m.topics().iter().find(|mt| mt.name() == t).and_then(|mt| mt.error()))
        })
        .await
        .map_err(|e| SessionError::Connection(format!("metadata fetch task failed: {e}")))?;

        if let Some(reason) = auth.reason() {
            return Err(SessionError::Auth(reason));
        }
        match metadata_res.map_err(classify)? {
            None => {},
            Some(e) => {
                return Err(SessionError::Connection(format!("topic '{topic}' not available: {e:?}")));
            },
        }

        consumer.subscribe(&[topic]).map_err(classify)?;
        debug!("Consumer group '{group_id}' subscribed to '{topic}'");

        Ok(Box::new(KafkaSession {
            consumer,
            auth,
            group_id: group_id.to_string(),
            consecutive_errors: 0,
        }))
    }
}

struct KafkaSession {
    consumer: Arc<SessionConsumer>,
    auth: Arc<AuthSignal>,
    group_id: String,
    consecutive_errors: u32,
}

#[async_trait]
impl ConsumerSession for KafkaSession {
    async fn recv(&mut self) -> SessionResult<ChannelEvent> {
        loop {
            tokio::select! {
                biased;
                _ = self.auth.raised.notified() => {
                    let reason = self.auth.reason().unwrap_or_else(|| "authentication failed".to_string());
                    return Err(SessionError::Auth(reason));
                },
                res = self.consumer.recv() => match res {
                    Ok(m) => {
                        self.consecutive_errors = 0;
                        return Ok(ChannelEvent::from(&m));
                    },
                    Err(e) if is_auth_error(&e) => return Err(SessionError::Auth(e.to_string())),
                    Err(e) => {
                        self.consecutive_errors += 1;
                        if self.consecutive_errors >= MAX_CONSECUTIVE_RECV_ERRORS {
                            return Err(SessionError::Connection(format!(
                                "{} consecutive receive errors, last: {e}",
                                self.consecutive_errors
                            )));
                        }
                        debug!("Consumer group '{}' failed to receive: {e}", self.group_id);
                    },
                },
            }
        }
    }

    async fn mark_processed(&mut self, event: &ChannelEvent) -> SessionResult<()> {
        self.consumer
            .store_offset(&event.topic, event.partition, event.offset + 1)
            .map_err(|e| SessionError::Commit(e.to_string()))
    }

    async fn close(self: Box<Self>) -> SessionResult<()> {
        let KafkaSession {
            consumer,
            group_id,
            ..
        } = *self;

        // Committing and leaving the group both block on the brokers
        tokio::task::spawn_blocking(move || {
            let res = match consumer.commit_consumer_state(CommitMode::Sync) {
                Ok(()) => Ok(()),
                Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
                Err(e) => Err(SessionError::Commit(e.to_string())),
            };
            consumer.unsubscribe();
            drop(consumer);
            debug!("Consumer group '{group_id}' session closed");
            res
        })
        .await
        .map_err(|e| SessionError::Commit(format!("close task failed: {e}")))?
    }
}

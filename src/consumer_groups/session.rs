use async_trait::async_trait;

use super::errors::SessionResult;
use crate::broker_config::BrokerConfig;
use crate::kafka_types::ChannelEvent;

/// Live membership of a consumer group, consuming the Topic backing a channel.
///
/// Events are received one at a time. An event is committed only once it's
/// marked as processed: anything received but not marked is consumed again
/// by the next session of the same group.
#[async_trait]
pub trait ConsumerSession: Send {
    /// Next event of the Topic.
    ///
    /// Cancel-safe: it can be raced against a shutdown signal without losing events.
    async fn recv(&mut self) -> SessionResult<ChannelEvent>;

    /// Mark `event` as processed, making its offset eligible for commit.
    async fn mark_processed(&mut self, event: &ChannelEvent) -> SessionResult<()>;

    /// Commit the processed offsets, leave the group and release the connection.
    ///
    /// The session is consumed even if committing fails.
    async fn close(self: Box<Self>) -> SessionResult<()>;
}

/// Opens [`ConsumerSession`]s.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Join the consumer group `group_id`, consuming `topic` with the given broker configuration.
    ///
    /// Fails with [`super::errors::SessionError::Auth`] if the credentials are rejected,
    /// and with [`super::errors::SessionError::Connection`] for any other failure.
    async fn open(
        &self,
        group_id: &str,
        topic: &str,
        config: &BrokerConfig,
    ) -> SessionResult<Box<dyn ConsumerSession>>;
}

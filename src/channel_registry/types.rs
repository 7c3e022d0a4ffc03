use std::fmt;

use reqwest::Url;

use crate::constants::CONSUMER_GROUP_ID_PREFIX;
use crate::dispatcher::RetryPolicy;

/// Identity of a channel: a namespaced name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelRef {
    pub namespace: String,
    pub name: String,
}

impl ChannelRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Name of the Kafka Topic backing this channel.
    ///
    /// # Arguments
    ///
    /// * `prefix` - Prefix shared by all the channel Topics
    pub fn topic_name(&self, prefix: &str) -> String {
        format!("{prefix}.{}.{}", self.namespace, self.name)
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A subscriber of a channel.
///
/// Every event published to the channel is delivered to `endpoint`, via the subscription's
/// own Consumer Group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    /// Unique identifier of the subscription
    pub id: String,

    /// Channel the subscription consumes
    pub channel: ChannelRef,

    /// Where events are delivered
    pub endpoint: Url,

    /// Where events that could not be delivered are sent, if anywhere
    pub dead_letter_uri: Option<Url>,

    /// Retry policy of this subscription.
    ///
    /// If `None`, the dispatcher default (from the active broker configuration) applies.
    pub retry_policy: Option<RetryPolicy>,
}

impl Subscription {
    pub fn new(id: impl Into<String>, channel: ChannelRef, endpoint: Url) -> Self {
        Self {
            id: id.into(),
            channel,
            endpoint,
            dead_letter_uri: None,
            retry_policy: None,
        }
    }

    /// Identifier of the Consumer Group of this subscription.
    ///
    /// It depends on the subscription identifier only: every session for the
    /// same subscription joins the same group, and resumes from its committed offsets.
    pub fn group_id(&self) -> String {
        format!("{CONSUMER_GROUP_ID_PREFIX}{}", self.id)
    }
}

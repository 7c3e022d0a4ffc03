use chrono::{DateTime, TimeZone, Utc};
use rdkafka::message::{BorrowedMessage, Headers, Message};

/// Header carrying the content type of a binary-mode CloudEvent.
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// Prefix of Kafka headers carrying the attributes of a binary-mode CloudEvent.
pub const CLOUDEVENT_HEADER_PREFIX: &str = "ce_";

/// An event read from the Kafka Topic backing a channel.
///
/// This is a `Send`-able, owned copy of a consumed Kafka record:
/// it can travel across the delivery (and retry) pipeline of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelEvent {
    /// Topic the event was read from
    pub topic: String,
    /// Partition of the Topic
    pub partition: i32,
    /// Offset of the event within the Partition
    pub offset: i64,
    /// Record key, if any
    pub key: Option<Vec<u8>>,
    /// Record payload, if any
    pub payload: Option<Vec<u8>>,
    /// Record headers, in the order they were produced
    pub headers: Vec<(String, Vec<u8>)>,
    /// When the record was created (or appended to the log), if known
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChannelEvent {
    /// Value of the first header with the given name, if present.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_slice())
    }

    /// The CloudEvent `id` attribute, if the event carries one.
    pub fn cloudevent_id(&self) -> Option<String> {
        self.header("ce_id").map(|v| String::from_utf8_lossy(v).into_owned())
    }
}

impl From<&BorrowedMessage<'_>> for ChannelEvent {
    fn from(m: &BorrowedMessage<'_>) -> Self {
        let headers = match m.headers() {
            Some(hs) => hs
                .iter()
                .map(|h| (h.key.to_string(), h.value.map(|v| v.to_vec()).unwrap_or_default()))
                .collect(),
            None => Vec::new(),
        };

        ChannelEvent {
            topic: m.topic().to_string(),
            partition: m.partition(),
            offset: m.offset(),
            key: m.key().map(|k| k.to_vec()),
            payload: m.payload().map(|p| p.to_vec()),
            headers,
            timestamp: m
                .timestamp()
                .to_millis()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        }
    }
}

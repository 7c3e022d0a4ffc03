use std::fmt;

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    Client, StatusCode, Url,
};
use tokio::time::Duration;

use super::errors::{DeliveryError, DeliveryResult};
use crate::channel_registry::Subscription;
use crate::kafka_types::{ChannelEvent, CLOUDEVENT_HEADER_PREFIX, CONTENT_TYPE_HEADER};

/// HTTP header prefix of CloudEvents attributes, in binary content mode.
const CLOUDEVENT_HTTP_HEADER_PREFIX: &str = "ce-";

/// Result of a single attempt to deliver an event to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryOutcome {
    Success,
    Retryable,
    Permanent,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Success => "success",
            DeliveryOutcome::Retryable => "retryable",
            DeliveryOutcome::Permanent => "permanent",
        }
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<T> From<&DeliveryResult<T>> for DeliveryOutcome {
    fn from(res: &DeliveryResult<T>) -> Self {
        match res {
            Ok(_) => DeliveryOutcome::Success,
            Err(e) => e.outcome(),
        }
    }
}

/// Something able to deliver a [`ChannelEvent`] to a [`Subscription`] endpoint.
#[async_trait]
pub trait Deliverer: Send + Sync {
    /// Make one attempt at delivering `event` to `subscription`.
    async fn deliver(&self, event: &ChannelEvent, subscription: &Subscription) -> DeliveryResult<()>;
}

/// Classify the HTTP response status of a subscriber.
///
/// | Status                | Outcome     |
/// |-----------------------|-------------|
/// | 2xx                   | `Success`   |
/// | 408, 429, 5xx         | `Retryable` |
/// | anything else         | `Permanent` |
pub fn classify_status(status: StatusCode) -> DeliveryOutcome {
    if status.is_success() {
        DeliveryOutcome::Success
    } else if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        DeliveryOutcome::Retryable
    } else {
        DeliveryOutcome::Permanent
    }
}

/// Delivers events as HTTP `POST` requests, in CloudEvents binary content mode.
///
/// The event payload is the request body; Kafka headers `ce_<attr>` become HTTP headers
/// `ce-<attr>`, and `content-type` is forwarded as is. Other Kafka headers are not forwarded.
#[derive(Debug, Clone)]
pub struct HttpDeliverer {
    client: Client,
}

impl HttpDeliverer {
    /// Create a new [`HttpDeliverer`]
    ///
    /// # Arguments
    ///
    /// * `timeout` - Timeout of each request, from connection to the end of the response
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
        })
    }

    /// `POST` an event to the given URL.
    ///
    /// Connection failures and timeouts are [`DeliveryError::Retryable`];
    /// a response is classified with [`classify_status`].
    pub async fn post(&self, url: &Url, event: &ChannelEvent, extra_headers: HeaderMap) -> DeliveryResult<()> {
        let mut headers = forwarded_headers(event);
        headers.extend(extra_headers);

        let res = self
            .client
            .post(url.clone())
            .headers(headers)
            .body(event.payload.clone().unwrap_or_default())
            .send()
            .await;

        let response = match res {
            Ok(r) => r,
            Err(e) if e.is_builder() => {
                return Err(DeliveryError::Permanent(format!("invalid request to {url}: {e}")));
            },
            Err(e) => {
                return Err(DeliveryError::Retryable(format!("request to {url} failed: {e}")));
            },
        };

        let status = response.status();
        match classify_status(status) {
            DeliveryOutcome::Success => Ok(()),
            DeliveryOutcome::Retryable => Err(DeliveryError::Retryable(format!("{url} responded {status}"))),
            DeliveryOutcome::Permanent => Err(DeliveryError::Permanent(format!("{url} responded {status}"))),
        }
    }
}

#[async_trait]
impl Deliverer for HttpDeliverer {
    async fn deliver(&self, event: &ChannelEvent, subscription: &Subscription) -> DeliveryResult<()> {
        self.post(&subscription.endpoint, event, HeaderMap::new()).await
    }
}

fn forwarded_headers(event: &ChannelEvent) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in &event.headers {
        let http_name = if let Some(attr) = name.strip_prefix(CLOUDEVENT_HEADER_PREFIX) {
            format!("{CLOUDEVENT_HTTP_HEADER_PREFIX}{attr}")
        } else if name.eq_ignore_ascii_case(CONTENT_TYPE_HEADER) {
            CONTENT_TYPE.to_string()
        } else {
            continue;
        };

        match (HeaderName::from_bytes(http_name.as_bytes()), HeaderValue::from_bytes(value)) {
            (Ok(n), Ok(v)) => {
                headers.insert(n, v);
            },
            _ => {
                warn!(
                    "Dropping header '{name}' of event {}:{}@{}: not a valid HTTP header",
                    event.topic, event.partition, event.offset
                );
            },
        }
    }

    headers
}

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    path::PathBuf,
};

use reqwest::Url;
use serde::Deserialize;
use tokio::{
    fs,
    sync::mpsc,
    task::JoinHandle,
    time::{interval, Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use super::errors::{RegistryError, RegistryResult};
use super::types::{ChannelRef, Subscription};
use crate::dispatcher::RetryPolicy;
use crate::internals::Emitter;

const CHANNEL_SIZE: usize = 1;

/// Desired subscriptions of every channel, as declared by the control plane.
pub type DesiredState = Vec<(ChannelRef, Vec<Subscription>)>;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DesiredStateFile {
    #[serde(default)]
    channels: Vec<ChannelEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChannelEntry {
    namespace: String,
    name: String,
    #[serde(default)]
    subscriptions: Vec<SubscriptionEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubscriptionEntry {
    id: String,
    subscriber_uri: String,
    dead_letter_sink_uri: Option<String>,
    retry: Option<RetryEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetryEntry {
    initial_interval_millis: u64,
    max_total_retry_millis: u64,
    #[serde(default = "default_exponential_backoff")]
    exponential_backoff: bool,
}

fn default_exponential_backoff() -> bool {
    true
}

fn parse_url(id: &str, field: &str, value: &str) -> RegistryResult<Url> {
    Url::parse(value).map_err(|e| {
        RegistryError::InvalidDesiredState(format!("subscription '{id}' has invalid {field}: {e}"))
    })
}

/// Parse the YAML document describing the [`DesiredState`].
///
/// ```yaml
/// channels:
///   - namespace: default
///     name: orders
///     subscriptions:
///       - id: 8c5b9a57-billing
///         subscriber_uri: http://billing.default.svc.cluster.local/
///         dead_letter_sink_uri: http://dlq.default.svc.cluster.local/
///         retry:
///           initial_interval_millis: 500
///           max_total_retry_millis: 300000
///           exponential_backoff: true
/// ```
pub fn parse_desired_state(content: &str) -> RegistryResult<DesiredState> {
    let file: DesiredStateFile =
        serde_yaml::from_str(content).map_err(|e| RegistryError::InvalidDesiredState(e.to_string()))?;

    let mut desired = DesiredState::with_capacity(file.channels.len());
    for ch in file.channels {
        let channel = ChannelRef::new(ch.namespace, ch.name);

        if desired.iter().any(|(c, _)| *c == channel) {
            return Err(RegistryError::InvalidDesiredState(format!("channel '{channel}' is declared twice")));
        }

        let mut subscriptions = Vec::with_capacity(ch.subscriptions.len());
        for s in ch.subscriptions {
            let endpoint = parse_url(&s.id, "subscriber_uri", &s.subscriber_uri)?;
            let dead_letter_uri = match s.dead_letter_sink_uri {
                Some(uri) => Some(parse_url(&s.id, "dead_letter_sink_uri", &uri)?),
                None => None,
            };
            let retry_policy = match s.retry {
                Some(r) if r.initial_interval_millis == 0 => {
                    return Err(RegistryError::InvalidDesiredState(format!(
                        "subscription '{}' has a zero retry interval",
                        s.id
                    )));
                },
                Some(r) => Some(RetryPolicy {
                    initial_interval: Duration::from_millis(r.initial_interval_millis),
                    max_total_retry_time: Duration::from_millis(r.max_total_retry_millis),
                    exponential_backoff: r.exponential_backoff,
                }),
                None => None,
            };

            let mut sub = Subscription::new(s.id, channel.clone(), endpoint);
            sub.dead_letter_uri = dead_letter_uri;
            sub.retry_policy = retry_policy;
            subscriptions.push(sub);
        }

        desired.push((channel, subscriptions));
    }

    Ok(desired)
}

/// Emits the [`DesiredState`] read from a YAML file, every time its content changes.
///
/// Content that fails to parse is logged and skipped: nothing is emitted until the file
/// changes again.
///
/// It shuts down when the provided [`CancellationToken`] is cancelled.
pub struct DesiredStateEmitter {
    path: PathBuf,
    poll_interval: Duration,
}

impl DesiredStateEmitter {
    pub fn new(path: PathBuf, poll_interval: Duration) -> Self {
        Self {
            path,
            poll_interval,
        }
    }
}

impl Emitter for DesiredStateEmitter {
    type Emitted = DesiredState;

    fn spawn(
        &self,
        shutdown_token: CancellationToken,
    ) -> (mpsc::Receiver<Self::Emitted>, JoinHandle<()>) {
        let (sx, rx) = mpsc::channel::<Self::Emitted>(CHANNEL_SIZE);

        let path = self.path.clone();
        let poll_interval = self.poll_interval;

        let join_handle = tokio::spawn(async move {
            let mut interval = interval(poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_hash: Option<u64> = None;

            loop {
                tokio::select! {
                    _ = interval.tick() => {},
                    _ = shutdown_token.cancelled() => {
                        info!("Shutting down");
                        break;
                    },
                }

                let content = match fs::read_to_string(&path).await {
                    Ok(c) => c,
                    Err(e) => {
                        if last_hash.is_some() {
                            warn!("Failed to read desired state {}: {e}", path.display());
                        } else {
                            debug!("Desired state {} not readable yet: {e}", path.display());
                        }
                        continue;
                    },
                };

                let mut hasher = DefaultHasher::new();
                content.hash(&mut hasher);
                let hash = hasher.finish();
                if last_hash == Some(hash) {
                    continue;
                }
                last_hash = Some(hash);

                let desired = match parse_desired_state(&content) {
                    Ok(d) => d,
                    Err(e) => {
                        error!("Ignoring desired state {}: {e}", path.display());
                        continue;
                    },
                };

                debug!("Desired state changed: {} channels", desired.len());
                tokio::select! {
                    res = Self::emit(&sx, desired) => {
                        if let Err(e) = res {
                            error!("Failed to emit {}: {e}", std::any::type_name::<DesiredState>());
                            break;
                        }
                    },
                    _ = shutdown_token.cancelled() => {
                        info!("Shutting down");
                        break;
                    },
                }
            }
        });

        (rx, join_handle)
    }
}

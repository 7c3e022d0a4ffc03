use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use prometheus::{register_int_gauge_with_registry, IntGauge, Registry};
use regex::Regex;
use tokio::sync::{watch, RwLock};

use super::errors::{RegistryError, RegistryResult};
use super::types::{ChannelRef, Subscription};

const MET_CHANNELS_NAME: &str = "registry_channels_total";
const MET_CHANNELS_HELP: &str = "Channels with at least one subscription";
const MET_SUBSCRIPTIONS_NAME: &str = "registry_subscriptions_total";
const MET_SUBSCRIPTIONS_HELP: &str = "Subscriptions across all channels";

/// Subscriptions, indexed (and ordered) by identifier.
pub type SubscriptionsById = BTreeMap<String, Arc<Subscription>>;

/// Point-in-time copy of all the subscriptions in the [`ChannelRegistry`].
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    /// Revision of the registry this snapshot was taken at
    pub revision: u64,

    /// All subscriptions, of all channels
    pub subscriptions: SubscriptionsById,
}

fn subscription_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,200}$")
            .unwrap_or_else(|e| panic!("Invalid subscription id regex: {e}"))
    })
}

#[derive(Debug, Default)]
struct RegistryMap {
    revision: u64,
    channels: HashMap<ChannelRef, SubscriptionsById>,
}

/// Authoritative map of channels to their subscriptions.
///
/// It's only ever changed by [`Self::apply_desired_state`], called by the control plane;
/// every change bumps the registry revision, which can be observed via [`Self::subscribe`].
///
/// It exposes the accessor methods via an async interface,
/// while dealing internally with concurrency and synchronization.
#[derive(Debug)]
pub struct ChannelRegistry {
    map: RwLock<RegistryMap>,
    revision_tx: watch::Sender<u64>,

    // Prometheus Metrics
    metric_channels: IntGauge,
    metric_subscriptions: IntGauge,
}

impl ChannelRegistry {
    pub fn new(metrics: Arc<Registry>) -> Self {
        let (revision_tx, _) = watch::channel(0);

        Self {
            map: RwLock::new(RegistryMap::default()),
            revision_tx,
            metric_channels: register_int_gauge_with_registry!(
                MET_CHANNELS_NAME,
                MET_CHANNELS_HELP,
                metrics
            )
            .unwrap_or_else(|e| panic!("Failed to create metric '{MET_CHANNELS_NAME}': {e}")),
            metric_subscriptions: register_int_gauge_with_registry!(
                MET_SUBSCRIPTIONS_NAME,
                MET_SUBSCRIPTIONS_HELP,
                metrics
            )
            .unwrap_or_else(|e| panic!("Failed to create metric '{MET_SUBSCRIPTIONS_NAME}': {e}")),
        }
    }

    /// Replace the subscriptions of a channel.
    ///
    /// An empty `subscriptions` removes the channel.
    /// Returns `true` if the registry changed as a result.
    ///
    /// The whole desired state is rejected, leaving the registry untouched, if any subscription
    /// has an invalid identifier, declares a different channel, is duplicated, or has
    /// the same identifier of a subscription of another channel.
    ///
    /// # Arguments
    ///
    /// * `channel` - Channel whose subscriptions are being set
    /// * `subscriptions` - The complete set of subscriptions the channel should have
    pub async fn apply_desired_state(
        &self,
        channel: ChannelRef,
        subscriptions: Vec<Subscription>,
    ) -> RegistryResult<bool> {
        let mut desired = SubscriptionsById::new();
        for s in subscriptions {
            if !subscription_id_regex().is_match(&s.id) {
                return Err(RegistryError::InvalidSubscriptionId(s.id));
            }
            if s.channel != channel {
                return Err(RegistryError::ChannelMismatch {
                    id: s.id,
                    declared: s.channel.to_string(),
                    given: channel.to_string(),
                });
            }
            if desired.contains_key(&s.id) {
                return Err(RegistryError::DuplicateSubscription(s.id));
            }
            desired.insert(s.id.clone(), Arc::new(s));
        }

        let mut w_guard = self.map.write().await;

        if let Some((owner, id)) = w_guard
            .channels
            .iter()
            .filter(|(c, _)| **c != channel)
            .find_map(|(c, subs)| desired.keys().find(|id| subs.contains_key(*id)).map(|id| (c, id)))
        {
            return Err(RegistryError::SubscriptionConflict {
                id: id.clone(),
                owner: owner.to_string(),
            });
        }

        let current = w_guard.channels.get(&channel);
        let unchanged = match current {
            None => desired.is_empty(),
            Some(subs) => *subs == desired,
        };
        if unchanged {
            trace!("Desired state of channel '{channel}' unchanged");
            return Ok(false);
        }

        info!("Channel '{channel}' now has {} subscriptions", desired.len());
        if desired.is_empty() {
            w_guard.channels.remove(&channel);
        } else {
            w_guard.channels.insert(channel, desired);
        }
        w_guard.revision += 1;

        self.metric_channels.set(w_guard.channels.len() as i64);
        self.metric_subscriptions.set(w_guard.channels.values().map(|s| s.len() as i64).sum());
        self.revision_tx.send_replace(w_guard.revision);

        Ok(true)
    }

    /// Snapshot of all the subscriptions.
    pub async fn snapshot(&self) -> RegistrySnapshot {
        self.snapshot_with(|| ()).await.0
    }

    /// Snapshot of all the subscriptions, paired with the result of `f`.
    ///
    /// `f` is invoked while the registry is read-locked: whatever `f` reads is read
    /// together with the snapshot, and no change to the registry can happen in-between.
    pub async fn snapshot_with<T>(&self, f: impl FnOnce() -> T) -> (RegistrySnapshot, T) {
        let r_guard = self.map.read().await;
        let value = f();

        let snapshot = RegistrySnapshot {
            revision: r_guard.revision,
            subscriptions: r_guard
                .channels
                .values()
                .flat_map(|subs| subs.iter().map(|(id, s)| (id.clone(), s.clone())))
                .collect(),
        };

        (snapshot, value)
    }

    /// All the channels with at least one subscription.
    pub async fn get_channels(&self) -> HashSet<ChannelRef> {
        self.map.read().await.channels.keys().cloned().collect()
    }

    /// Subscriptions of a specific channel.
    pub async fn get_subscriptions(&self, channel: &ChannelRef) -> Vec<Arc<Subscription>> {
        self.map
            .read()
            .await
            .channels
            .get(channel)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Current revision: it increases every time the registry changes.
    pub async fn get_revision(&self) -> u64 {
        self.map.read().await.revision
    }

    /// Subscribe to changes of the registry revision.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision_tx.subscribe()
    }
}

use std::sync::Arc;

use prometheus::{
    register_int_counter_with_registry, register_int_gauge_with_registry, IntCounter, IntGauge,
    Registry,
};
use tokio::sync::watch;

use crate::broker_config::{parse_broker_config, BrokerConfig, ConfigResult, RawSettings};
use crate::internals::Awaitable;

const MET_VERSION_NAME: &str = "config_version";
const MET_VERSION_HELP: &str = "Version of the broker configuration currently active";
const MET_ACCEPTED_NAME: &str = "config_updates_accepted_total";
const MET_ACCEPTED_HELP: &str = "Settings updates that became the active broker configuration";
const MET_REJECTED_NAME: &str = "config_updates_rejected_total";
const MET_REJECTED_HELP: &str = "Settings updates rejected because invalid";

/// Receiving end of the active [`BrokerConfig`] notifications.
///
/// It's `None` until the first valid settings are received.
pub type ConfigReceiver = watch::Receiver<Option<Arc<BrokerConfig>>>;

/// Turns raw settings into versioned [`BrokerConfig`]s, and publishes them.
///
/// This is the single writer of the active configuration: it publishes via a [`watch`] channel,
/// so any number of readers always observe the latest configuration, and never act on an
/// older one that got superseded before they got to it.
pub struct ConfigWatcher {
    config_tx: watch::Sender<Option<Arc<BrokerConfig>>>,
    last_version: u64,

    // Prometheus Metrics
    metric_version: IntGauge,
    metric_accepted: IntCounter,
    metric_rejected: IntCounter,
}

impl ConfigWatcher {
    pub fn new(metrics: Arc<Registry>) -> Self {
        let (config_tx, _) = watch::channel(None);

        Self {
            config_tx,
            last_version: 0,
            metric_version: register_int_gauge_with_registry!(MET_VERSION_NAME, MET_VERSION_HELP, metrics)
                .unwrap_or_else(|e| panic!("Failed to create metric '{MET_VERSION_NAME}': {e}")),
            metric_accepted: register_int_counter_with_registry!(
                MET_ACCEPTED_NAME,
                MET_ACCEPTED_HELP,
                metrics
            )
            .unwrap_or_else(|e| panic!("Failed to create metric '{MET_ACCEPTED_NAME}': {e}")),
            metric_rejected: register_int_counter_with_registry!(
                MET_REJECTED_NAME,
                MET_REJECTED_HELP,
                metrics
            )
            .unwrap_or_else(|e| panic!("Failed to create metric '{MET_REJECTED_NAME}': {e}")),
        }
    }

    /// Subscribe to the active [`BrokerConfig`].
    pub fn subscribe(&self) -> ConfigReceiver {
        self.config_tx.subscribe()
    }

    /// The active [`BrokerConfig`], if any.
    pub fn current(&self) -> Option<Arc<BrokerConfig>> {
        self.config_tx.borrow().clone()
    }

    /// Handle a change of the settings.
    ///
    /// The settings are parsed and validated into a [`BrokerConfig`] candidate:
    ///
    /// * if invalid, the error is returned and the active configuration is left untouched
    /// * if it carries the same settings as the active configuration, the active one is returned
    ///   and nothing is published
    /// * otherwise the candidate gets the next version, and is published as the active configuration
    ///
    /// # Arguments
    ///
    /// * `raw_settings` - Settings, as received from the settings source
    pub fn on_config_change(&mut self, raw_settings: &RawSettings) -> ConfigResult<Arc<BrokerConfig>> {
        let mut candidate = match parse_broker_config(raw_settings) {
            Ok(c) => c,
            Err(e) => {
                self.metric_rejected.inc();
                return Err(e);
            },
        };

        if let Some(current) = self.current() {
            if current.same_settings(&candidate) {
                debug!("Settings changed, but broker configuration v{} is unaffected", current.version);
                return Ok(current);
            }
        }

        self.last_version += 1;
        candidate.version = self.last_version;
        let accepted = Arc::new(candidate);

        self.config_tx.send_replace(Some(accepted.clone()));
        self.metric_accepted.inc();
        self.metric_version.set(accepted.version as i64);

        info!("Broker configuration updated: {}", accepted);
        Ok(accepted)
    }
}

/// Read-only access to the active [`BrokerConfig`].
#[derive(Debug, Clone)]
pub struct ActiveConfig {
    config_rx: ConfigReceiver,
}

impl ActiveConfig {
    pub fn new(config_rx: ConfigReceiver) -> Self {
        Self {
            config_rx,
        }
    }

    /// The active [`BrokerConfig`], if any.
    pub fn current(&self) -> Option<Arc<BrokerConfig>> {
        self.config_rx.borrow().clone()
    }

    /// Version of the active [`BrokerConfig`], or `0` if there is none yet.
    pub fn version(&self) -> u64 {
        self.config_rx.borrow().as_ref().map(|c| c.version).unwrap_or(0)
    }

    /// A new receiver, notified every time the active [`BrokerConfig`] changes.
    pub fn subscribe(&self) -> ConfigReceiver {
        self.config_rx.clone()
    }
}

impl Awaitable for ActiveConfig {
    const NAME: &'static str = "broker configuration";

    /// [`Self`] is ready once a valid configuration has been received.
    async fn is_ready(&self) -> bool {
        self.config_rx.borrow().is_some()
    }
}

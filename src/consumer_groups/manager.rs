use std::collections::HashMap;
use std::sync::Arc;

use prometheus::{
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry, Registry,
};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use super::backoff::RestartBackoff;
use super::handle::{ConsumerGroupHandle, ConsumerGroupStatus, GroupMetrics, StatusCell, StatusChange};
use super::session::SessionFactory;
use crate::broker_config::BrokerConfig;
use crate::channel_registry::{Subscription, SubscriptionsById};
use crate::constants::{
    CONNECTION_FAILURES_WARN_THRESHOLD, RESTART_BACKOFF_INITIAL, RESTART_BACKOFF_MAX,
    RESTART_MAX_ATTEMPTS, SESSION_START_WAIT_TIMEOUT,
};
use crate::dispatcher::Dispatcher;
use crate::prometheus_metrics::{LABEL_REASON, LABEL_STATUS, LABEL_SUBSCRIPTION};

const STATUS_CHANGES_CHANNEL_SIZE: usize = 256;

const MET_STATUS_NAME: &str = "consumer_group_status";
const MET_STATUS_HELP: &str = "Status of the consumer group of each subscription (1 for the current status)";
const MET_RESTARTS_NAME: &str = "consumer_group_restarts_total";
const MET_RESTARTS_HELP: &str = "Restarts of consumer group sessions, after a failure";
const MET_FAILURES_NAME: &str = "consumer_group_failures_total";
const MET_FAILURES_HELP: &str = "Consumer groups that entered the failed status, by reason";

const FAILURE_REASON_AUTH: &str = "auth";
const FAILURE_REASON_CONNECTION: &str = "connection";
const FAILURE_REASON_PERSISTENT: &str = "persistent";

/// Summary of a live consumer group, as exposed over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    pub subscription_id: String,
    pub group_id: String,
    pub channel: String,
    pub status: String,
    pub config_version: u64,
    pub created_at: String,
}

/// Owns the consumer groups: exactly one per active subscription.
///
/// Each consumer group runs in its own task: it opens a session (via a [`SessionFactory`]),
/// and hands it to the [`Dispatcher`]. Sessions that fail are restarted with capped exponential
/// backoff; authentication failures are terminal until a new broker configuration arrives.
pub struct ConsumerGroupManager {
    factory: Arc<dyn SessionFactory>,
    dispatcher: Arc<Dispatcher>,
    topic_prefix: String,

    handles: RwLock<HashMap<String, ConsumerGroupHandle>>,

    /// Reconciliations (and shutdown) happen one at a time
    reconcile_lock: Mutex<()>,

    changes_tx: broadcast::Sender<StatusChange>,
    metrics: GroupMetrics,
}

impl ConsumerGroupManager {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        dispatcher: Arc<Dispatcher>,
        topic_prefix: String,
        metrics: Arc<Registry>,
    ) -> Self {
        let (changes_tx, _) = broadcast::channel(STATUS_CHANGES_CHANNEL_SIZE);

        Self {
            factory,
            dispatcher,
            topic_prefix,
            handles: RwLock::new(HashMap::new()),
            reconcile_lock: Mutex::new(()),
            changes_tx,
            metrics: GroupMetrics {
                status: register_int_gauge_vec_with_registry!(
                    MET_STATUS_NAME,
                    MET_STATUS_HELP,
                    &[LABEL_SUBSCRIPTION, LABEL_STATUS],
                    metrics
                )
                .unwrap_or_else(|e| panic!("Failed to create metric '{MET_STATUS_NAME}': {e}")),
                restarts: register_int_counter_vec_with_registry!(
                    MET_RESTARTS_NAME,
                    MET_RESTARTS_HELP,
                    &[LABEL_SUBSCRIPTION],
                    metrics
                )
                .unwrap_or_else(|e| panic!("Failed to create metric '{MET_RESTARTS_NAME}': {e}")),
                failures: register_int_counter_vec_with_registry!(
                    MET_FAILURES_NAME,
                    MET_FAILURES_HELP,
                    &[LABEL_SUBSCRIPTION, LABEL_REASON],
                    metrics
                )
                .unwrap_or_else(|e| panic!("Failed to create metric '{MET_FAILURES_NAME}': {e}")),
            },
        }
    }

    /// Listen to every status change of every consumer group.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StatusChange> {
        self.changes_tx.subscribe()
    }

    /// Bring the consumer groups in line with the `desired` subscriptions and `config`.
    ///
    /// * groups of subscriptions no longer desired are stopped
    /// * groups of new subscriptions are started
    /// * groups whose subscription changed, or whose connection settings are stale,
    ///   are stopped and then started again, one at a time: the next group is touched
    ///   only once the replacement of the previous one has left [`ConsumerGroupStatus::Starting`]
    /// * groups that failed are started again, if `config` is a newer version
    ///   than the one they failed with
    ///
    /// Everything else is left untouched.
    pub async fn reconcile(&self, desired: &SubscriptionsById, config: &Arc<BrokerConfig>) {
        let _guard = self.reconcile_lock.lock().await;

        let current: Vec<(String, Arc<Subscription>, Arc<BrokerConfig>, ConsumerGroupStatus)> = self
            .handles
            .read()
            .await
            .iter()
            .map(|(id, h)| (id.clone(), h.subscription.clone(), h.config.clone(), h.status()))
            .collect();

        for (id, ..) in current.iter().filter(|(id, ..)| !desired.contains_key(id)) {
            info!("Subscription '{id}' removed");
            self.stop_locked(id).await;
        }

        for (id, sub) in desired {
            let Some((_, cur_sub, cur_config, cur_status)) = current.iter().find(|(cur_id, ..)| cur_id == id)
            else {
                info!("Subscription '{id}' added");
                self.start_locked(sub.clone(), config.clone()).await;
                continue;
            };

            let restart_reason = if cur_sub != sub {
                Some("subscription changed")
            } else if cur_config.requires_reconnect(config) {
                Some("connection settings changed")
            } else if *cur_status == ConsumerGroupStatus::Failed && cur_config.version < config.version {
                Some("new configuration after failure")
            } else {
                None
            };

            match restart_reason {
                Some(reason) => {
                    info!(
                        "Restarting consumer group of '{id}' (v{} → v{}): {reason}",
                        cur_config.version, config.version
                    );
                    self.stop_locked(id).await;
                    self.start_locked(sub.clone(), config.clone()).await;
                    self.await_started(id).await;
                },
                None if cur_config.version != config.version => {
                    if let Some(h) = self.handles.write().await.get_mut(id) {
                        h.config = config.clone();
                    }
                },
                None => {},
            }
        }
    }

    /// Stop the consumer group of a subscription.
    ///
    /// Idempotent: stopping an unknown (or already stopped) subscription is a no-op.
    pub async fn stop(&self, subscription_id: &str) {
        let _guard = self.reconcile_lock.lock().await;
        self.stop_locked(subscription_id).await;
    }

    /// Stop every consumer group: all of them are signalled first, then awaited.
    pub async fn shutdown(&self) {
        let _guard = self.reconcile_lock.lock().await;

        let handles: Vec<ConsumerGroupHandle> = self.handles.write().await.drain().map(|(_, h)| h).collect();
        info!("Stopping {} consumer groups", handles.len());

        for h in &handles {
            h.begin_stop();
        }
        for h in handles {
            h.finish_stop().await;
        }
    }

    pub async fn get_status(&self, subscription_id: &str) -> Option<ConsumerGroupStatus> {
        self.handles.read().await.get(subscription_id).map(|h| h.status())
    }

    pub async fn get_config_version(&self, subscription_id: &str) -> Option<u64> {
        self.handles.read().await.get(subscription_id).map(|h| h.config.version)
    }

    pub async fn get_groups_count(&self) -> usize {
        self.handles.read().await.len()
    }

    pub async fn get_groups(&self) -> Vec<GroupSummary> {
        let mut groups: Vec<GroupSummary> = self
            .handles
            .read()
            .await
            .values()
            .map(|h| GroupSummary {
                subscription_id: h.subscription.id.clone(),
                group_id: h.group_id.clone(),
                channel: h.subscription.channel.to_string(),
                status: h.status().to_string(),
                config_version: h.config.version,
                created_at: h.created_at.to_rfc3339(),
            })
            .collect();
        groups.sort_by(|a, b| a.subscription_id.cmp(&b.subscription_id));
        groups
    }

    async fn stop_locked(&self, subscription_id: &str) {
        let Some(handle) = self.handles.write().await.remove(subscription_id) else {
            debug!("No consumer group for '{subscription_id}': nothing to stop");
            return;
        };
        handle.stop().await;
    }

    async fn start_locked(&self, subscription: Arc<Subscription>, config: Arc<BrokerConfig>) {
        let status = Arc::new(StatusCell::new(
            &subscription.id,
            config.version,
            self.changes_tx.clone(),
            self.metrics.clone(),
        ));
        let shutdown_token = CancellationToken::new();
        let interrupt_token = CancellationToken::new();

        // Before spawning: a stop issued right away must find the group Starting
        status.transition(ConsumerGroupStatus::Starting);

        let worker = tokio::spawn(run_worker(Worker {
            factory: self.factory.clone(),
            dispatcher: self.dispatcher.clone(),
            subscription: subscription.clone(),
            topic: subscription.channel.topic_name(&self.topic_prefix),
            config: config.clone(),
            status: status.clone(),
            shutdown_token: shutdown_token.clone(),
            interrupt_token: interrupt_token.clone(),
        }));

        let handle =
            ConsumerGroupHandle::new(subscription.clone(), config, status, shutdown_token, interrupt_token, worker);
        self.handles.write().await.insert(subscription.id.clone(), handle);
    }

    async fn await_started(&self, subscription_id: &str) {
        let Some(mut status_rx) = self.handles.read().await.get(subscription_id).map(|h| h.watch_status())
        else {
            return;
        };

        let started = timeout(SESSION_START_WAIT_TIMEOUT, status_rx.wait_for(|s| *s != ConsumerGroupStatus::Starting))
            .await
            .map(|res| res.map(|s| *s));
        match started {
            Ok(Ok(s)) => debug!("Consumer group of '{subscription_id}' restarted: {s}"),
            Ok(Err(_)) => {},
            Err(_) => warn!(
                "Consumer group of '{subscription_id}' still starting after {SESSION_START_WAIT_TIMEOUT:?}: moving on"
            ),
        }
    }
}

struct Worker {
    factory: Arc<dyn SessionFactory>,
    dispatcher: Arc<Dispatcher>,
    subscription: Arc<Subscription>,
    topic: String,
    config: Arc<BrokerConfig>,
    status: Arc<StatusCell>,
    shutdown_token: CancellationToken,
    interrupt_token: CancellationToken,
}

impl Worker {
    fn fail(&self, reason: &str) {
        self.status.metrics().failures.with_label_values(&[self.subscription.id.as_str(), reason]).inc();
        self.status.transition(ConsumerGroupStatus::Failed);
    }
}

/// Open a session, run it until stopped, and restart it whenever it fails.
async fn run_worker(w: Worker) {
    let id = w.subscription.id.as_str();
    let group_id = w.subscription.group_id();
    let mut backoff = RestartBackoff::new(RESTART_BACKOFF_INITIAL, RESTART_BACKOFF_MAX, RESTART_MAX_ATTEMPTS);

    loop {
        if !w.status.transition(ConsumerGroupStatus::Starting) && w.status.get() != ConsumerGroupStatus::Starting {
            // Stopping
            return;
        }

        let opened = tokio::select! {
            biased;
            _ = w.shutdown_token.cancelled() => return,
            res = w.factory.open(&group_id, &w.topic, &w.config) => res,
        };

        let failure = match opened {
            Ok(mut session) => {
                info!("Consumer group '{group_id}' consuming '{}' (config v{})", w.topic, w.config.version);
                backoff.reset();
                w.status.transition(ConsumerGroupStatus::Running);

                let res = tokio::select! {
                    biased;
                    _ = w.interrupt_token.cancelled() => {
                        warn!("Consumer group '{group_id}' interrupted: in-flight event left uncommitted");
                        Ok(())
                    },
                    res = w.dispatcher.run_session(session.as_mut(), w.subscription.clone(), &w.shutdown_token) => res,
                };

                // Processed offsets are committed even if the session failed
                if let Err(e) = session.close().await {
                    warn!("Consumer group '{group_id}' failed to commit offsets on close: {e}");
                }

                match res {
                    Ok(()) => return,
                    Err(e) => e,
                }
            },
            Err(e) => e,
        };

        if failure.is_auth() {
            error!("Consumer group '{group_id}' of '{id}' failed to authenticate: {failure} (waiting for new configuration)");
            w.fail(FAILURE_REASON_AUTH);
            return;
        }

        let Some(delay) = backoff.next_delay() else {
            error!(
                "Consumer group '{group_id}' of '{id}' failed {} times in a row, giving up until new configuration: {failure}",
                backoff.failures()
            );
            w.fail(FAILURE_REASON_PERSISTENT);
            return;
        };

        if backoff.failures() >= CONNECTION_FAILURES_WARN_THRESHOLD {
            warn!(
                "Consumer group '{group_id}' failed {} times in a row, restarting in {delay:?}: {failure}",
                backoff.failures()
            );
        } else {
            debug!("Consumer group '{group_id}' failed, restarting in {delay:?}: {failure}");
        }

        // A session that was running goes through Failed before starting again
        if w.status.get() == ConsumerGroupStatus::Running {
            w.fail(FAILURE_REASON_CONNECTION);
        }
        w.status.metrics().restarts.with_label_values(&[id]).inc();

        tokio::select! {
            _ = sleep(delay) => {},
            _ = w.shutdown_token.cancelled() => return,
        }
    }
}

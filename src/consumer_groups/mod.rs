// Inner modules
mod backoff;
mod errors;
mod handle;
mod kafka_session;
mod manager;
mod session;

use std::sync::Arc;

use prometheus::Registry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel_registry::ChannelRegistry;
use crate::config_watcher::ActiveConfig;
use crate::dispatcher::Dispatcher;

// Exports
pub use errors::SessionResult;
#[cfg(test)]
pub use errors::SessionError;
pub use kafka_session::KafkaSessionFactory;
pub use manager::ConsumerGroupManager;
pub use session::{ConsumerSession, SessionFactory};

/// Create the [`ConsumerGroupManager`], and spawn the task that keeps it reconciled.
///
/// Every time the [`ChannelRegistry`] or the active configuration change, a snapshot of the
/// subscriptions is taken together with the latest configuration, and reconciled.
/// Nothing is started until a first valid configuration is active.
///
/// Once `shutdown_token` is cancelled, every consumer group is stopped.
pub fn init(
    factory: Arc<dyn SessionFactory>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ChannelRegistry>,
    active_config: &ActiveConfig,
    topic_prefix: String,
    shutdown_token: CancellationToken,
    metrics: Arc<Registry>,
) -> (Arc<ConsumerGroupManager>, JoinHandle<()>) {
    let manager = Arc::new(ConsumerGroupManager::new(factory, dispatcher, topic_prefix, metrics));

    let mut config_rx = active_config.subscribe();
    let mut registry_rx = registry.subscribe();

    let manager_clone = manager.clone();
    let join = tokio::spawn(async move {
        debug!("Begin reconciling consumer groups");

        loop {
            registry_rx.borrow_and_update();
            let (snapshot, config) = registry.snapshot_with(|| config_rx.borrow_and_update().clone()).await;

            match config {
                Some(c) => {
                    trace!(
                        "Reconciling {} subscriptions (registry r{}) with config v{}",
                        snapshot.subscriptions.len(),
                        snapshot.revision,
                        c.version
                    );
                    manager_clone.reconcile(&snapshot.subscriptions, &c).await;
                },
                None => debug!("No broker configuration yet: nothing to reconcile"),
            }

            tokio::select! {
                res = config_rx.changed() => if res.is_err() {
                    info!("Configuration watcher stopped: breaking (internal) loop");
                    break;
                },
                res = registry_rx.changed() => if res.is_err() {
                    info!("Channel registry dropped: breaking (internal) loop");
                    break;
                },
                _ = shutdown_token.cancelled() => {
                    info!("Shutting down");
                    break;
                },
            }
        }

        manager_clone.shutdown().await;
    });

    debug!("Initialized");
    (manager, join)
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use prometheus::Registry;
    use reqwest::Url;
    use tokio::sync::{broadcast, watch};
    use tokio::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    use super::handle::{ConsumerGroupStatus, StatusChange};
    use super::{init, ConsumerGroupManager, SessionFactory};
    use crate::broker_config::{make_config, BrokerConfig};
    use crate::channel_registry::{ChannelRef, ChannelRegistry, Subscription, SubscriptionsById};
    use crate::config_watcher::ActiveConfig;
    use crate::constants::{DEFAULT_TOPIC_PREFIX, SESSION_STOP_TIMEOUT};
    use crate::dispatcher::Dispatcher;
    use crate::testing::{block_on, MockBroker, RecordingReporter, ScriptedDeliverer, SessionLog, SlowOpening};
    use ConsumerGroupStatus::*;

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        broker: Arc<MockBroker>,
        deliverer: Arc<ScriptedDeliverer>,
        manager: Arc<ConsumerGroupManager>,
        metrics: Arc<Registry>,
        _config_tx: watch::Sender<Option<Arc<BrokerConfig>>>,
    }

    fn fixture(deliverer: Arc<ScriptedDeliverer>) -> Fixture {
        fixture_with(deliverer, |broker| Arc::new(broker))
    }

    fn fixture_with(
        deliverer: Arc<ScriptedDeliverer>,
        factory: impl FnOnce(Arc<MockBroker>) -> Arc<dyn SessionFactory>,
    ) -> Fixture {
        let broker = MockBroker::new();
        let metrics = Arc::new(Registry::new());
        let (config_tx, config_rx) = watch::channel(None);
        let dispatcher = Arc::new(Dispatcher::new(deliverer.clone(), RecordingReporter::new(), config_rx, metrics.clone()));
        let manager = Arc::new(ConsumerGroupManager::new(
            factory(broker.clone()),
            dispatcher,
            DEFAULT_TOPIC_PREFIX.to_string(),
            metrics.clone(),
        ));

        Fixture {
            broker,
            deliverer,
            manager,
            metrics,
            _config_tx: config_tx,
        }
    }

    fn status_gauge(metrics: &Registry, subscription: &str, status: &str) -> i64 {
        let has_label = |m: &prometheus::proto::Metric, name: &str, value: &str| {
            m.get_label().iter().any(|l| l.get_name() == name && l.get_value() == value)
        };

        metrics
            .gather()
            .iter()
            .filter(|mf| mf.get_name() == "consumer_group_status")
            .flat_map(|mf| mf.get_metric().iter())
            .find(|m| has_label(m, "subscription", subscription) && has_label(m, "status", status))
            .map(|m| m.get_gauge().get_value() as i64)
            .unwrap_or(0)
    }

    fn ch1() -> ChannelRef {
        ChannelRef::new("default", "ch1")
    }

    fn topic() -> String {
        ch1().topic_name(DEFAULT_TOPIC_PREFIX)
    }

    fn desired(ids: &[&str]) -> SubscriptionsById {
        ids.iter()
            .map(|id| {
                let url = Url::parse(&format!("http://{id}.default.svc.cluster.local/")).unwrap();
                (id.to_string(), Arc::new(Subscription::new(*id, ch1(), url)))
            })
            .collect()
    }

    async fn all_have_status(manager: &ConsumerGroupManager, ids: &[&str], status: ConsumerGroupStatus) -> bool {
        for id in ids {
            if manager.get_status(id).await != Some(status) {
                return false;
            }
        }
        true
    }

    fn drain(rx: &mut broadcast::Receiver<StatusChange>) -> Vec<StatusChange> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn should_stop_only_removed_subscription() {
        let f = fixture(ScriptedDeliverer::succeeding());
        let config = Arc::new(make_config(1, "alice"));

        f.manager.reconcile(&desired(&["s1", "s2", "s3"]), &config).await;
        block_on(|| all_have_status(&f.manager, &["s1", "s2", "s3"], Running), WAIT).await;

        f.broker.publish(&topic(), "before");
        block_on(|| async { f.deliverer.calls().len() == 3 }, WAIT).await;

        let mut changes_rx = f.manager.subscribe_changes();
        f.manager.reconcile(&desired(&["s1", "s3"]), &config).await;

        let steps: Vec<_> = drain(&mut changes_rx).into_iter().map(|c| (c.subscription_id, c.from, c.to)).collect();
        assert_eq!(
            steps,
            vec![("s2".to_string(), Running, Stopping), ("s2".to_string(), Stopping, Stopped)]
        );
        assert_eq!(f.manager.get_status("s2").await, None);
        assert!(all_have_status(&f.manager, &["s1", "s3"], Running).await);

        // The others kept consuming, from the same session
        f.broker.publish(&topic(), "after");
        block_on(|| async { f.deliverer.calls().len() == 5 }, WAIT).await;
        assert_eq!(f.deliverer.calls_for("s2").len(), 1);
        for group in ["kafka.s1", "kafka.s3"] {
            assert_eq!(f.broker.opened_count(group), 1);
        }
        assert_eq!(f.broker.committed("kafka.s2"), 1);
        assert_eq!(f.broker.open_sessions("kafka.s2"), 0);

        f.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn should_stop_idempotently() {
        let f = fixture(ScriptedDeliverer::succeeding());
        f.manager.reconcile(&desired(&["s1"]), &Arc::new(make_config(1, "alice"))).await;
        block_on(|| all_have_status(&f.manager, &["s1"], Running), WAIT).await;

        f.manager.stop("s1").await;
        f.manager.stop("s1").await;
        f.manager.stop("never-existed").await;

        assert_eq!(f.manager.get_status("s1").await, None);
        assert_eq!(f.manager.get_groups_count().await, 0);
        assert_eq!(f.broker.open_sessions("kafka.s1"), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn should_rotate_credentials_one_group_at_a_time() {
        let f = fixture(ScriptedDeliverer::succeeding());
        let ids = ["s1", "s2", "s3"];
        let groups = ["kafka.s1", "kafka.s2", "kafka.s3"];

        f.broker.accept_only_user("alice");
        f.manager.reconcile(&desired(&ids), &Arc::new(make_config(1, "alice"))).await;
        block_on(|| all_have_status(&f.manager, &ids, Running), WAIT).await;

        for n in 0..3 {
            f.broker.publish(&topic(), &format!("event-{n}"));
        }
        block_on(|| async { f.deliverer.calls().len() == 9 }, WAIT).await;

        // Credentials rotate: brokers accept only the new ones
        f.broker.accept_only_user("bob");
        f.manager.reconcile(&desired(&ids), &Arc::new(make_config(2, "bob"))).await;
        block_on(|| all_have_status(&f.manager, &ids, Running), WAIT).await;
        for id in ids {
            assert_eq!(f.manager.get_config_version(id).await, Some(2));
        }

        for n in 3..5 {
            f.broker.publish(&topic(), &format!("event-{n}"));
        }
        block_on(|| async { f.deliverer.calls().len() == 15 }, WAIT).await;

        // Every group resumed from its committed offset: no event skipped, none delivered twice
        for id in ids {
            let offsets: Vec<i64> = f.deliverer.calls_for(id).iter().map(|c| c.offset).collect();
            assert_eq!(offsets, vec![0, 1, 2, 3, 4], "subscription '{id}'");
        }

        // Never two sessions of the same group, and groups restarted one after the other
        for g in groups {
            assert_eq!(f.broker.max_open_sessions(g), 1);
        }
        let rotation: Vec<SessionLog> = f
            .broker
            .log()
            .into_iter()
            .skip_while(|l| !matches!(l, SessionLog::Closed { .. }))
            .collect();
        let expected: Vec<SessionLog> = groups
            .iter()
            .flat_map(|g| {
                [
                    SessionLog::Closed {
                        group: g.to_string(),
                        committed: 3,
                    },
                    SessionLog::Opened {
                        group: g.to_string(),
                        config_version: 2,
                    },
                ]
            })
            .collect();
        assert_eq!(rotation, expected);

        f.manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn should_wait_for_each_replacement_to_open_during_rotation() {
        let f = fixture_with(ScriptedDeliverer::succeeding(), |broker| {
            Arc::new(SlowOpening {
                broker,
                latency: Duration::from_millis(300),
            })
        });
        let ids = ["s1", "s2", "s3"];

        f.broker.accept_only_user("alice");
        f.manager.reconcile(&desired(&ids), &Arc::new(make_config(1, "alice"))).await;
        block_on(|| all_have_status(&f.manager, &ids, Running), WAIT).await;

        f.broker.accept_only_user("bob");
        f.manager.reconcile(&desired(&ids), &Arc::new(make_config(2, "bob"))).await;

        // By the time reconcile returns, every group was replaced, one after the other
        let rotation: Vec<SessionLog> = f
            .broker
            .log()
            .into_iter()
            .skip_while(|l| !matches!(l, SessionLog::Closed { .. }))
            .collect();
        let expected: Vec<SessionLog> = ["kafka.s1", "kafka.s2", "kafka.s3"]
            .iter()
            .flat_map(|g| {
                [
                    SessionLog::Closed {
                        group: g.to_string(),
                        committed: 0,
                    },
                    SessionLog::Opened {
                        group: g.to_string(),
                        config_version: 2,
                    },
                ]
            })
            .collect();
        assert_eq!(rotation, expected);
        assert!(all_have_status(&f.manager, &ids, Running).await);

        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn should_reach_stopped_when_stopped_before_the_worker_ran() {
        let f = fixture(ScriptedDeliverer::succeeding());
        let mut changes_rx = f.manager.subscribe_changes();

        f.manager.reconcile(&desired(&["s1"]), &Arc::new(make_config(1, "alice"))).await;
        f.manager.stop("s1").await;

        let steps: Vec<_> = drain(&mut changes_rx).into_iter().map(|c| (c.from, c.to)).collect();
        assert_eq!(steps, vec![(Stopped, Starting), (Starting, Stopping), (Stopping, Stopped)]);
        assert_eq!(f.broker.opened_count("kafka.s1"), 0);
        assert_eq!(status_gauge(&f.metrics, "s1", "starting"), 0);
        assert_eq!(status_gauge(&f.metrics, "s1", "stopped"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_interrupt_slow_delivery_on_stop_and_redeliver_it() {
        let f = fixture(ScriptedDeliverer::slow(Duration::from_secs(60)));
        let config = Arc::new(make_config(1, "alice"));

        f.manager.reconcile(&desired(&["s1"]), &config).await;
        block_on(|| all_have_status(&f.manager, &["s1"], Running), WAIT).await;
        f.broker.publish(&topic(), "stuck");
        block_on(|| async { f.deliverer.calls().len() == 1 }, WAIT).await;

        let start = Instant::now();
        f.manager.stop("s1").await;
        assert!(start.elapsed() <= SESSION_STOP_TIMEOUT + Duration::from_millis(100));

        // Closed before returning, without committing the interrupted event
        assert_eq!(f.broker.open_sessions("kafka.s1"), 0);
        assert_eq!(f.broker.committed("kafka.s1"), 0);
        assert_eq!(
            f.broker.log().last(),
            Some(&SessionLog::Closed {
                group: "kafka.s1".to_string(),
                committed: 0,
            })
        );

        f.manager.reconcile(&desired(&["s1"]), &config).await;
        block_on(|| async { f.deliverer.calls().len() == 2 }, WAIT).await;
        let offsets: Vec<i64> = f.deliverer.calls_for("s1").iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 0]);
        assert_eq!(f.broker.max_open_sessions("kafka.s1"), 1);

        f.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn should_not_restart_on_dispatcher_only_changes() {
        let f = fixture(ScriptedDeliverer::succeeding());
        f.manager.reconcile(&desired(&["s1"]), &Arc::new(make_config(1, "alice"))).await;
        block_on(|| all_have_status(&f.manager, &["s1"], Running), WAIT).await;

        let mut retuned = make_config(2, "alice");
        retuned.dispatcher.retry.initial_interval = Duration::from_millis(50);
        f.manager.reconcile(&desired(&["s1"]), &Arc::new(retuned)).await;

        assert_eq!(f.manager.get_config_version("s1").await, Some(2));
        assert_eq!(f.manager.get_status("s1").await, Some(Running));
        assert_eq!(f.broker.opened_count("kafka.s1"), 1);

        f.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn should_fail_on_auth_error_until_new_config() {
        let f = fixture(ScriptedDeliverer::succeeding());
        f.broker.accept_only_user("bob");

        let config = Arc::new(make_config(1, "alice"));
        f.manager.reconcile(&desired(&["s1", "s2"]), &config).await;
        block_on(|| all_have_status(&f.manager, &["s1", "s2"], Failed), WAIT).await;

        // Same config again: still failed, no new attempt
        f.manager.reconcile(&desired(&["s1", "s2"]), &config).await;
        assert_eq!(f.manager.get_status("s1").await, Some(Failed));

        f.manager.reconcile(&desired(&["s1", "s2"]), &Arc::new(make_config(2, "bob"))).await;
        block_on(|| all_have_status(&f.manager, &["s1", "s2"], Running), WAIT).await;

        f.manager.shutdown().await;
        assert_eq!(f.manager.get_groups_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_restart_with_backoff_after_connection_failures() {
        let f = fixture(ScriptedDeliverer::succeeding());
        f.broker.fail_next_opens(2);

        f.manager.reconcile(&desired(&["s1"]), &Arc::new(make_config(1, "alice"))).await;
        block_on(|| all_have_status(&f.manager, &["s1"], Running), Duration::from_secs(10)).await;

        // A running session losing its connection goes through Failed, then starts again
        let mut changes_rx = f.manager.subscribe_changes();
        f.broker.break_connections();
        block_on(|| async { f.broker.opened_count("kafka.s1") == 2 }, Duration::from_secs(10)).await;
        block_on(|| all_have_status(&f.manager, &["s1"], Running), Duration::from_secs(10)).await;

        let steps: Vec<_> = drain(&mut changes_rx).into_iter().map(|c| (c.from, c.to)).collect();
        assert_eq!(steps, vec![(Running, Failed), (Failed, Starting), (Starting, Running)]);

        f.manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn should_give_up_after_persistent_failures() {
        let f = fixture(ScriptedDeliverer::succeeding());
        f.broker.fail_next_opens(u32::MAX);

        f.manager.reconcile(&desired(&["s1"]), &Arc::new(make_config(1, "alice"))).await;
        block_on(|| all_have_status(&f.manager, &["s1"], Failed), Duration::from_secs(600)).await;
        assert_eq!(f.broker.opened_count("kafka.s1"), 0);

        f.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn should_reconcile_on_registry_and_config_changes() {
        let deliverer = ScriptedDeliverer::succeeding();
        let broker = MockBroker::new();
        let metrics = Arc::new(Registry::new());
        let (config_tx, config_rx) = watch::channel(None);
        let active_config = ActiveConfig::new(config_rx.clone());
        let dispatcher = Arc::new(Dispatcher::new(deliverer.clone(), RecordingReporter::new(), config_rx, metrics.clone()));
        let registry = Arc::new(ChannelRegistry::new(metrics.clone()));
        let token = CancellationToken::new();

        let (manager, join) = init(
            Arc::new(broker.clone()),
            dispatcher,
            registry.clone(),
            &active_config,
            DEFAULT_TOPIC_PREFIX.to_string(),
            token.clone(),
            metrics,
        );

        let subs: Vec<Subscription> = desired(&["s1", "s2"]).into_values().map(|s| (*s).clone()).collect();
        registry.apply_desired_state(ch1(), subs).await.unwrap();

        // No configuration yet: nothing starts
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.get_groups_count().await, 0);

        config_tx.send_replace(Some(Arc::new(make_config(1, "alice"))));
        block_on(|| all_have_status(&manager, &["s1", "s2"], Running), WAIT).await;

        registry.apply_desired_state(ch1(), vec![]).await.unwrap();
        block_on(|| async { manager.get_groups_count().await == 0 }, WAIT).await;

        registry
            .apply_desired_state(ch1(), desired(&["s3"]).into_values().map(|s| (*s).clone()).collect())
            .await
            .unwrap();
        block_on(|| all_have_status(&manager, &["s3"], Running), WAIT).await;

        token.cancel();
        join.await.unwrap();
        assert_eq!(manager.get_groups_count().await, 0);
        assert_eq!(broker.open_sessions("kafka.s3"), 0);
    }
}

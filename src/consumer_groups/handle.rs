use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use prometheus::{IntCounterVec, IntGaugeVec};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::broker_config::BrokerConfig;
use crate::channel_registry::Subscription;
use crate::constants::SESSION_STOP_TIMEOUT;

/// Lifecycle status of a consumer group.
///
/// ```text
///   Stopped ──▶ Starting ──▶ Running ──▶ Stopping ──▶ Stopped
///                 │  ▲          │           ▲
///                 ▼  │          │           │
///                Failed ◀───────┘───────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerGroupStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ConsumerGroupStatus {
    pub const ALL: [ConsumerGroupStatus; 5] = [
        ConsumerGroupStatus::Starting,
        ConsumerGroupStatus::Running,
        ConsumerGroupStatus::Stopping,
        ConsumerGroupStatus::Stopped,
        ConsumerGroupStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerGroupStatus::Starting => "starting",
            ConsumerGroupStatus::Running => "running",
            ConsumerGroupStatus::Stopping => "stopping",
            ConsumerGroupStatus::Stopped => "stopped",
            ConsumerGroupStatus::Failed => "failed",
        }
    }

    /// `true` if moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: ConsumerGroupStatus) -> bool {
        use ConsumerGroupStatus::*;

        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Failed, Starting)
                | (Failed, Stopping)
        )
    }
}

impl fmt::Display for ConsumerGroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition of a consumer group from one status to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub subscription_id: String,
    pub from: ConsumerGroupStatus,
    pub to: ConsumerGroupStatus,
    pub config_version: u64,
}

/// Metrics shared by all the consumer groups.
#[derive(Debug, Clone)]
pub(super) struct GroupMetrics {
    pub status: IntGaugeVec,
    pub restarts: IntCounterVec,
    pub failures: IntCounterVec,
}

/// Status of a consumer group, shared between its handle and its worker task.
///
/// Every change goes through [`Self::transition`], which enforces the legal transitions,
/// and is published to the watchers of the status and to the [`StatusChange`] listeners.
#[derive(Debug)]
pub(super) struct StatusCell {
    subscription_id: String,
    config_version: u64,
    tx: watch::Sender<ConsumerGroupStatus>,
    changes_tx: broadcast::Sender<StatusChange>,
    metrics: GroupMetrics,
}

impl StatusCell {
    pub fn new(
        subscription_id: &str,
        config_version: u64,
        changes_tx: broadcast::Sender<StatusChange>,
        metrics: GroupMetrics,
    ) -> Self {
        let (tx, _) = watch::channel(ConsumerGroupStatus::Stopped);
        let cell = Self {
            subscription_id: subscription_id.to_string(),
            config_version,
            tx,
            changes_tx,
            metrics,
        };
        cell.update_metric(ConsumerGroupStatus::Stopped);
        cell
    }

    pub fn get(&self) -> ConsumerGroupStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConsumerGroupStatus> {
        self.tx.subscribe()
    }

    /// Move to `next`, if legal from the current status.
    ///
    /// Returns `false`, leaving the status untouched, if the transition is not legal.
    pub fn transition(&self, next: ConsumerGroupStatus) -> bool {
        let mut from = None;
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                from = Some(*current);
                *current = next;
                true
            } else {
                false
            }
        });

        let Some(from) = from else {
            trace!(
                "Consumer group of '{}' ignored transition {} → {next}",
                self.subscription_id,
                self.get()
            );
            return false;
        };

        debug!("Consumer group of '{}': {from} → {next}", self.subscription_id);
        self.update_metric(next);
        // No listeners is fine
        let _ = self.changes_tx.send(StatusChange {
            subscription_id: self.subscription_id.clone(),
            from,
            to: next,
            config_version: self.config_version,
        });
        true
    }

    fn update_metric(&self, current: ConsumerGroupStatus) {
        for s in ConsumerGroupStatus::ALL {
            self.metrics
                .status
                .with_label_values(&[self.subscription_id.as_str(), s.as_str()])
                .set(i64::from(s == current));
        }
    }

    pub fn metrics(&self) -> &GroupMetrics {
        &self.metrics
    }
}

/// A live consumer group of a [`Subscription`], bound to one [`BrokerConfig`].
///
/// Handles are never updated in place: when the subscription or the connection settings
/// change, the handle is stopped and replaced by a new one.
#[derive(Debug)]
pub struct ConsumerGroupHandle {
    pub subscription: Arc<Subscription>,
    pub group_id: String,
    pub config: Arc<BrokerConfig>,
    pub created_at: DateTime<Utc>,

    status: Arc<StatusCell>,
    shutdown_token: CancellationToken,
    /// Interrupts the in-flight delivery of a worker that doesn't stop in time
    interrupt_token: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl ConsumerGroupHandle {
    pub(super) fn new(
        subscription: Arc<Subscription>,
        config: Arc<BrokerConfig>,
        status: Arc<StatusCell>,
        shutdown_token: CancellationToken,
        interrupt_token: CancellationToken,
        worker: JoinHandle<()>,
    ) -> Self {
        Self {
            group_id: subscription.group_id(),
            subscription,
            config,
            created_at: Utc::now(),
            status,
            shutdown_token,
            interrupt_token,
            worker: Some(worker),
        }
    }

    pub fn status(&self) -> ConsumerGroupStatus {
        self.status.get()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConsumerGroupStatus> {
        self.status.subscribe()
    }

    /// Signal the worker to stop: it stops receiving, and wraps up the in-flight delivery.
    pub(super) fn begin_stop(&self) {
        self.status.transition(ConsumerGroupStatus::Stopping);
        self.shutdown_token.cancel();
    }

    /// Wait for the worker to conclude.
    ///
    /// A worker still delivering after [`SESSION_STOP_TIMEOUT`] has its delivery interrupted:
    /// the event stays uncommitted and is consumed again by the next session of the group.
    /// The session is always closed before this returns, so that the next session never
    /// overlaps with it.
    pub(super) async fn finish_stop(mut self) {
        if let Some(mut worker) = self.worker.take() {
            let res = match timeout(SESSION_STOP_TIMEOUT, &mut worker).await {
                Ok(res) => res,
                Err(_) => {
                    warn!(
                        "Consumer group '{}' did not stop within {SESSION_STOP_TIMEOUT:?}: interrupting delivery",
                        self.group_id
                    );
                    self.interrupt_token.cancel();
                    worker.await
                },
            };
            if let Err(e) = res {
                error!("Consumer group '{}' worker failed: {e}", self.group_id);
            }
        }

        self.status.transition(ConsumerGroupStatus::Stopped);
        info!("Consumer group '{}' stopped", self.group_id);
    }

    pub(super) async fn stop(self) {
        self.begin_stop();
        self.finish_stop().await;
    }
}

impl Drop for ConsumerGroupHandle {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

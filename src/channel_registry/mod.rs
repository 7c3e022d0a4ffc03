// Inner modules
mod emitter;
mod errors;
mod register;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use prometheus::Registry;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::internals::Emitter;

// Exports
pub use emitter::{DesiredState, DesiredStateEmitter};
pub use errors::RegistryError;
pub use register::{ChannelRegistry, SubscriptionsById};
pub use types::{ChannelRef, Subscription};

/// Apply a complete [`DesiredState`] to the registry.
///
/// Channels known to the registry but absent from `desired` lose all their subscriptions.
/// A channel whose desired subscriptions are rejected keeps its current ones.
///
/// Returns the number of channels that were rejected.
pub async fn apply_all(registry: &ChannelRegistry, desired: DesiredState) -> usize {
    // Removals go first: a subscription moving between channels must leave the old one
    for channel in registry.get_channels().await {
        if !desired.iter().any(|(c, _)| *c == channel) {
            if let Err(e) = registry.apply_desired_state(channel.clone(), vec![]).await {
                error!("Failed to remove channel '{channel}': {e}");
            }
        }
    }

    let mut conflicting = Vec::new();
    let mut rejected = 0;
    for (channel, subscriptions) in desired {
        match registry.apply_desired_state(channel.clone(), subscriptions.clone()).await {
            Ok(_) => {},
            Err(RegistryError::SubscriptionConflict { .. }) => conflicting.push((channel, subscriptions)),
            Err(e) => {
                error!("Rejected desired state of channel '{channel}': {e}");
                rejected += 1;
            },
        }
    }

    // Conflicts may have been resolved by channels applied later
    for (channel, subscriptions) in conflicting {
        if let Err(e) = registry.apply_desired_state(channel.clone(), subscriptions).await {
            error!("Rejected desired state of channel '{channel}': {e}");
            rejected += 1;
        }
    }

    rejected
}

pub fn init(
    subscriptions_file: PathBuf,
    poll_interval: Duration,
    shutdown_token: CancellationToken,
    metrics: Arc<Registry>,
) -> (Arc<ChannelRegistry>, JoinHandle<()>) {
    let (mut desired_rx, dse_join) =
        DesiredStateEmitter::new(subscriptions_file, poll_interval).spawn(shutdown_token);

    let registry = Arc::new(ChannelRegistry::new(metrics));

    let registry_clone = registry.clone();
    let join = tokio::spawn(async move {
        debug!("Begin receiving desired state updates");

        while let Some(desired) = desired_rx.recv().await {
            let rejected = apply_all(&registry_clone, desired).await;
            if rejected > 0 {
                warn!("{rejected} channels kept their previous subscriptions");
            }
        }

        info!("Desired state emitter stopped: breaking (internal) loop");
        if let Err(e) = dse_join.await {
            error!("Desired state emitter task failed: {e}");
        }
    });

    debug!("Initialized");
    (registry, join)
}

// Inner modules
mod emitter;
mod watcher;

use std::path::PathBuf;
use std::sync::Arc;

use prometheus::Registry;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::internals::Emitter;

// Exports
pub use emitter::MountedSettingsEmitter;
pub use watcher::{ActiveConfig, ConfigReceiver, ConfigWatcher};

pub fn init(
    settings_dir: PathBuf,
    poll_interval: Duration,
    shutdown_token: CancellationToken,
    metrics: Arc<Registry>,
) -> (ActiveConfig, JoinHandle<()>) {
    let (mut settings_rx, mse_join) =
        MountedSettingsEmitter::new(settings_dir, poll_interval).spawn(shutdown_token);

    let mut watcher = ConfigWatcher::new(metrics);
    let active_config = ActiveConfig::new(watcher.subscribe());

    // The watcher is moved into the task: it's the only writer of the active configuration.
    //
    // The task terminates once the emitter stops, dropping the sending end of `settings_rx`.
    let join = tokio::spawn(async move {
        debug!("Begin receiving settings updates");

        while let Some(raw) = settings_rx.recv().await {
            if let Err(e) = watcher.on_config_change(&raw) {
                match watcher.current() {
                    Some(c) => warn!("Rejected settings update ({e}): keeping broker configuration v{}", c.version),
                    None => error!("Rejected settings update ({e}): no valid broker configuration yet"),
                }
            }
        }

        info!("Settings emitter stopped: breaking (internal) loop");
        if let Err(e) = mse_join.await {
            error!("Settings emitter task failed: {e}");
        }
    });

    debug!("Initialized");
    (active_config, join)
}

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    io::ErrorKind,
    path::{Path, PathBuf},
};

use tokio::{
    fs,
    sync::mpsc,
    task::JoinHandle,
    time::{interval, Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::broker_config::{RawSettings, EVENTING_KAFKA_SETTINGS_KEY, SARAMA_SETTINGS_KEY};
use crate::internals::Emitter;

const CHANNEL_SIZE: usize = 1;

/// Settings keys read from the settings directory: each is expected to be a file with that name.
const SETTINGS_KEYS: [&str; 2] = [SARAMA_SETTINGS_KEY, EVENTING_KAFKA_SETTINGS_KEY];

/// Emits [`RawSettings`] read from a directory, every time its content changes.
///
/// This is how a Kubernetes ConfigMap is seen when mounted as a volume: one file per key,
/// atomically swapped by the kubelet when the ConfigMap is updated.
/// The directory is polled at a regular interval, and the settings are emitted only
/// when the hash of their content differs from what was last emitted.
///
/// It shuts down when the provided [`CancellationToken`] is cancelled.
pub struct MountedSettingsEmitter {
    settings_dir: PathBuf,
    poll_interval: Duration,
}

impl MountedSettingsEmitter {
    /// Create a new [`MountedSettingsEmitter`]
    ///
    /// # Arguments
    ///
    /// * `settings_dir` - Directory containing one file per settings key
    /// * `poll_interval` - How often to check the directory for changes
    pub fn new(settings_dir: PathBuf, poll_interval: Duration) -> Self {
        Self {
            settings_dir,
            poll_interval,
        }
    }
}

/// Read the settings files from `dir`. Missing files are skipped.
async fn read_settings(dir: &Path) -> RawSettings {
    let mut raw = RawSettings::new();

    for key in SETTINGS_KEYS {
        let path = dir.join(key);
        match fs::read_to_string(&path).await {
            Ok(content) => {
                raw.insert(key.to_string(), content);
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                trace!("Settings file {} not found", path.display());
            },
            Err(e) => {
                warn!("Failed to read settings file {}: {e}", path.display());
            },
        }
    }

    raw
}

fn hash_settings(raw: &RawSettings) -> u64 {
    let mut hasher = DefaultHasher::new();
    raw.hash(&mut hasher);
    hasher.finish()
}

impl Emitter for MountedSettingsEmitter {
    type Emitted = RawSettings;

    /// Spawn a new async task to run the business logic of this struct.
    ///
    /// When this emitter gets spawned, it returns a [`mpsc::Receiver`] for [`RawSettings`],
    /// and a [`JoinHandle`] to help join on the task spawned internally.
    /// The task concludes (joins) only ones the inner task of the emitter terminates.
    ///
    /// # Arguments
    ///
    /// * `shutdown_token`: A [`CancellationToken`] that, when cancelled, will make the internal loop terminate.
    ///
    fn spawn(
        &self,
        shutdown_token: CancellationToken,
    ) -> (mpsc::Receiver<Self::Emitted>, JoinHandle<()>) {
        let (sx, rx) = mpsc::channel::<Self::Emitted>(CHANNEL_SIZE);

        let settings_dir = self.settings_dir.clone();
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

                let raw = read_settings(&settings_dir).await;
                let hash = hash_settings(&raw);
                if last_hash == Some(hash) {
                    continue;
                }

                if raw.is_empty() {
                    warn!("No settings found in {}", settings_dir.display());
                }

                debug!("Settings in {} changed (hash: {hash})", settings_dir.display());
                tokio::select! {
                    res = Self::emit(&sx, raw) => {
                        match res {
                            Ok(()) => last_hash = Some(hash),
                            Err(e) => {
                                error!("Failed to emit {}: {e}", std::any::type_name::<RawSettings>());
                                break;
                            },
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

#[cfg(test)]
mod test {
    use std::fs;

    use tokio::time::{timeout, Duration};
    use tokio_util::sync::CancellationToken;

    use super::MountedSettingsEmitter;
    use crate::broker_config::{EVENTING_KAFKA_SETTINGS_KEY, SARAMA_SETTINGS_KEY};
    use crate::internals::Emitter;

    #[tokio::test]
    async fn should_emit_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SARAMA_SETTINGS_KEY), "Net: {}\n").unwrap();
        fs::write(dir.path().join(EVENTING_KAFKA_SETTINGS_KEY), "kafka: {}\n").unwrap();
        fs::write(dir.path().join("unrelated"), "ignored").unwrap();

        let token = CancellationToken::new();
        let emitter = MountedSettingsEmitter::new(dir.path().to_path_buf(), Duration::from_millis(20));
        let (mut rx, join) = emitter.spawn(token.clone());

        let first = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first.get(SARAMA_SETTINGS_KEY).map(String::as_str), Some("Net: {}\n"));

        // Nothing changes: nothing is emitted
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());

        fs::write(dir.path().join(SARAMA_SETTINGS_KEY), "Net: { KeepAlive: 1 }\n").unwrap();
        let second = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(
            second.get(SARAMA_SETTINGS_KEY).map(String::as_str),
            Some("Net: { KeepAlive: 1 }\n")
        );

        token.cancel();
        join.await.unwrap();
    }
}

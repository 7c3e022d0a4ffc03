use thiserror::Error;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const READINESS_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Something that becomes _ready_ at some point after startup, like the first valid
/// broker configuration being mounted.
///
/// Readiness is polled via [`Self::is_ready`] until it holds, or until shutdown.
#[allow(async_fn_in_trait)]
pub trait Awaitable {
    /// Name used when logging about readiness.
    const NAME: &'static str;

    /// Returns `true` if [`Self`] is ready. Must be cheap.
    async fn is_ready(&self) -> bool;

    /// Completes once [`Self::is_ready`] returns `true`, or with an error if
    /// `shutdown_token` is cancelled first.
    async fn await_ready(&self, shutdown_token: CancellationToken) -> Result<(), NotReady> {
        let mut interval = interval(READINESS_CHECK_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut checks = 0_u32;
        loop {
            tokio::select! {
                biased;
                _ = shutdown_token.cancelled() => {
                    warn!("Shutdown before {} was ready", Self::NAME);
                    return Err(NotReady);
                },
                _ = interval.tick() => {
                    if self.is_ready().await {
                        info!("{} is ready", Self::NAME);
                        return Ok(());
                    }
                    checks += 1;
                    if checks % 40 == 0 {
                        info!("Still waiting for {}...", Self::NAME);
                    }
                },
            }
        }
    }
}

#[derive(Error, Debug, Eq, PartialEq)]
#[error("shutdown before ready")]
pub struct NotReady;

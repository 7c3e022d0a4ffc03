use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

/// Something that watches an external source, and emits what it observes via a [`mpsc::channel`].
///
/// The emitting happens in an async task, spawned by [`Self::spawn`]:
/// the task runs until the given [`CancellationToken`] is cancelled.
#[allow(async_fn_in_trait)]
pub trait Emitter {
    type Emitted: Send;

    /// Spawn a new async task to run the business logic of the emitter.
    ///
    /// Returns the [`mpsc::Receiver`] end of the channel the emitter writes to,
    /// and a [`JoinHandle`] to join on the spawned task.
    fn spawn(
        &self,
        shutdown_token: CancellationToken,
    ) -> (mpsc::Receiver<Self::Emitted>, JoinHandle<()>);

    /// Emit an item via the given [`mpsc::Sender`].
    async fn emit(
        sender: &mpsc::Sender<Self::Emitted>,
        item: Self::Emitted,
    ) -> Result<(), mpsc::error::SendError<Self::Emitted>> {
        sender.send(item).await
    }
}

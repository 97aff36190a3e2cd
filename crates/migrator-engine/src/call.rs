use std::time::Duration;

use anyhow::anyhow;
use migrator_store_sqlite::StoreError;
use tokio_util::sync::CancellationToken;

/// Outcome of one storage or broker call made from async code.
pub(crate) enum Call<R> {
    Cancelled,
    Done(R),
    Failed(StoreError),
}

/// Run a blocking store call on the blocking pool, bounded by `timeout` and
/// abandoned as soon as `cancel` fires.
///
/// A panicking call is the only hard error: it means the store layer is
/// broken rather than a single row being unreadable.
pub(crate) async fn blocking<R, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    call: F,
) -> anyhow::Result<Call<R>>
where
    F: FnOnce() -> Result<R, StoreError> + Send + 'static,
    R: Send + 'static,
{
    let task = tokio::task::spawn_blocking(call);
    tokio::select! {
        () = cancel.cancelled() => Ok(Call::Cancelled),
        outcome = tokio::time::timeout(timeout, task) => match outcome {
            Ok(Ok(Ok(value))) => Ok(Call::Done(value)),
            Ok(Ok(Err(err))) => Ok(Call::Failed(err)),
            Ok(Err(join)) => Err(anyhow!("store call panicked: {join}")),
            Err(_) => Ok(Call::Failed(StoreError::Timeout(timeout))),
        },
    }
}

/// Sleep for `interval` unless cancelled first. Returns `false` on cancellation.
pub(crate) async fn pause(cancel: &CancellationToken, interval: Duration) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(interval) => true,
    }
}

use std::future::Future;

use tokio::task::JoinHandle;

/// Spawns a named task on the tokio runtime. The name shows up in the span of
/// everything the task logs.
pub fn tokio_spawn<F>(name: &'static str, f: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let span = tracing::info_span!("task", task = name);
    tokio::spawn(tracing::Instrument::instrument(f, span))
}

/// Waits for a worker task after its cancellation token has fired. A
/// cancelled join is a clean exit.
pub async fn join_worker(handle: JoinHandle<()>) -> anyhow::Result<()> {
    match handle.await {
        Ok(()) => Ok(()),
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

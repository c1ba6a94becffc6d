use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Runs a capture-session task and stops the session when it ends.
///
/// The future is spawned, its outcome logged, and `token` cancelled however
/// it finishes, so one task failing brings the others down with it. Returns
/// the task's output when it succeeded.
pub async fn task_completion_handler<F, T, E>(
    future: F,
    token: CancellationToken,
    task_name: &str,
) -> Option<T>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static + std::fmt::Debug,
{
    let handle = tokio::spawn(future);

    let output = match handle.await {
        Ok(Ok(output)) => {
            log::debug!("{} completed successfully", task_name);
            Some(output)
        }
        Ok(Err(error)) => {
            log::error!("{} failed with error: {:?}", task_name, error);
            None
        }
        Err(join_error) => {
            // Task panicked or was cancelled
            log::error!("{} panicked or was cancelled: {:?}", task_name, join_error);
            None
        }
    };

    token.cancel();
    output
}

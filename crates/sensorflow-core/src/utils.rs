/*!
 * Utility functions and helpers for SensorFlow.
 */
use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

/// Run a future with a timeout
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `future` - The future to run
/// * `on_elapsed` - Builds the caller's error when the timeout is reached
///
/// # Returns
///
/// The result of the future, or the error produced by `on_elapsed`
pub async fn with_timeout<F, T, E, G>(duration: Duration, future: F, on_elapsed: G) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    G: FnOnce(Duration) -> E,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(on_elapsed(duration)),
    }
}

/// Create a task that runs in the background and logs any errors
///
/// # Arguments
///
/// * `name` - A name for the task (for logging)
/// * `fut` - The future to run
pub fn spawn_and_log<F, T, E>(name: &str, fut: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let task_name = name.to_string();
    tokio::spawn(async move {
        match fut.await {
            Ok(_) => {
                debug!("Task '{}' completed successfully", task_name);
            }
            Err(e) => {
                warn!("Task '{}' failed: {}", task_name, e);
            }
        }
    })
}

/// Convert milliseconds to a Duration
pub fn millis_to_duration(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_with_timeout_success() {
        let result = tokio_test::block_on(with_timeout(
            Duration::from_secs(1),
            async { Ok::<_, Error>(42) },
            |_| Error::timeout("unreachable"),
        ));
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_failure() {
        let result = with_timeout(
            Duration::from_millis(10),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, Error>(42)
            },
            |after| Error::timeout(format!("after {:?}", after)),
        )
        .await;
        match result {
            Err(Error::Timeout(msg)) => assert_eq!(msg, "after 10ms"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_with_timeout_passes_inner_error_through() {
        let result: Result<(), Error> = with_timeout(
            Duration::from_secs(1),
            async { Err(Error::other("refused")) },
            |_| Error::timeout("unreachable"),
        )
        .await;
        assert!(matches!(result, Err(Error::Other(_))));
    }

    #[tokio::test]
    async fn test_spawn_and_log_completes() {
        let handle = spawn_and_log("ok", async { Ok::<_, Error>(()) });
        handle.await.unwrap();
        let handle = spawn_and_log("failing", async { Err::<(), _>(Error::other("boom")) });
        handle.await.unwrap();
    }

    #[test]
    fn test_millis_to_duration() {
        assert_eq!(millis_to_duration(1234), Duration::from_millis(1234));
    }
}

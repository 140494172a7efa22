//! Retry of transient store failures.
//!
//! Store I/O that fails with
//! [`is_transient_io`](offsync_common::Error::is_transient_io) is tried
//! again once; everything else, `StorageCorrupt` included, surfaces
//! immediately.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use offsync_common::Result;

/// Pause before the single retry of an async store call.
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// Runs async store operations, retrying a transient failure once.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryExecutor;

impl RetryExecutor {
    /// Execute an operation, retrying a transient failure once after a
    /// short pause.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match operation().await {
            Err(err) if err.is_transient_io() => {
                warn!("Store operation failed: {}. Retrying in {:?}...", err, RETRY_DELAY);
                sleep(RETRY_DELAY).await;
                let result = operation().await;
                match &result {
                    Ok(_) => debug!("Store operation succeeded after a retry"),
                    Err(err) => warn!("Store operation failed after 2 attempts: {}", err),
                }
                result
            }
            other => other,
        }
    }
}

/// Run a synchronous store call, retrying a transient failure once.
///
/// Used on paths that cannot suspend, such as cache access under the
/// per-collection lock.
pub fn retry_once<F, T>(mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    match operation() {
        Err(err) if err.is_transient_io() => {
            debug!("Retrying store call after: {}", err);
            operation()
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_common::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_store_policy_retries_once() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<i32> = RetryExecutor
            .execute(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Storage("disk busy".to_string()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<i32> = RetryExecutor
            .execute(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::Storage("disk busy".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_corruption_is_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<()> = RetryExecutor
            .execute(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::StorageCorrupt("bad bytes".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::StorageCorrupt(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_once_sync() {
        let mut calls = 0;
        let value = retry_once(|| {
            calls += 1;
            if calls == 1 {
                Err(Error::Storage("busy".to_string()))
            } else {
                Ok("ok")
            }
        })
        .unwrap();
        assert_eq!(value, "ok");
        assert_eq!(calls, 2);

        let mut calls = 0;
        let result: Result<()> = retry_once(|| {
            calls += 1;
            Err(Error::InvalidInput("nope".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}

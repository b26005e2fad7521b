//! Deadline for async operations.
//!
//! [`with_timeout`] races a future against a deadline. When the deadline wins the future
//! is dropped, which cancels it at its next await point; its result is never observed.

use starport_core::error::LifecycleError;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// The deadline elapsed before the operation finished
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation timed out after {}ms", .0.as_millis())]
pub struct TimeoutError(pub Duration);

impl From<TimeoutError> for LifecycleError {
    fn from(err: TimeoutError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Run `future`, giving up after `duration`.
///
/// # Errors
///
/// Returns [`TimeoutError`] if `duration` elapses first.
///
/// # Example
///
/// ```rust
/// use starport_runtime::timeout::with_timeout;
/// use std::time::Duration;
///
/// # async fn example() {
/// let value = with_timeout(Duration::from_secs(1), async { 7 }).await;
/// assert_eq!(value, Ok(7));
/// # }
/// ```
pub async fn with_timeout<F>(duration: Duration, future: F) -> Result<F::Output, TimeoutError>
where
    F: Future,
{
    match tokio::time::timeout(duration, future).await {
        Ok(output) => Ok(output),
        Err(_elapsed) => {
            tracing::warn!(timeout_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX), "Operation timed out");
            Err(TimeoutError(duration))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_completes_within_deadline() {
        let result = with_timeout(Duration::from_millis(100), async { "done" }).await;
        assert_eq!(result, Ok("done"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_wins_and_cancels_operation() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);

        let result = with_timeout(Duration::from_millis(50), async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            flag.store(true, Ordering::SeqCst);
        })
        .await;

        assert_eq!(result, Err(TimeoutError(Duration::from_millis(50))));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_converts_to_unavailable() {
        let err: LifecycleError = TimeoutError(Duration::from_millis(250)).into();
        assert_eq!(
            err,
            LifecycleError::Unavailable("operation timed out after 250ms".to_string())
        );
    }
}

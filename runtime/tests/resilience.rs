//! Breaker, retry and timeout working together around a flaky collaborator.

use starport_core::error::LifecycleError;
use starport_runtime::circuit_breaker::{BreakerRegistry, BreakerState, CircuitBreakerConfig, CircuitBreakerError};
use starport_runtime::retry::{retry_with_backoff, RetryPolicy};
use starport_runtime::timeout::{with_timeout, TimeoutError};
use starport_testing::{init_test_tracing, test_environment, ManualClock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fails the first `failures` calls, then succeeds
struct Flaky {
    failures: usize,
    calls: AtomicUsize,
}

impl Flaky {
    fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicUsize::new(0),
        })
    }

    async fn call(&self) -> Result<&'static str, LifecycleError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            Err(LifecycleError::Unavailable(format!("call {n} failed")))
        } else {
            Ok("ok")
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn quick_retry(max_retries: usize) -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(max_retries)
        .initial_delay(Duration::from_millis(5))
        .max_delay(Duration::from_millis(20))
        .build()
}

#[tokio::test]
async fn test_retry_through_breaker_recovers_before_opening() {
    init_test_tracing();
    let registry = BreakerRegistry::new(
        CircuitBreakerConfig::builder().failure_threshold(5).build(),
        test_environment(),
    );
    registry.create_breaker("geocoder", None).await;
    let flaky = Flaky::new(2);

    let outcome = retry_with_backoff(quick_retry(3), || {
        let registry = registry.clone();
        let flaky = Arc::clone(&flaky);
        async move { registry.call("geocoder", || async move { flaky.call().await }).await }
    })
    .await
    .unwrap();

    assert_eq!(outcome.value, "ok");
    assert_eq!(outcome.attempts, 3);
    assert_eq!(registry.states().await, vec![("geocoder".to_string(), BreakerState::Closed)]);
}

#[tokio::test]
async fn test_open_breaker_stops_calls_reaching_collaborator() {
    let clock = Arc::new(ManualClock::default());
    let registry = BreakerRegistry::new(
        CircuitBreakerConfig::builder()
            .failure_threshold(2)
            .timeout(Duration::from_secs(10))
            .success_threshold(1)
            .build(),
        test_environment().with_clock(clock.clone()),
    );
    registry.create_breaker("geocoder", None).await;
    let flaky = Flaky::new(usize::MAX);

    let err = retry_with_backoff(quick_retry(4), || {
        let registry = registry.clone();
        let flaky = Arc::clone(&flaky);
        async move { registry.call("geocoder", || async move { flaky.call().await }).await }
    })
    .await
    .unwrap_err();

    assert_eq!(err.attempts, 5);
    assert!(err.error.is_open());
    assert_eq!(flaky.calls(), 2);

    clock.advance(Duration::from_secs(10));
    let healthy = Flaky::new(0);
    let result = registry
        .call("geocoder", || async move { healthy.call().await })
        .await;
    assert_eq!(result, Ok("ok"));
    assert_eq!(registry.states().await[0].1, BreakerState::Closed);
}

#[tokio::test]
async fn test_breaker_error_maps_into_lifecycle_error() {
    let registry = BreakerRegistry::new(CircuitBreakerConfig::default(), test_environment());

    let err: CircuitBreakerError<LifecycleError> =
        registry.call("missing", || async { Ok::<(), _>(()) }).await.unwrap_err();

    assert!(err.into_lifecycle().is_not_found());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_inside_retry_counts_as_failure() {
    let calls = Arc::new(AtomicUsize::new(0));

    let err = retry_with_backoff(quick_retry(1), || {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            with_timeout(Duration::from_millis(10), tokio::time::sleep(Duration::from_secs(1))).await
        }
    })
    .await
    .unwrap_err();

    assert_eq!(err.error, TimeoutError(Duration::from_millis(10)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

//! Retry logic with exponential backoff for handling transient failures.
//!
//! The failure signal is the `Err` returned by the operation. Every attempt is counted,
//! and the final result reports how many attempts were made.
//!
//! # Example
//!
//! ```rust
//! use starport_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .multiplier(2.0)
//!     .build();
//!
//! let outcome = retry_with_backoff(policy, || async {
//!     Ok::<_, String>(42)
//! }).await?;
//! assert_eq!(outcome.attempts, 1);
//! # Ok(())
//! # }
//! ```

use crate::metrics::RetryMetrics;
use serde::{Deserialize, Serialize};
use starport_core::environment::RandomSource;
use starport_core::error::LifecycleError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `initial_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
/// - `jitter`: 0.0 (no randomization)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: usize,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries (cap for exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Fraction of each delay randomized in both directions, `0.0..=1.0`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// Total attempts allowed (first try plus retries)
    #[must_use]
    pub const fn max_attempts(&self) -> usize {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `attempt + 1`, without jitter.
    ///
    /// `initial_delay * multiplier^attempt`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Delay with jitter applied: the base delay scaled by a factor drawn uniformly from
    /// `[1 - jitter, 1 + jitter)`, still capped at `max_delay`.
    #[must_use]
    pub fn jittered_delay(&self, attempt: usize, random: &dyn RandomSource) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let jitter = self.jitter.min(1.0);
        let factor = random.range(1.0 - jitter, 1.0 + jitter);
        base.mul_f64(factor.max(0.0)).min(self.max_delay)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    /// Set delay before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Set the jitter fraction (clamped to `0.0..=1.0`).
    #[must_use]
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.policy.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Successful result of a retried operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome<T> {
    /// Value returned by the successful attempt
    pub value: T,
    /// Attempts made, including the successful one
    pub attempts: usize,
}

/// Failure of a retried operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed after {attempts} attempt(s): {error}")]
pub struct RetryError<E> {
    /// Error from the last attempt
    pub error: E,
    /// Attempts made
    pub attempts: usize,
    /// Whether attempts ran out (`false` when the error was not retryable)
    pub exhausted: bool,
}

impl<E: Into<LifecycleError>> From<RetryError<E>> for LifecycleError {
    fn from(err: RetryError<E>) -> Self {
        err.error.into()
    }
}

/// Runs operations under a [`RetryPolicy`], drawing jitter from an optional random source
#[derive(Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    random: Option<Arc<dyn RandomSource>>,
}

impl Retrier {
    /// Retrier without jitter randomness
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            random: None,
        }
    }

    /// Use `random` for jitter
    #[must_use]
    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = Some(random);
        self
    }

    /// The policy in use
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn delay(&self, attempt: usize) -> Duration {
        match &self.random {
            Some(random) => self.policy.jittered_delay(attempt, random.as_ref()),
            None => self.policy.delay_for_attempt(attempt),
        }
    }

    /// Retry every error.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error once `max_retries` retries have failed.
    pub async fn run<F, Fut, T, E>(&self, operation: F) -> Result<RetryOutcome<T>, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.run_if(operation, |_| true).await
    }

    /// Retry only errors for which `is_retryable` holds.
    ///
    /// # Errors
    ///
    /// Returns a non-retryable error immediately, or the last attempt's error once
    /// `max_retries` retries have failed.
    pub async fn run_if<F, Fut, T, E, P>(
        &self,
        mut operation: F,
        is_retryable: P,
    ) -> Result<RetryOutcome<T>, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;

        loop {
            RetryMetrics::record_attempt();
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        RetryMetrics::record_success();
                        tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                    }
                    return Ok(RetryOutcome {
                        value,
                        attempts: attempt + 1,
                    });
                }
                Err(error) => {
                    if !is_retryable(&error) {
                        tracing::warn!(error = %error, "Error is not retryable, failing immediately");
                        return Err(RetryError {
                            error,
                            attempts: attempt + 1,
                            exhausted: false,
                        });
                    }

                    if attempt >= self.policy.max_retries {
                        RetryMetrics::record_exhausted();
                        tracing::error!(
                            attempts = attempt + 1,
                            error = %error,
                            "Operation failed after max retries"
                        );
                        return Err(RetryError {
                            error,
                            attempts: attempt + 1,
                            exhausted: true,
                        });
                    }

                    let delay = self.delay(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "Operation failed, retrying"
                    );

                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl std::fmt::Debug for Retrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retrier")
            .field("policy", &self.policy)
            .field("jitter_source", &self.random.is_some())
            .finish()
    }
}

/// Retry an async operation with exponential backoff.
///
/// # Errors
///
/// Returns the last attempt's error once the policy's retries are used up.
///
/// # Example
///
/// ```rust
/// use starport_runtime::retry::{RetryPolicy, retry_with_backoff};
///
/// # async fn example() {
/// let outcome = retry_with_backoff(RetryPolicy::default(), || async {
///     Ok::<_, String>(42)
/// }).await;
///
/// assert_eq!(outcome.map(|o| o.value), Ok(42));
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: RetryPolicy,
    operation: F,
) -> Result<RetryOutcome<T>, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    Retrier::new(policy).run(operation).await
}

/// Retry an async operation while `is_retryable` accepts its error.
///
/// # Errors
///
/// Returns a non-retryable error immediately, or the last error once retries run out.
pub async fn retry_if<F, Fut, T, E, P>(
    policy: RetryPolicy,
    operation: F,
    is_retryable: P,
) -> Result<RetryOutcome<T>, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    Retrier::new(policy).run_if(operation, is_retryable).await
}

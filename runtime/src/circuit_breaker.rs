//! Circuit breaker pattern for preventing cascading failures.
//!
//! A circuit breaker watches the results of the operations it wraps and "opens" (stops
//! allowing calls) when consecutive failures reach a threshold. The failure signal is the
//! `Err` returned by the wrapped operation; nothing else moves the state machine.
//!
//! # States
//!
//! - **Closed**: Normal operation. Calls pass through. Consecutive failures are counted.
//! - **Open**: Calls are rejected without running the operation until `timeout` has
//!   elapsed on the injected clock.
//! - **HalfOpen**: The first call after the timeout moves the breaker here. Successes
//!   close it again; any failure reopens it.
//!
//! The Open → `HalfOpen` move is lazy: it happens on the next call, never on a timer.
//!
//! # Example
//!
//! ```rust
//! use starport_core::environment::Environment;
//! use starport_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let config = CircuitBreakerConfig::builder()
//!     .failure_threshold(5)
//!     .timeout(Duration::from_secs(60))
//!     .success_threshold(2)
//!     .build();
//!
//! let breaker = CircuitBreaker::new("payments", config, &Environment::system());
//!
//! match breaker.call(|| async { Ok::<_, String>(42) }).await {
//!     Ok(result) => println!("Success: {result}"),
//!     Err(e) => println!("Failed: {e}"),
//! }
//! # }
//! ```

use crate::metrics::BreakerMetrics;
use crate::{HealthCheck, HealthReport, HealthStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use starport_core::environment::{Clock, Environment};
use starport_core::error::LifecycleError;
use starport_core::registry::{Entity, Registry};
use starport_core::telemetry::{Telemetry, TelemetryEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: usize,
    /// Duration to wait before transitioning from Open to `HalfOpen`
    pub timeout: Duration,
    /// Number of successes in `HalfOpen` state before closing the circuit
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: None,
            timeout: None,
            success_threshold: None,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<usize>,
    timeout: Option<Duration>,
    success_threshold: Option<usize>,
}

impl CircuitBreakerConfigBuilder {
    /// Set the failure threshold (minimum 1).
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set how long the breaker stays open before probing.
    #[must_use]
    pub const fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Set the number of half-open successes needed to close (minimum 1).
    #[must_use]
    pub const fn success_threshold(mut self, threshold: usize) -> Self {
        self.success_threshold = Some(threshold);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        let defaults = CircuitBreakerConfig::default();
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(defaults.failure_threshold).max(1),
            timeout: self.timeout.unwrap_or(defaults.timeout),
            success_threshold: self.success_threshold.unwrap_or(defaults.success_threshold).max(1),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    /// Calls pass through normally
    Closed,
    /// Calls are rejected
    Open,
    /// Calls pass through while recovery is tested
    HalfOpen,
}

impl BreakerState {
    /// Wire name: `closed`, `open` or `half-open`
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }

    const fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }

    const fn health(self) -> HealthStatus {
        match self {
            Self::Closed => HealthStatus::Healthy,
            Self::HalfOpen => HealthStatus::Degraded,
            Self::Open => HealthStatus::Unhealthy,
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from circuit breaker operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, call rejected without running the operation
    #[error("circuit breaker {name} is open")]
    Open {
        /// Breaker name
        name: String,
    },
    /// No breaker is registered under this name
    #[error("circuit breaker not found: {name}")]
    NotFound {
        /// Requested name
        name: String,
    },
    /// Operation failed
    #[error("operation failed: {0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    /// Whether the call was rejected by an open breaker
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// Convert into a [`LifecycleError`]
    ///
    /// An open breaker becomes `Unavailable`, an unknown name becomes `NotFound`, and the
    /// operation's own error is converted with `Into`.
    pub fn into_lifecycle(self) -> LifecycleError
    where
        E: Into<LifecycleError>,
    {
        match self {
            Self::Open { name } => LifecycleError::Unavailable(format!("circuit breaker {name} is open")),
            Self::NotFound { name } => LifecycleError::not_found("CircuitBreaker", name),
            Self::Inner(e) => e.into(),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: usize,
    success_count: usize,
    opened_at: Option<DateTime<Utc>>,
}

/// A state change, reported after the lock is released
#[derive(Debug, Clone, Copy)]
struct Transition {
    from: BreakerState,
    to: BreakerState,
}

/// Circuit breaker for preventing cascading failures.
///
/// Cloning yields another handle to the same breaker.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: Arc<CircuitBreakerConfig>,
    clock: Arc<dyn Clock>,
    telemetry: Telemetry,
    state: Arc<RwLock<BreakerInner>>,
    total_calls: Arc<AtomicU64>,
    total_successes: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
}

impl CircuitBreaker {
    /// Create a closed breaker using the environment's clock and telemetry.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, env: &Environment) -> Self {
        let name = name.into();
        BreakerMetrics::record_state(&name, BreakerState::Closed.gauge_value());
        Self {
            name,
            config: Arc::new(config),
            clock: Arc::clone(&env.clock),
            telemetry: env.telemetry.clone(),
            state: Arc::new(RwLock::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            })),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_successes: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state of the circuit breaker.
    pub async fn state(&self) -> BreakerState {
        self.state.read().await.state
    }

    /// Call an operation through the circuit breaker.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Open` if the circuit is open (the operation is not
    /// run) and `CircuitBreakerError::Inner` if the operation fails.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let (allowed, transition) = self.try_acquire().await;
        self.report(transition);
        if !allowed {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            BreakerMetrics::record_call(&self.name, "rejected");
            tracing::warn!(breaker = %self.name, "Circuit breaker is OPEN, rejecting call");
            return Err(CircuitBreakerError::Open {
                name: self.name.clone(),
            });
        }

        match operation().await {
            Ok(result) => {
                let transition = self.on_success().await;
                self.report(transition);
                self.total_successes.fetch_add(1, Ordering::Relaxed);
                BreakerMetrics::record_call(&self.name, "success");
                Ok(result)
            }
            Err(err) => {
                let transition = self.on_failure().await;
                self.report(transition);
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                BreakerMetrics::record_call(&self.name, "failure");
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    /// Decide whether a call may run, moving Open → `HalfOpen` once the timeout elapsed.
    async fn try_acquire(&self) -> (bool, Option<Transition>) {
        let mut inner = self.state.write().await;

        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => (true, None),
            BreakerState::Open => {
                let now = self.clock.now();
                let expired = inner
                    .opened_at
                    .is_some_and(|opened| (now - opened).to_std().is_ok_and(|elapsed| elapsed >= self.config.timeout));
                if expired {
                    inner.state = BreakerState::HalfOpen;
                    inner.success_count = 0;
                    (
                        true,
                        Some(Transition {
                            from: BreakerState::Open,
                            to: BreakerState::HalfOpen,
                        }),
                    )
                } else {
                    (false, None)
                }
            }
        }
    }

    async fn on_success(&self) -> Option<Transition> {
        let mut inner = self.state.write().await;

        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = 0;
                None
            }
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                    Some(Transition {
                        from: BreakerState::HalfOpen,
                        to: BreakerState::Closed,
                    })
                } else {
                    None
                }
            }
            // A call admitted before a concurrent failure opened the breaker
            BreakerState::Open => None,
        }
    }

    async fn on_failure(&self) -> Option<Transition> {
        let mut inner = self.state.write().await;
        let now = self.clock.now();

        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    Some(Transition {
                        from: BreakerState::Closed,
                        to: BreakerState::Open,
                    })
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.failure_count = 1;
                inner.success_count = 0;
                inner.opened_at = Some(now);
                Some(Transition {
                    from: BreakerState::HalfOpen,
                    to: BreakerState::Open,
                })
            }
            BreakerState::Open => {
                inner.failure_count += 1;
                None
            }
        }
    }

    /// Log, record and emit a transition; called with no lock held.
    fn report(&self, transition: Option<Transition>) {
        let Some(Transition { from, to }) = transition else {
            return;
        };

        match to {
            BreakerState::Open => tracing::warn!(
                breaker = %self.name,
                from = from.as_str(),
                threshold = self.config.failure_threshold,
                "Circuit breaker opened"
            ),
            BreakerState::HalfOpen | BreakerState::Closed => tracing::info!(
                breaker = %self.name,
                from = from.as_str(),
                to = to.as_str(),
                "Circuit breaker transition"
            ),
        }

        BreakerMetrics::record_state(&self.name, to.gauge_value());
        BreakerMetrics::record_transition(&self.name, to.as_str());

        let event = match to {
            BreakerState::Open => "breaker_opened",
            BreakerState::HalfOpen => "breaker_half_opened",
            BreakerState::Closed => "breaker_closed",
        };
        self.telemetry.emit(
            &TelemetryEvent::new(event)
                .with("breaker", self.name.clone())
                .with("from", from.as_str())
                .with("to", to.as_str()),
        );
    }

    /// Call counters.
    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Reset the circuit breaker to closed state.
    pub async fn reset(&self) {
        let previous = {
            let mut inner = self.state.write().await;
            let previous = inner.state;
            inner.state = BreakerState::Closed;
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.opened_at = None;
            previous
        };
        tracing::info!(breaker = %self.name, "Circuit breaker manually reset to CLOSED");
        if previous != BreakerState::Closed {
            self.report(Some(Transition {
                from: previous,
                to: BreakerState::Closed,
            }));
        }
    }
}

impl Entity for CircuitBreaker {
    fn id(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Counters for circuit breaker monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerStats {
    /// Total number of calls attempted
    pub total_calls: u64,
    /// Total number of successful calls
    pub total_successes: u64,
    /// Total number of failed calls
    pub total_failures: u64,
    /// Total number of rejected calls (circuit open)
    pub total_rejections: u64,
}

impl BreakerStats {
    /// Calculate success rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 1.0;
        }
        self.total_successes as f64 / self.total_calls as f64
    }

    /// Calculate rejection rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.total_rejections as f64 / self.total_calls as f64
    }
}

/// Named circuit breakers
///
/// Handles returned by [`BreakerRegistry::get`] share state with the registered breaker.
#[derive(Debug, Clone)]
pub struct BreakerRegistry {
    breakers: Arc<RwLock<Registry<CircuitBreaker>>>,
    defaults: CircuitBreakerConfig,
    env: Environment,
}

impl BreakerRegistry {
    /// Empty registry; breakers created without a config use `defaults`.
    #[must_use]
    pub fn new(defaults: CircuitBreakerConfig, env: Environment) -> Self {
        Self {
            breakers: Arc::new(RwLock::new(Registry::new("CircuitBreaker"))),
            defaults,
            env,
        }
    }

    /// Register a closed breaker under `name`, replacing any existing one.
    pub async fn create_breaker(
        &self,
        name: impl Into<String>,
        config: Option<CircuitBreakerConfig>,
    ) -> CircuitBreaker {
        let breaker = CircuitBreaker::new(
            name,
            config.unwrap_or_else(|| self.defaults.clone()),
            &self.env,
        );
        tracing::debug!(breaker = %breaker.name(), "Circuit breaker registered");
        self.breakers.write().await.insert(breaker).clone()
    }

    /// Handle to a registered breaker.
    pub async fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.breakers.read().await.get_cloned(name)
    }

    /// Handle to a registered breaker.
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError::NotFound` for an unknown name.
    pub async fn require(&self, name: &str) -> Result<CircuitBreaker, LifecycleError> {
        self.breakers.read().await.require(name).cloned()
    }

    /// Run `operation` through the named breaker.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::NotFound` for an unknown name, otherwise whatever
    /// [`CircuitBreaker::call`] returns.
    pub async fn call<F, Fut, T, E>(&self, name: &str, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let breaker = self.get(name).await.ok_or_else(|| CircuitBreakerError::NotFound {
            name: name.to_string(),
        })?;
        breaker.call(operation).await
    }

    /// Current state of every breaker, in registration order.
    pub async fn states(&self) -> Vec<(String, BreakerState)> {
        let breakers = self.breakers.read().await.list_all();
        let mut states = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            let state = breaker.state().await;
            states.push((breaker.name, state));
        }
        states
    }

    /// Health report: open breakers are unhealthy, half-open ones degraded.
    pub async fn health(&self) -> HealthReport {
        let checks = self
            .states()
            .await
            .into_iter()
            .map(|(name, state)| {
                let message = (state != BreakerState::Closed).then(|| format!("circuit {state}"));
                HealthCheck::new(format!("breaker:{name}"), state.health(), message)
            })
            .collect();
        HealthReport::new(checks, self.env.now())
    }

    /// Number of registered breakers.
    pub async fn len(&self) -> usize {
        self.breakers.read().await.len()
    }

    /// Whether no breaker is registered.
    pub async fn is_empty(&self) -> bool {
        self.breakers.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starport_testing::mocks::RecordingSink;
    use starport_testing::{test_environment, ManualClock};

    fn manual_env() -> (Arc<ManualClock>, Environment) {
        let clock = Arc::new(ManualClock::default());
        let env = test_environment().with_clock(clock.clone());
        (clock, env)
    }

    fn tripping(threshold: usize) -> CircuitBreakerConfig {
        CircuitBreakerConfig::builder()
            .failure_threshold(threshold)
            .timeout(Duration::from_secs(30))
            .success_threshold(2)
            .build()
    }

    async fn fail(breaker: &CircuitBreaker, times: usize) {
        for _ in 0..times {
            let _ = breaker.call(|| async { Err::<i32, _>("boom") }).await;
        }
    }

    #[tokio::test]
    async fn test_closed_on_success() {
        let breaker = CircuitBreaker::new("db", CircuitBreakerConfig::default(), &test_environment());

        let result = breaker.call(|| async { Ok::<_, String>(42) }).await;

        assert_eq!(result, Ok(42));
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_rejects_without_running() {
        let (_clock, env) = manual_env();
        let breaker = CircuitBreaker::new("db", tripping(3), &env);

        fail(&breaker, 3).await;
        assert_eq!(breaker.state().await, BreakerState::Open);

        let mut ran = false;
        let result = breaker
            .call(|| {
                ran = true;
                async { Ok::<_, String>(1) }
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::Open { ref name }) if name == "db"));
        assert!(!ran);
        assert_eq!(breaker.stats().total_rejections, 1);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new("db", tripping(3), &test_environment());

        fail(&breaker, 2).await;
        let _ = breaker.call(|| async { Ok::<_, String>(()) }).await;
        fail(&breaker, 2).await;

        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_after_timeout_then_closes() {
        let (clock, env) = manual_env();
        let breaker = CircuitBreaker::new("db", tripping(2), &env);
        fail(&breaker, 2).await;

        clock.advance(Duration::from_secs(29));
        assert!(breaker.call(|| async { Ok::<_, String>(()) }).await.unwrap_err().is_open());

        clock.advance(Duration::from_secs(1));
        assert!(breaker.call(|| async { Ok::<_, String>(()) }).await.is_ok());
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);

        assert!(breaker.call(|| async { Ok::<_, String>(()) }).await.is_ok());
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let (clock, env) = manual_env();
        let breaker = CircuitBreaker::new("db", tripping(2), &env);
        fail(&breaker, 2).await;

        clock.advance(Duration::from_secs(30));
        fail(&breaker, 1).await;

        assert_eq!(breaker.state().await, BreakerState::Open);
    }

    #[tokio::test]
    async fn test_transitions_emit_telemetry() {
        let (clock, env) = manual_env();
        let sink = Arc::new(RecordingSink::new());
        let env = env.with_telemetry(Telemetry::disabled().with_sink(sink.clone()));
        let breaker = CircuitBreaker::new("db", tripping(1), &env);

        fail(&breaker, 1).await;
        clock.advance(Duration::from_secs(30));
        let _ = breaker.call(|| async { Ok::<_, String>(()) }).await;
        let _ = breaker.call(|| async { Ok::<_, String>(()) }).await;

        assert_eq!(
            sink.names(),
            vec!["breaker_opened", "breaker_half_opened", "breaker_closed"]
        );
    }

    #[tokio::test]
    async fn test_stats_and_reset() {
        let breaker = CircuitBreaker::new("db", tripping(2), &test_environment());

        for _ in 0..3 {
            let _ = breaker.call(|| async { Ok::<_, String>(()) }).await;
        }
        fail(&breaker, 2).await;

        let stats = breaker.stats();
        assert_eq!(stats.total_calls, 5);
        assert_eq!(stats.total_successes, 3);
        assert_eq!(stats.total_failures, 2);
        assert!((stats.success_rate() - 0.6).abs() < f64::EPSILON);

        breaker.reset().await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_registry_unknown_name_is_not_found() {
        let registry = BreakerRegistry::new(CircuitBreakerConfig::default(), test_environment());

        let result = registry.call("ghost", || async { Ok::<_, String>(()) }).await;
        assert_eq!(
            result,
            Err(CircuitBreakerError::NotFound {
                name: "ghost".to_string()
            })
        );
        assert!(registry.require("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_registry_states_and_health() {
        let registry = BreakerRegistry::new(tripping(1), test_environment());
        registry.create_breaker("search", None).await;
        registry.create_breaker("payments", None).await;

        let _ = registry.call("payments", || async { Err::<(), _>("down") }).await;

        assert_eq!(
            registry.states().await,
            vec![
                ("search".to_string(), BreakerState::Closed),
                ("payments".to_string(), BreakerState::Open),
            ]
        );
        let health = registry.health().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.checks.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_calls() {
        let breaker = CircuitBreaker::new("db", CircuitBreakerConfig::default(), &test_environment());

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let breaker = breaker.clone();
                tokio::spawn(async move { breaker.call(|| async { Ok::<_, String>(()) }).await })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(breaker.stats().total_successes, 50);
    }

    #[test]
    fn test_into_lifecycle_error() {
        let open: CircuitBreakerError<LifecycleError> = CircuitBreakerError::Open { name: "db".into() };
        assert!(matches!(open.into_lifecycle(), LifecycleError::Unavailable(_)));

        let inner = CircuitBreakerError::Inner(LifecycleError::validation("bad"));
        assert_eq!(inner.into_lifecycle(), LifecycleError::validation("bad"));
    }
}

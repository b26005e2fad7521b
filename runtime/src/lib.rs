//! # Starport Runtime
//!
//! Runtime pieces shared by every Starport feature.
//!
//! ## Core Components
//!
//! - **Dispatcher**: owns one feature's state, applies operations under a lock and emits
//!   their telemetry afterwards
//! - **Circuit breaker / retry / timeout**: resilience primitives driven by the real
//!   result of a caller-supplied operation and the injected clock
//! - **Metrics**: Prometheus exporter plus recorders for dispatch, breaker and retry activity
//! - **Sinks**: telemetry sinks that forward events to `tracing` and `metrics`
//! - **Config**: `STARPORT_*` environment configuration
//!
//! ## Example
//!
//! ```ignore
//! use starport_runtime::Dispatcher;
//!
//! let badges = Dispatcher::new(BadgeState::new(), environment);
//! let badge = badges.send(RegisterBadge::new("b1", spec)).await?;
//! let total = badges.state(|s| s.badges.len()).await;
//! ```

use starport_core::environment::Environment;
use starport_core::error::LifecycleError;
use starport_core::lifecycle::{Applied, Feature, Operation};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Circuit breaker pattern and named breaker registry
pub mod circuit_breaker;

/// Environment-driven configuration
pub mod config;

/// Prometheus metrics for observability
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

/// Telemetry sinks backed by `tracing` and `metrics`
pub mod sinks;

/// Timeout race for async operations
pub mod timeout;

pub use circuit_breaker::{BreakerRegistry, BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use config::RuntimeConfig;
pub use dispatcher::Dispatcher;
pub use retry::{RetryOutcome, RetryPolicy};
pub use timeout::{with_timeout, TimeoutError};

/// Health check status levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,

    /// Component is operational but probing recovery (e.g., a half-open breaker)
    Degraded,

    /// Component is refusing work
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Get the worst status between two statuses
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health of one component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    /// Component name
    pub component: String,
    /// Current status
    pub status: HealthStatus,
    /// Detail for non-healthy statuses
    pub message: Option<String>,
}

impl HealthCheck {
    /// Create a check result
    #[must_use]
    pub fn new(component: impl Into<String>, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            component: component.into(),
            status,
            message,
        }
    }
}

/// Aggregated health report
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Worst status among the checks
    pub status: HealthStatus,
    /// Individual component checks
    pub checks: Vec<HealthCheck>,
    /// When the report was generated (from the injected clock)
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthReport {
    /// Combine checks into a report
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>, timestamp: chrono::DateTime<chrono::Utc>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);

        Self {
            status,
            checks,
            timestamp,
        }
    }

    /// Check if every component is healthy
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }
}

/// The dispatcher - runtime coordinator for one feature
pub mod dispatcher {
    use super::{Applied, Arc, Environment, Feature, LifecycleError, Operation, RwLock};
    use crate::metrics::DispatchMetrics;
    use std::time::Instant;

    /// Owns a feature's state and applies operations to it
    ///
    /// The dispatcher manages:
    /// 1. State (behind an async `RwLock`; operations are serialized)
    /// 2. Environment (injected clock, ids, randomness, telemetry)
    /// 3. Telemetry emission after each successful operation
    ///
    /// Cloning is cheap and shares the same state.
    pub struct Dispatcher<S> {
        state: Arc<RwLock<S>>,
        environment: Environment,
    }

    impl<S: Feature> Dispatcher<S> {
        /// Create a dispatcher around initial state
        #[must_use]
        pub fn new(initial_state: S, environment: Environment) -> Self {
            Self {
                state: Arc::new(RwLock::new(initial_state)),
                environment,
            }
        }

        /// Apply an operation
        ///
        /// The operation runs with exclusive access to the state. Its telemetry is emitted
        /// after the lock is released; sink failures are absorbed by the adapter.
        ///
        /// # Errors
        ///
        /// Returns whatever [`LifecycleError`] the operation reports. The state is left as
        /// the operation left it (operations validate before mutating).
        pub async fn send<O>(&self, operation: O) -> Result<O::Output, LifecycleError>
        where
            O: Operation<S>,
        {
            let started = Instant::now();
            let applied = {
                let mut state = self.state.write().await;
                operation.apply(&mut state, &self.environment)
            };

            match applied {
                Ok(Applied { output, events }) => {
                    DispatchMetrics::record_operation(S::NAME, O::NAME, started.elapsed());
                    tracing::debug!(
                        feature = S::NAME,
                        operation = O::NAME,
                        events = events.len(),
                        "Operation applied"
                    );
                    for event in events {
                        self.environment.telemetry.emit(&event.in_feature(S::NAME));
                    }
                    Ok(output)
                }
                Err(error) => {
                    DispatchMetrics::record_rejection(S::NAME, O::NAME);
                    tracing::debug!(
                        feature = S::NAME,
                        operation = O::NAME,
                        error = %error,
                        "Operation rejected"
                    );
                    Err(error)
                }
            }
        }

        /// Read from the current state
        ///
        /// The closure sees a shared borrow; whatever it returns is owned by the caller.
        pub async fn state<F, T>(&self, f: F) -> T
        where
            F: FnOnce(&S) -> T,
        {
            let state = self.state.read().await;
            f(&state)
        }

        /// Injected environment
        #[must_use]
        pub const fn environment(&self) -> &Environment {
            &self.environment
        }
    }

    impl<S> Clone for Dispatcher<S> {
        fn clone(&self) -> Self {
            Self {
                state: Arc::clone(&self.state),
                environment: self.environment.clone(),
            }
        }
    }

    impl<S> std::fmt::Debug for Dispatcher<S> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Dispatcher")
                .field("environment", &self.environment)
                .finish_non_exhaustive()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starport_core::registry::Registry;
    use starport_core::telemetry::{Telemetry, TelemetryEvent};
    use starport_testing::mocks::{FailingSink, PanickingSink, RecordingSink};
    use starport_testing::test_environment;

    struct LedgerState {
        entries: Registry<i64>,
    }

    impl Feature for LedgerState {
        const NAME: &'static str = "ledger";
    }

    struct Credit {
        account: &'static str,
        amount: i64,
    }

    impl Operation<LedgerState> for Credit {
        type Output = i64;
        const NAME: &'static str = "credit";

        fn apply(self, state: &mut LedgerState, _env: &Environment) -> Result<Applied<i64>, LifecycleError> {
            let balance = state.entries.get(self.account).copied().unwrap_or(0) + self.amount;
            state.entries.put(self.account, balance);
            Ok(Applied::new(balance).with_event(
                TelemetryEvent::new("credited").with("account", self.account),
            ))
        }
    }

    struct Debit {
        account: &'static str,
    }

    impl Operation<LedgerState> for Debit {
        type Output = i64;
        const NAME: &'static str = "debit";

        fn apply(self, state: &mut LedgerState, _env: &Environment) -> Result<Applied<i64>, LifecycleError> {
            state.entries.update(self.account, |balance| {
                *balance -= 1;
                *balance
            }).map(Applied::new)
        }
    }

    fn ledger(telemetry: Telemetry) -> Dispatcher<LedgerState> {
        Dispatcher::new(
            LedgerState {
                entries: Registry::new("Account"),
            },
            test_environment().with_telemetry(telemetry),
        )
    }

    #[tokio::test]
    async fn test_send_applies_and_emits_prefixed_events() {
        let sink = Arc::new(RecordingSink::new());
        let dispatcher = ledger(Telemetry::disabled().with_sink(sink.clone()));

        assert_eq!(dispatcher.send(Credit { account: "a", amount: 5 }).await, Ok(5));
        assert_eq!(dispatcher.send(Credit { account: "a", amount: 2 }).await, Ok(7));

        assert_eq!(sink.names(), vec!["ledger_credited", "ledger_credited"]);
        assert_eq!(dispatcher.state(|s| s.entries.len()).await, 1);
    }

    #[tokio::test]
    async fn test_rejected_operation_surfaces_not_found() {
        let sink = Arc::new(RecordingSink::new());
        let dispatcher = ledger(Telemetry::disabled().with_sink(sink.clone()));

        let err = dispatcher.send(Debit { account: "ghost" }).await.unwrap_err();

        assert_eq!(err, LifecycleError::not_found("Account", "ghost"));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_failing_telemetry_does_not_change_result() {
        let telemetry = Telemetry::disabled()
            .with_sink(Arc::new(FailingSink))
            .with_sink(Arc::new(PanickingSink));
        let dispatcher = ledger(telemetry.clone());

        let result = dispatcher.send(Credit { account: "a", amount: 3 }).await;

        assert_eq!(result, Ok(3));
        assert_eq!(telemetry.dropped_failures(), 2);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let dispatcher = ledger(Telemetry::disabled());
        let other = dispatcher.clone();

        dispatcher.send(Credit { account: "a", amount: 1 }).await.unwrap();
        other.send(Credit { account: "a", amount: 1 }).await.unwrap();

        assert_eq!(dispatcher.state(|s| s.entries.get("a").copied()).await, Some(2));
    }

    #[tokio::test]
    async fn test_concurrent_sends_are_serialized() {
        let dispatcher = ledger(Telemetry::disabled());

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { dispatcher.send(Credit { account: "a", amount: 1 }).await })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(dispatcher.state(|s| s.entries.get("a").copied()).await, Some(20));
    }

    #[test]
    fn test_health_report_takes_worst_status() {
        let report = HealthReport::new(
            vec![
                HealthCheck::new("a", HealthStatus::Healthy, None),
                HealthCheck::new("b", HealthStatus::Degraded, Some("probing".into())),
            ],
            chrono::Utc::now(),
        );
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(!report.is_healthy());
    }
}

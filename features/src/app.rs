//! Application root.
//!
//! [`Starport`] builds every feature service from one [`Environment`] and one
//! [`RuntimeConfig`], so all features share the same clock, id generator, random source and
//! telemetry sinks.

use crate::alerts::AlertService;
use crate::badges::{BadgeService, BadgeStats};
use crate::carts::{CartService, RecoveryStats};
use crate::jobs::JobService;
use crate::loyalty::LoyaltyService;
use crate::policy::PolicyService;
use crate::rbac::RbacService;
use crate::spans::SpanService;
use starport_core::environment::Environment;
use starport_core::telemetry::Telemetry;
use starport_runtime::config::RuntimeConfig;
use starport_runtime::metrics::MetricsSink;
use starport_runtime::sinks::TracingSink;
use starport_runtime::{HealthReport, HealthStatus};
use std::sync::Arc;

/// Every feature service, wired to one environment
#[derive(Debug, Clone)]
pub struct Starport {
    environment: Environment,
    badges: BadgeService,
    policies: PolicyService,
    rbac: RbacService,
    carts: CartService,
    spans: SpanService,
    alerts: AlertService,
    loyalty: LoyaltyService,
    jobs: JobService,
}

/// Cross-feature snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Overview {
    /// Badge counters
    pub badges: BadgeStats,
    /// Cart recovery counters
    pub carts: RecoveryStats,
    /// Alerts that are firing or acknowledged
    pub active_alerts: usize,
    /// Spans still running
    pub active_spans: usize,
    /// Overall job-service health
    pub health: HealthStatus,
}

impl Starport {
    /// Build every service over `environment`.
    ///
    /// Bounded histories use `config.history_limit`; the job simulator takes its breaker,
    /// retry and latency defaults from `config`.
    #[must_use]
    pub fn new(environment: Environment, config: &RuntimeConfig) -> Self {
        let limit = config.history_limit;
        Self {
            badges: BadgeService::new(environment.clone()),
            policies: PolicyService::new(environment.clone(), limit),
            rbac: RbacService::new(environment.clone()),
            carts: CartService::new(environment.clone(), config.cart_max_reminders),
            spans: SpanService::new(environment.clone(), limit),
            alerts: AlertService::new(environment.clone(), limit),
            loyalty: LoyaltyService::new(environment.clone(), limit),
            jobs: JobService::new(environment.clone(), config),
            environment,
        }
    }

    /// Production wiring: system clock, UUID ids, the configured random source, and
    /// telemetry to `tracing` (plus Prometheus when metrics are enabled)
    #[must_use]
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let mut telemetry = Telemetry::disabled().with_sink(Arc::new(TracingSink::new()));
        if config.metrics_enabled {
            telemetry = telemetry.with_sink(Arc::new(MetricsSink));
        }
        let environment = Environment::system()
            .with_random(config.random_source())
            .with_telemetry(telemetry);

        tracing::info!(
            history_limit = config.history_limit,
            metrics = config.metrics_enabled,
            seeded = config.rng_seed.is_some(),
            "Starport initialized"
        );
        Self::new(environment, config)
    }

    /// Shared environment
    #[must_use]
    pub const fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Badges and milestone trackers
    #[must_use]
    pub const fn badges(&self) -> &BadgeService {
        &self.badges
    }

    /// Policies, rules and decisions
    #[must_use]
    pub const fn policies(&self) -> &PolicyService {
        &self.policies
    }

    /// Roles and permissions
    #[must_use]
    pub const fn rbac(&self) -> &RbacService {
        &self.rbac
    }

    /// Cart recovery
    #[must_use]
    pub const fn carts(&self) -> &CartService {
        &self.carts
    }

    /// Trace spans
    #[must_use]
    pub const fn spans(&self) -> &SpanService {
        &self.spans
    }

    /// Metric alerts
    #[must_use]
    pub const fn alerts(&self) -> &AlertService {
        &self.alerts
    }

    /// Loyalty points
    #[must_use]
    pub const fn loyalty(&self) -> &LoyaltyService {
        &self.loyalty
    }

    /// Simulated job services
    #[must_use]
    pub const fn jobs(&self) -> &JobService {
        &self.jobs
    }

    /// Breaker health of the job services
    pub async fn health(&self) -> HealthReport {
        self.jobs.health().await
    }

    /// Snapshot across features
    pub async fn overview(&self) -> Overview {
        Overview {
            badges: self.badges.stats().await,
            carts: self.carts.recovery_stats().await,
            active_alerts: self.alerts.active_alerts().await.len(),
            active_spans: self.spans.active_spans().await.len(),
            health: self.health().await.status,
        }
    }
}

//! Threshold alerting over recorded metrics.
//!
//! Rules watch one metric each. Recording a sample that breaches a rule raises an alert,
//! unless that rule already has an unresolved alert. Alerts move
//! `firing → acknowledged → resolved` (acknowledging is optional); `resolved` is terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use starport_core::environment::Environment;
use starport_core::error::LifecycleError;
use starport_core::history::BoundedLog;
use starport_core::lifecycle::{Applied, Feature, Operation};
use starport_core::registry::{Entity, Registry};
use starport_core::status::{transition, Status};
use starport_core::telemetry::TelemetryEvent;
use starport_core::view::Summary;
use starport_runtime::Dispatcher;
use std::fmt;

/// How urgent an alert is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// For the record
    Info,
    /// Needs a look
    #[default]
    Warning,
    /// Needs a look now
    Critical,
}

impl Severity {
    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Which side of the threshold breaches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// `value > threshold`
    #[default]
    Above,
    /// `value < threshold`
    Below,
}

impl Comparison {
    fn breached(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Above => value > threshold,
            Self::Below => value < threshold,
        }
    }
}

/// A threshold on one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    /// Rule ID
    pub id: String,
    /// Watched metric
    pub metric: String,
    /// Threshold
    pub threshold: f64,
    /// Breaching side
    pub comparison: Comparison,
    /// Severity of raised alerts
    pub severity: Severity,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Entity for AlertRule {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Alert lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    /// Raised, nobody has looked yet
    Firing,
    /// Someone is on it
    Acknowledged,
    /// Closed
    Resolved,
}

impl Status for AlertStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Firing => "firing",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved)
    }

    fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Firing, Self::Acknowledged | Self::Resolved) | (Self::Acknowledged, Self::Resolved)
        )
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raised alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Alert ID
    pub id: String,
    /// Rule that raised it
    pub rule_id: String,
    /// Metric name
    pub metric: String,
    /// Sample that breached
    pub value: f64,
    /// Rule threshold at the time
    pub threshold: f64,
    /// Severity
    pub severity: Severity,
    /// Lifecycle status
    pub status: AlertStatus,
    /// Raise time
    pub raised_at: DateTime<Utc>,
    /// Acknowledgement time
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// Resolution time
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Entity for Alert {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Alert feature state
#[derive(Debug, Clone)]
pub struct AlertState {
    rules: Registry<AlertRule>,
    alerts: Registry<Alert>,
    samples: Registry<BoundedLog<f64>>,
    sample_limit: usize,
}

impl AlertState {
    /// Empty state keeping the last `sample_limit` samples per metric
    #[must_use]
    pub fn new(sample_limit: usize) -> Self {
        Self {
            rules: Registry::new("AlertRule"),
            alerts: Registry::new("Alert"),
            samples: Registry::new("Metric"),
            sample_limit,
        }
    }

    /// Unresolved alerts, most severe first, then oldest first
    #[must_use]
    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut active = self.alerts.list(|a| a.status != AlertStatus::Resolved);
        active.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.raised_at.cmp(&b.raised_at)));
        active
    }

    /// Summary of the retained samples for `metric`
    #[must_use]
    pub fn metric_summary(&self, metric: &str) -> Option<Summary> {
        self.samples
            .get(metric)
            .and_then(|samples| Summary::of(samples.iter().copied()))
    }

    fn has_open_alert(&self, rule_id: &str) -> bool {
        self.alerts
            .iter()
            .any(|a| a.rule_id == rule_id && a.status != AlertStatus::Resolved)
    }
}

impl Feature for AlertState {
    const NAME: &'static str = "alerts";
}

fn require_finite(what: &str, value: f64) -> Result<(), LifecycleError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(LifecycleError::validation(format!("{what} must be a finite number, got {value}")))
    }
}

/// Create a threshold rule with a generated ID
#[derive(Debug, Clone)]
pub struct CreateAlertRule {
    /// Watched metric
    pub metric: String,
    /// Threshold
    pub threshold: f64,
    /// Breaching side
    pub comparison: Comparison,
    /// Severity of raised alerts
    pub severity: Severity,
}

impl Operation<AlertState> for CreateAlertRule {
    type Output = AlertRule;
    const NAME: &'static str = "create_rule";

    fn apply(self, state: &mut AlertState, env: &Environment) -> Result<Applied<AlertRule>, LifecycleError> {
        require_finite("threshold", self.threshold)?;
        let rule = state
            .rules
            .insert(AlertRule {
                id: env.next_id("rule"),
                metric: self.metric,
                threshold: self.threshold,
                comparison: self.comparison,
                severity: self.severity,
                created_at: env.now(),
            })
            .clone();
        let event = TelemetryEvent::new("rule_created")
            .with("rule_id", rule.id.as_str())
            .with("metric", rule.metric.as_str())
            .with("severity", rule.severity.as_str());
        Ok(Applied::new(rule).with_event(event))
    }
}

/// Record a sample; returns the alerts it raised
#[derive(Debug, Clone)]
pub struct RecordMetric {
    /// Metric name
    pub metric: String,
    /// Sample value
    pub value: f64,
}

impl Operation<AlertState> for RecordMetric {
    type Output = Vec<Alert>;
    const NAME: &'static str = "record_metric";

    fn apply(self, state: &mut AlertState, env: &Environment) -> Result<Applied<Vec<Alert>>, LifecycleError> {
        require_finite("metric value", self.value)?;
        let now = env.now();

        if !state.samples.contains(&self.metric) {
            state.samples.put(self.metric.clone(), BoundedLog::new(state.sample_limit));
        }
        state.samples.update(&self.metric, |samples| samples.push(self.value))?;

        let breached: Vec<AlertRule> = state.rules.list(|rule| {
            rule.metric == self.metric && rule.comparison.breached(self.value, rule.threshold)
        });

        let mut raised = Vec::new();
        for rule in breached {
            if state.has_open_alert(&rule.id) {
                tracing::debug!(rule_id = %rule.id, "Alert already open for rule");
                continue;
            }
            let alert = state
                .alerts
                .insert(Alert {
                    id: env.next_id("alert"),
                    rule_id: rule.id,
                    metric: rule.metric,
                    value: self.value,
                    threshold: rule.threshold,
                    severity: rule.severity,
                    status: AlertStatus::Firing,
                    raised_at: now,
                    acknowledged_at: None,
                    resolved_at: None,
                })
                .clone();
            tracing::info!(
                alert_id = %alert.id,
                metric = %alert.metric,
                value = alert.value,
                severity = alert.severity.as_str(),
                "Alert raised"
            );
            raised.push(alert);
        }

        let mut applied = Applied::new(raised.clone()).with_event(
            TelemetryEvent::new("metric_recorded")
                .with_value(self.value)
                .with("metric", self.metric.as_str()),
        );
        for alert in &raised {
            applied = applied.with_event(
                TelemetryEvent::new("raised")
                    .with_value(alert.value)
                    .with("alert_id", alert.id.as_str())
                    .with("rule_id", alert.rule_id.as_str())
                    .with("severity", alert.severity.as_str()),
            );
        }
        Ok(applied)
    }
}

/// Acknowledge a firing alert
#[derive(Debug, Clone)]
pub struct Acknowledge {
    /// Alert ID
    pub alert_id: String,
}

impl Operation<AlertState> for Acknowledge {
    type Output = Alert;
    const NAME: &'static str = "acknowledge";

    fn apply(self, state: &mut AlertState, env: &Environment) -> Result<Applied<Alert>, LifecycleError> {
        let alert = state.alerts.require_mut(&self.alert_id)?;
        alert.status = transition("Alert", &alert.id, alert.status, AlertStatus::Acknowledged)?;
        alert.acknowledged_at = Some(env.now());
        let alert = alert.clone();
        let event = TelemetryEvent::new("acknowledged").with("alert_id", alert.id.as_str());
        Ok(Applied::new(alert).with_event(event))
    }
}

/// Resolve an alert for good
#[derive(Debug, Clone)]
pub struct Resolve {
    /// Alert ID
    pub alert_id: String,
}

impl Operation<AlertState> for Resolve {
    type Output = Alert;
    const NAME: &'static str = "resolve";

    fn apply(self, state: &mut AlertState, env: &Environment) -> Result<Applied<Alert>, LifecycleError> {
        let alert = state.alerts.require_mut(&self.alert_id)?;
        alert.status = transition("Alert", &alert.id, alert.status, AlertStatus::Resolved)?;
        alert.resolved_at = Some(env.now());
        let alert = alert.clone();
        let event = TelemetryEvent::new("resolved").with("alert_id", alert.id.as_str());
        Ok(Applied::new(alert).with_event(event))
    }
}

/// Alert service
#[derive(Debug, Clone)]
pub struct AlertService {
    dispatcher: Dispatcher<AlertState>,
}

impl AlertService {
    /// Empty service keeping the last `sample_limit` samples per metric
    #[must_use]
    pub fn new(env: Environment, sample_limit: usize) -> Self {
        Self {
            dispatcher: Dispatcher::new(AlertState::new(sample_limit), env),
        }
    }

    /// Alert when `metric` goes above `threshold`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a non-finite threshold.
    pub async fn create_rule(
        &self,
        metric: impl Into<String>,
        threshold: f64,
        severity: Severity,
    ) -> Result<AlertRule, LifecycleError> {
        self.create_rule_with(metric, threshold, Comparison::Above, severity).await
    }

    /// Alert when `metric` breaches `threshold` on the given side.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a non-finite threshold.
    pub async fn create_rule_with(
        &self,
        metric: impl Into<String>,
        threshold: f64,
        comparison: Comparison,
        severity: Severity,
    ) -> Result<AlertRule, LifecycleError> {
        self.dispatcher
            .send(CreateAlertRule {
                metric: metric.into(),
                threshold,
                comparison,
                severity,
            })
            .await
    }

    /// Record a sample; returns the alerts it raised.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a non-finite value.
    pub async fn record_metric(&self, metric: impl Into<String>, value: f64) -> Result<Vec<Alert>, LifecycleError> {
        self.dispatcher
            .send(RecordMetric {
                metric: metric.into(),
                value,
            })
            .await
    }

    /// Acknowledge an alert.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `InvalidTransition`.
    pub async fn acknowledge(&self, alert_id: impl Into<String>) -> Result<Alert, LifecycleError> {
        self.dispatcher.send(Acknowledge { alert_id: alert_id.into() }).await
    }

    /// Resolve an alert.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `InvalidTransition`.
    pub async fn resolve(&self, alert_id: impl Into<String>) -> Result<Alert, LifecycleError> {
        self.dispatcher.send(Resolve { alert_id: alert_id.into() }).await
    }

    /// Unresolved alerts, most severe first
    pub async fn active_alerts(&self) -> Vec<Alert> {
        self.dispatcher.state(AlertState::active_alerts).await
    }

    /// Summary of retained samples; `None` for an unknown metric
    pub async fn metric_summary(&self, metric: &str) -> Option<Summary> {
        self.dispatcher.state(|s| s.metric_summary(metric)).await
    }
}

//! Starport Demo
//!
//! Runs a short scenario across every feature:
//! - Badge milestones unlocked by tracked progress
//! - A policy decision and a permission check
//! - An abandoned cart recovered after a reminder
//! - A traced job run through a circuit breaker, with loyalty points for the result
//! - An alert raised from a recorded metric
//!
//! # Usage
//!
//! ```bash
//! STARPORT_RNG_SEED=7 STARPORT_LOG=info,starport::telemetry=debug cargo run --bin starport-demo
//!
//! # With the Prometheus exporter on :9090
//! STARPORT_METRICS_ENABLED=true cargo run --bin starport-demo
//! ```

#![allow(missing_docs)]

use serde_json::json;
use starport_features::alerts::Severity;
use starport_features::badges::{BadgeSpec, Milestone};
use starport_features::carts::CartItem;
use starport_features::jobs::ServiceSpec;
use starport_features::policy::{Condition, Context, Effect, PolicySpec, RuleSpec};
use starport_features::spans::SpanOutcome;
use starport_features::Starport;
use starport_runtime::metrics::MetricsServer;
use starport_runtime::RuntimeConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RuntimeConfig::from_env();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.log_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut metrics = None;
    if config.metrics_enabled {
        let mut server = MetricsServer::new(config.metrics_addr()?);
        server.start()?;
        tracing::info!(addr = %config.metrics_addr()?, "Prometheus metrics available at /metrics");
        metrics = Some(server);
    }

    let app = Starport::from_config(&config);

    // Badges
    let badges = app.badges();
    badges.register_badge("first_light", BadgeSpec::in_category("observation")).await?;
    badges.register_badge("deep_field", BadgeSpec::in_category("observation")).await?;
    badges
        .register_tracker(
            "stars_catalogued",
            vec![Milestone::new(1, "first_light"), Milestone::new(100, "deep_field")],
        )
        .await?;
    let report = badges.track_progress("vega", "stars_catalogued", 120).await?;
    tracing::info!(
        unlocked = ?report.newly_unlocked,
        progress_pct = report.progress_pct,
        "Progress tracked"
    );

    // Policy + RBAC
    let policies = app.policies();
    policies
        .create_rule(
            "block_guests",
            RuleSpec::with_effect(Effect::Deny).when(Condition::equals("role", "guest")),
        )
        .await?;
    policies.create_rule("allow_rest", RuleSpec::default()).await?;
    policies
        .create_policy("observatory_access", PolicySpec::with_rules(["block_guests", "allow_rest"]))
        .await?;
    let context: Context = [("role".to_string(), json!("guest"))].into_iter().collect();
    let decision = policies.evaluate("observatory_access", context).await?;
    tracing::info!(allowed = decision.allowed, reason = %decision.reason, "Policy evaluated");

    let rbac = app.rbac();
    rbac.create_role("astronomer", ["read:telescope", "write:catalog"]).await?;
    rbac.assign_role("vega", "astronomer").await?;
    tracing::info!(
        can_write = rbac.has_permission("vega", "write:catalog").await,
        permissions = ?rbac.user_permissions("vega").await,
        "Permissions resolved"
    );

    // Cart recovery
    let carts = app.carts();
    let cart = carts.create_cart("vega").await?;
    carts.add_item(&cart.id, CartItem::new("eyepiece-25mm", 2, 4_500)).await?;
    carts.mark_abandoned(&cart.id).await?;
    carts.send_reminder(&cart.id).await?;
    carts.recover(&cart.id).await?;
    let checked_out = carts.checkout(&cart.id).await?;
    tracing::info!(total_cents = checked_out.total_cents(), "Cart recovered and checked out");

    // Job run, traced, rewarded with points
    let spans = app.spans();
    let root = spans.start_span("classify_galaxy", None).await?;
    let jobs = app.jobs();
    jobs.register_service("classifier", ServiceSpec::default()).await?;
    let job = jobs.submit_job("classifier", json!({"galaxy": "NGC 1300"})).await?;
    let child = spans.start_span("run_job", Some(root.id.as_str())).await?;
    let job = jobs.run_job(&job.id).await?;
    let outcome = match &job.error {
        Some(error) => SpanOutcome::Error(error.clone()),
        None => SpanOutcome::Ok,
    };
    spans.finish_span(&child.id, outcome.clone()).await?;
    spans.finish_span(&root.id, outcome).await?;
    let tree = spans.trace(&root.id).await?;
    tracing::info!(status = %job.status, attempts = job.attempts, spans = tree.size(), "Job finished");

    let loyalty = app.loyalty();
    let account = loyalty.open_account("vega").await?;
    if let Some(result) = job.result {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let points = (result.score * 1_000.0).round() as u64 + 1;
        loyalty.earn(&account.id, points, "classification").await?;
    }
    tracing::info!(balance = loyalty.balance(&account.id).await?, "Loyalty balance");

    // Alerts
    let alerts = app.alerts();
    alerts.create_rule("job_latency_ms", 40.0, Severity::Warning).await?;
    if let Some(result) = job.result {
        #[allow(clippy::cast_precision_loss)]
        let raised = alerts.record_metric("job_latency_ms", result.latency_ms as f64).await?;
        tracing::info!(raised = raised.len(), "Latency recorded");
    }

    let overview = app.overview().await;
    tracing::info!(
        badges = overview.badges.total_unlocks,
        recovered = overview.carts.recovered,
        active_alerts = overview.active_alerts,
        health = %overview.health,
        "Demo complete"
    );

    if let Some(rendered) = metrics.as_ref().and_then(MetricsServer::render) {
        tracing::debug!(lines = rendered.lines().count(), "Metrics rendered");
    }

    Ok(())
}

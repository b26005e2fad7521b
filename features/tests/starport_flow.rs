//! End-to-end flows across Starport features.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde_json::json;
use starport_core::error::LifecycleError;
use starport_core::status::RunStatus;
use starport_core::telemetry::Telemetry;
use starport_features::badges::{BadgeSpec, Milestone};
use starport_features::carts::{CartItem, CartStatus};
use starport_features::jobs::ServiceSpec;
use starport_features::loyalty::Level;
use starport_features::policy::{Condition, Context, Effect, PolicySpec, RuleSpec};
use starport_features::spans::SpanOutcome;
use starport_features::Starport;
use starport_runtime::{HealthStatus, RuntimeConfig};
use starport_testing::{
    assertions, init_test_tracing, recording_environment, test_environment, FailingSink, PanickingSink,
};
use std::sync::Arc;

fn config() -> RuntimeConfig {
    RuntimeConfig {
        retry_jitter: 0.0,
        retry_initial_delay_ms: 5,
        job_max_latency_ms: 20,
        history_limit: 16,
        ..RuntimeConfig::default()
    }
}

#[tokio::test]
async fn test_progress_unlocks_badges_and_rewards_points() {
    init_test_tracing();
    let (env, sink) = recording_environment();
    let app = Starport::new(env, &config());

    app.badges().register_badge("first_light", BadgeSpec::default()).await.unwrap();
    app.badges().register_badge("deep_field", BadgeSpec::default()).await.unwrap();
    app.badges()
        .register_tracker(
            "stars",
            vec![Milestone::new(1, "first_light"), Milestone::new(100, "deep_field")],
        )
        .await
        .unwrap();

    let report = app.badges().track_progress("vega", "stars", 150).await.unwrap();
    assert_eq!(report.newly_unlocked, vec!["first_light", "deep_field"]);

    let account = app.loyalty().open_account("vega").await.unwrap();
    for badge in &report.newly_unlocked {
        app.loyalty().earn(&account.id, 300, badge.as_str()).await.unwrap();
    }

    let account = app.loyalty().get_account(&account.id).await.unwrap();
    assert_eq!(account.balance, 600);
    assert_eq!(account.level, Level::Explorer);
    assert_eq!(sink.named("badges_unlocked").len(), 2);
    assert_eq!(sink.named("loyalty_level_up").len(), 1);
}

#[tokio::test]
async fn test_policy_and_rbac_gate_cart_checkout() {
    let app = Starport::new(test_environment(), &config());
    app.policies()
        .create_rule(
            "deny_suspended",
            RuleSpec::with_effect(Effect::Deny).when(Condition::equals("suspended", true)),
        )
        .await
        .unwrap();
    app.policies().create_rule("allow", RuleSpec::default()).await.unwrap();
    app.policies()
        .create_policy("checkout", PolicySpec::with_rules(["deny_suspended", "allow"]))
        .await
        .unwrap();

    let suspended: Context = [("suspended".to_string(), json!(true))].into_iter().collect();
    let decision = app.policies().evaluate("checkout", suspended).await.unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.rule_id.as_deref(), Some("deny_suspended"));

    assert!(app.rbac().has_permission("vega", "read:public").await);
    assert!(!app.rbac().has_permission("vega", "delete:catalog").await);

    let cart = app.carts().create_cart("vega").await.unwrap();
    let err = app.carts().checkout(&cart.id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Validation(_)));

    app.carts().add_item(&cart.id, CartItem::new("star-chart", 1, 1_200)).await.unwrap();
    let cart = app.carts().checkout(&cart.id).await.unwrap();
    assert_eq!(cart.status, CartStatus::CheckedOut);

    let err = app.carts().mark_abandoned(&cart.id).await.unwrap_err();
    assertions::assert_invalid_transition(&err, "abandoned");
}

#[tokio::test(start_paused = true)]
async fn test_traced_job_run() {
    let app = Starport::new(test_environment(), &config());
    app.jobs()
        .register_service(
            "classifier",
            ServiceSpec {
                failure_rate: 0.0,
                ..ServiceSpec::default()
            },
        )
        .await
        .unwrap();

    let root = app.spans().start_span("classify", None).await.unwrap();
    let child = app.spans().start_span("run_job", Some(root.id.as_str())).await.unwrap();
    let job = app.jobs().submit_job("classifier", json!({"galaxy": "M51"})).await.unwrap();
    let job = app.jobs().run_job(&job.id).await.unwrap();
    assert_eq!(job.status, RunStatus::Completed);
    assert_eq!(job.attempts, 1);

    app.spans().finish_span(&child.id, SpanOutcome::Ok).await.unwrap();
    assert_eq!(app.spans().active_spans().await.len(), 1);
    app.spans().finish_span(&root.id, SpanOutcome::Ok).await.unwrap();

    let tree = app.spans().trace(&root.id).await.unwrap();
    assert_eq!(tree.size(), 2);
    assert_eq!(tree.children[0].span.trace_id, root.trace_id);
    assert_eq!(app.health().await.status, HealthStatus::Healthy);
}

#[tokio::test(start_paused = true)]
async fn test_same_seed_same_job_outcomes() {
    async fn run_all() -> Vec<(RunStatus, usize)> {
        let app = Starport::new(test_environment(), &config());
        app.jobs()
            .register_service(
                "flaky",
                ServiceSpec {
                    failure_rate: 0.5,
                    ..ServiceSpec::default()
                },
            )
            .await
            .unwrap();
        let mut outcomes = Vec::new();
        for n in 0..5 {
            let job = app.jobs().submit_job("flaky", json!(n)).await.unwrap();
            let job = app.jobs().run_job(&job.id).await.unwrap();
            outcomes.push((job.status, job.attempts));
        }
        outcomes
    }

    assert_eq!(run_all().await, run_all().await);
}

#[tokio::test]
async fn test_failing_telemetry_never_breaks_operations() {
    let telemetry = Telemetry::disabled()
        .with_sink(Arc::new(FailingSink))
        .with_sink(Arc::new(PanickingSink));
    let app = Starport::new(test_environment().with_telemetry(telemetry.clone()), &config());

    app.badges().register_badge("b1", BadgeSpec::default()).await.unwrap();
    let outcome = app.badges().unlock_badge("u1", "b1").await.unwrap();
    assert!(outcome.newly_unlocked);

    let rule = app.alerts().create_rule("cpu", 90.0, Default::default()).await.unwrap();
    let raised = app.alerts().record_metric("cpu", 99.0).await.unwrap();
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].rule_id, rule.id);

    assert!(telemetry.dropped_failures() >= 4);
}

#[tokio::test]
async fn test_unknown_ids_are_not_found_everywhere() {
    let app = Starport::new(test_environment(), &config());

    let err = app.badges().unlock_badge("u1", "ghost").await.unwrap_err();
    assertions::assert_not_found(&err, "Badge", "ghost");
    let err = app.carts().recover("ghost").await.unwrap_err();
    assertions::assert_not_found(&err, "Cart", "ghost");
    let err = app.spans().finish_span("ghost", SpanOutcome::Ok).await.unwrap_err();
    assertions::assert_not_found(&err, "Span", "ghost");
    let err = app.loyalty().balance("ghost").await.unwrap_err();
    assertions::assert_not_found(&err, "Account", "ghost");
    let err = app.jobs().run_job("ghost").await.unwrap_err();
    assertions::assert_not_found(&err, "Job", "ghost");
    let err = app.policies().evaluate("ghost", Context::new()).await.unwrap_err();
    assertions::assert_not_found(&err, "Policy", "ghost");
}

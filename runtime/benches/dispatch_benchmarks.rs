//! Dispatcher and resilience benchmarks
//!
//! - Operation apply in isolation (no lock, no telemetry)
//! - Dispatcher round trip with and without telemetry sinks
//! - Circuit breaker overhead on a successful call
//!
//! Run with: `cargo bench`

#![allow(missing_docs)]
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use starport_core::environment::Environment;
use starport_core::error::LifecycleError;
use starport_core::lifecycle::{Applied, Feature, Operation};
use starport_core::registry::Registry;
use starport_core::telemetry::{NoopSink, Telemetry, TelemetryEvent};
use starport_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use starport_runtime::Dispatcher;
use std::sync::Arc;

struct ScoreState {
    scores: Registry<u64>,
}

impl Default for ScoreState {
    fn default() -> Self {
        let mut scores = Registry::new("Score");
        for i in 0..1_000 {
            scores.put(format!("player_{i}"), 0);
        }
        Self { scores }
    }
}

impl Feature for ScoreState {
    const NAME: &'static str = "scores";
}

struct AddPoints(&'static str, u64);

impl Operation<ScoreState> for AddPoints {
    type Output = u64;
    const NAME: &'static str = "add_points";

    fn apply(self, state: &mut ScoreState, _env: &Environment) -> Result<Applied<u64>, LifecycleError> {
        let total = state.scores.update(self.0, |score| {
            *score += self.1;
            *score
        })?;
        Ok(Applied::new(total).with_event(TelemetryEvent::new("points_added").with_value(1.0)))
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

/// Operation apply in isolation
fn benchmark_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("operation");
    group.throughput(Throughput::Elements(1));

    let env = Environment::system();
    group.bench_function("add_points", |b| {
        let mut state = ScoreState::default();
        b.iter(|| {
            let _ = black_box(AddPoints("player_500", 5)).apply(&mut state, &env);
        });
    });

    group.finish();
}

/// Dispatcher round trip (lock + apply + telemetry fan-out)
fn benchmark_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatcher");
    group.throughput(Throughput::Elements(1));
    let runtime = runtime();

    group.bench_function("send_no_sinks", |b| {
        let dispatcher = Dispatcher::new(ScoreState::default(), Environment::system());
        b.to_async(&runtime).iter(|| async {
            let _ = dispatcher.send(black_box(AddPoints("player_1", 1))).await;
        });
    });

    group.bench_function("send_three_sinks", |b| {
        let telemetry = Telemetry::disabled()
            .with_sink(Arc::new(NoopSink))
            .with_sink(Arc::new(NoopSink))
            .with_sink(Arc::new(NoopSink));
        let dispatcher = Dispatcher::new(
            ScoreState::default(),
            Environment::system().with_telemetry(telemetry),
        );
        b.to_async(&runtime).iter(|| async {
            let _ = dispatcher.send(black_box(AddPoints("player_1", 1))).await;
        });
    });

    group.bench_function("send_and_read_state", |b| {
        let dispatcher = Dispatcher::new(ScoreState::default(), Environment::system());
        b.to_async(&runtime).iter(|| async {
            let _ = dispatcher.send(black_box(AddPoints("player_1", 1))).await;
            let _total = dispatcher.state(|s| s.scores.get("player_1").copied()).await;
        });
    });

    group.finish();
}

/// Circuit breaker overhead on the happy path
fn benchmark_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");
    group.throughput(Throughput::Elements(1));
    let runtime = runtime();

    group.bench_function("closed_call", |b| {
        let breaker = CircuitBreaker::new("bench", CircuitBreakerConfig::default(), &Environment::system());
        b.to_async(&runtime).iter(|| async {
            let _ = breaker.call(|| async { Ok::<_, String>(black_box(1)) }).await;
        });
    });

    group.finish();
}

criterion_group!(benches, benchmark_apply, benchmark_dispatch, benchmark_breaker);
criterion_main!(benches);

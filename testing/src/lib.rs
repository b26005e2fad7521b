//! # Starport Testing
//!
//! Testing utilities and helpers for Starport features.
//!
//! This crate provides:
//! - Deterministic implementations of the environment traits (clocks, ids, randomness)
//! - Telemetry sinks that record, fail or panic
//! - A Given-When-Then harness for operations ([`LifecycleTest`])
//! - proptest strategies for common inputs
//!
//! ## Example
//!
//! ```ignore
//! use starport_testing::{recording_environment, test_environment};
//! use starport_runtime::Dispatcher;
//!
//! #[tokio::test]
//! async fn test_unlock_flow() {
//!     let (env, sink) = recording_environment();
//!     let badges = BadgeService::new(env);
//!
//!     badges.register_badge("first_scan", spec).await.unwrap();
//!     badges.unlock_badge("u1", "first_scan").await.unwrap();
//!
//!     assert_eq!(sink.names(), vec!["badges_registered", "badges_unlocked"]);
//! }
//! ```

use chrono::{DateTime, Utc};
use starport_core::environment::{Clock, Environment, SeededRandom};
use starport_core::telemetry::Telemetry;
use std::sync::Arc;


pub use lifecycle_test::{assertions, LifecycleTest};

/// Mock implementations of environment traits and telemetry sinks.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use starport_core::environment::{IdGenerator, RandomSource};
    use starport_core::telemetry::{TelemetryError, TelemetryEvent, TelemetrySink};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use starport_testing::mocks::FixedClock;
    /// use starport_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// 2025-01-01 00:00:00 UTC
    #[must_use]
    pub fn test_epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default()
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_epoch())
    }

    /// Clock that only moves when told to
    ///
    /// Starts at [`test_epoch`] by default.
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Clock starting at `start`
        #[must_use]
        pub const fn new(start: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(start),
            }
        }

        /// Move the clock forward
        pub fn advance(&self, by: Duration) {
            let by = chrono::TimeDelta::from_std(by).unwrap_or(chrono::TimeDelta::MAX);
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time = time.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC);
        }

        /// Jump to an absolute time
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(test_epoch())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Predictable IDs: `<prefix>_1`, `<prefix>_2`, ...
    ///
    /// One counter is shared by every prefix.
    #[derive(Debug, Default)]
    pub struct SequentialIdGenerator {
        next: AtomicU64,
    }

    impl SequentialIdGenerator {
        /// Generator starting at 1
        #[must_use]
        pub const fn new() -> Self {
            Self {
                next: AtomicU64::new(0),
            }
        }
    }

    impl IdGenerator for SequentialIdGenerator {
        fn generate(&self, prefix: &str) -> String {
            let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
            format!("{prefix}_{n}")
        }
    }

    /// Random source replaying a fixed script, cycling when exhausted
    ///
    /// An empty script always yields `0.0`.
    #[derive(Debug)]
    pub struct ScriptedRandom {
        script: Vec<f64>,
        cursor: Mutex<usize>,
    }

    impl ScriptedRandom {
        /// Replay `script` in order; values are clamped to `[0, 1)`
        #[must_use]
        pub fn new(script: Vec<f64>) -> Self {
            let script = script
                .into_iter()
                .map(|v| v.clamp(0.0, 1.0 - f64::EPSILON))
                .collect();
            Self {
                script,
                cursor: Mutex::new(0),
            }
        }

        /// Always yield `value`
        #[must_use]
        pub fn constant(value: f64) -> Self {
            Self::new(vec![value])
        }
    }

    impl RandomSource for ScriptedRandom {
        fn next_f64(&self) -> f64 {
            if self.script.is_empty() {
                return 0.0;
            }
            let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
            let value = self.script[*cursor % self.script.len()];
            *cursor += 1;
            value
        }
    }

    /// Sink that keeps every event it receives
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<TelemetryEvent>>,
    }

    impl RecordingSink {
        /// Empty recorder
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Copies of the recorded events, oldest first
        #[must_use]
        pub fn events(&self) -> Vec<TelemetryEvent> {
            self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }

        /// Recorded event names, oldest first
        #[must_use]
        pub fn names(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .map(|e| e.name.clone())
                .collect()
        }

        /// Recorded events with the given name
        #[must_use]
        pub fn named(&self, name: &str) -> Vec<TelemetryEvent> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|e| e.name == name)
                .cloned()
                .collect()
        }

        /// Number of recorded events
        #[must_use]
        pub fn len(&self) -> usize {
            self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
        }

        /// Whether nothing was recorded
        #[must_use]
        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        /// Forget recorded events
        pub fn clear(&self) {
            self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
        }
    }

    impl TelemetrySink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn emit(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
            Ok(())
        }
    }

    /// Sink whose collector is always unreachable
    #[derive(Debug, Clone, Copy, Default)]
    pub struct FailingSink;

    impl TelemetrySink for FailingSink {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn emit(&self, _event: &TelemetryEvent) -> Result<(), TelemetryError> {
            Err(TelemetryError::Unavailable("collector offline".to_string()))
        }
    }

    /// Sink that panics on every event
    #[derive(Debug, Clone, Copy, Default)]
    pub struct PanickingSink;

    impl TelemetrySink for PanickingSink {
        fn name(&self) -> &'static str {
            "panicking"
        }

        #[allow(clippy::panic)] // Exercises the adapter's panic containment
        fn emit(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
            panic!("telemetry collector crashed on {}", event.name);
        }
    }
}

/// proptest strategies for common inputs.
pub mod properties {
    use proptest::prelude::*;

    /// Entity IDs such as `cart_17`
    pub fn entity_id() -> impl Strategy<Value = String> {
        "[a-z]{1,8}_[0-9]{1,4}"
    }

    /// Point amounts small enough that sums cannot overflow
    pub fn points() -> impl Strategy<Value = u64> {
        1u64..10_000
    }

    /// Probabilities in `[0, 1)`
    pub fn unit_interval() -> impl Strategy<Value = f64> {
        0.0f64..1.0
    }
}

pub use mocks::{
    test_clock, test_epoch, FailingSink, FixedClock, ManualClock, PanickingSink, RecordingSink,
    ScriptedRandom, SequentialIdGenerator,
};

/// Deterministic environment: fixed clock at [`test_epoch`], sequential IDs, a seeded
/// random source and no telemetry sinks.
#[must_use]
pub fn test_environment() -> Environment {
    Environment::new(Arc::new(test_clock()))
        .with_ids(Arc::new(SequentialIdGenerator::new()))
        .with_random(Arc::new(SeededRandom::new(42)))
        .with_telemetry(Telemetry::disabled())
}

/// [`test_environment`] with a [`RecordingSink`] attached
#[must_use]
pub fn recording_environment() -> (Environment, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let env = test_environment().with_telemetry(Telemetry::disabled().with_sink(sink.clone()));
    (env, sink)
}

/// Install a test-writer `tracing` subscriber once; later calls are no-ops
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use starport_core::environment::{IdGenerator, RandomSource};
    use starport_core::telemetry::{TelemetryEvent, TelemetrySink};
    use std::time::Duration;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::default();
        clock.advance(Duration::from_secs(90));
        assert_eq!((clock.now() - test_epoch()).num_seconds(), 90);
    }

    #[test]
    fn test_sequential_ids() {
        let ids = SequentialIdGenerator::new();
        assert_eq!(ids.generate("cart"), "cart_1");
        assert_eq!(ids.generate("span"), "span_2");
    }

    #[test]
    fn test_scripted_random_cycles() {
        let random = ScriptedRandom::new(vec![0.1, 0.9]);
        let draws: Vec<f64> = (0..3).map(|_| random.next_f64()).collect();
        assert_eq!(draws, vec![0.1, 0.9, 0.1]);
        assert!(ScriptedRandom::constant(1.0).next_f64() < 1.0);
    }

    #[test]
    fn test_recording_environment_captures_events() {
        let (env, sink) = recording_environment();
        env.telemetry.emit(&TelemetryEvent::new("ping").with("n", serde_json::json!(1)));
        assert_eq!(sink.names(), vec!["ping"]);
        assert_eq!(sink.named("ping").len(), 1);
    }

    #[test]
    fn test_failing_sink_reports_error() {
        assert!(FailingSink.emit(&TelemetryEvent::new("ping")).is_err());
    }
}

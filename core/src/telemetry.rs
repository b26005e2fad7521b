//! Best-effort telemetry.
//!
//! Operations describe what happened as [`TelemetryEvent`] values. The [`Telemetry`]
//! adapter forwards each event to every configured [`TelemetrySink`] and absorbs
//! whatever goes wrong there: an `Err` from a sink, or a sink that panics, is logged at
//! `debug` and counted, never returned. With no sinks configured the adapter is a no-op.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use starport_core::telemetry::{NoopSink, Telemetry, TelemetryEvent};
//!
//! let telemetry = Telemetry::disabled().with_sink(Arc::new(NoopSink));
//! telemetry.emit(&TelemetryEvent::new("badges_unlocked").with("badge_id", "b1"));
//! assert_eq!(telemetry.dropped_failures(), 0);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// A named event with a flat key/value payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Event name, e.g. `carts_recovered`
    pub name: String,
    /// Metric value (1.0 for plain occurrences)
    pub value: f64,
    /// Flat properties
    pub properties: BTreeMap<String, Value>,
}

impl TelemetryEvent {
    /// Occurrence event with value `1.0`
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: 1.0,
            properties: BTreeMap::new(),
        }
    }

    /// Set the metric value
    #[must_use]
    pub const fn with_value(mut self, value: f64) -> Self {
        self.value = value;
        self
    }

    /// Add a property
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Prefix the name with a feature namespace and record it as a property
    #[must_use]
    pub fn in_feature(mut self, feature: &str) -> Self {
        let prefix = format!("{feature}_");
        if !self.name.starts_with(&prefix) {
            self.name = format!("{prefix}{}", self.name);
        }
        self.properties
            .entry("feature".to_string())
            .or_insert_with(|| Value::from(feature));
        self
    }

    /// Look up a property
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}

/// Errors a sink may report; the adapter discards them
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    /// The collector refused the event
    #[error("telemetry sink rejected event: {0}")]
    Rejected(String),
    /// The collector is not reachable
    #[error("telemetry sink unavailable: {0}")]
    Unavailable(String),
}

/// A telemetry collector
pub trait TelemetrySink: Send + Sync {
    /// Collector name for logs
    fn name(&self) -> &'static str {
        "sink"
    }

    /// Forward one event
    ///
    /// # Errors
    ///
    /// Implementations may fail freely; the [`Telemetry`] adapter discards failures.
    fn emit(&self, event: &TelemetryEvent) -> Result<(), TelemetryError>;
}

/// Collector that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn emit(&self, _event: &TelemetryEvent) -> Result<(), TelemetryError> {
        Ok(())
    }
}

/// Fan-out adapter over zero or more sinks
#[derive(Clone, Default)]
pub struct Telemetry {
    sinks: Vec<Arc<dyn TelemetrySink>>,
    dropped: Arc<AtomicU64>,
}

impl Telemetry {
    /// Adapter with no sinks
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Add a sink
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of configured sinks
    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Number of sink failures absorbed so far
    #[must_use]
    pub fn dropped_failures(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Forward `event` to every sink; never fails
    pub fn emit(&self, event: &TelemetryEvent) {
        for sink in &self.sinks {
            match catch_unwind(AssertUnwindSafe(|| sink.emit(event))) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        sink = sink.name(),
                        event = %event.name,
                        error = %error,
                        "Telemetry sink failed, event dropped"
                    );
                }
                Err(_) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        sink = sink.name(),
                        event = %event.name,
                        "Telemetry sink panicked, event dropped"
                    );
                }
            }
        }
    }

    /// Forward a batch of events
    pub fn emit_all<'a>(&self, events: impl IntoIterator<Item = &'a TelemetryEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.sinks.iter().map(|s| s.name()).collect();
        f.debug_struct("Telemetry")
            .field("sinks", &names)
            .field("dropped", &self.dropped_failures())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture(Mutex<Vec<String>>);

    impl TelemetrySink for Capture {
        fn emit(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
            self.0.lock().unwrap().push(event.name.clone());
            Ok(())
        }
    }

    struct Broken;

    impl TelemetrySink for Broken {
        fn emit(&self, _event: &TelemetryEvent) -> Result<(), TelemetryError> {
            Err(TelemetryError::Unavailable("collector offline".into()))
        }
    }

    struct Exploding;

    impl TelemetrySink for Exploding {
        #[allow(clippy::panic)]
        fn emit(&self, _event: &TelemetryEvent) -> Result<(), TelemetryError> {
            panic!("collector blew up");
        }
    }

    #[test]
    fn test_in_feature_prefixes_once() {
        let event = TelemetryEvent::new("unlocked").in_feature("badges").in_feature("badges");
        assert_eq!(event.name, "badges_unlocked");
        assert_eq!(event.property("feature"), Some(&Value::from("badges")));
    }

    #[test]
    fn test_fan_out_reaches_every_sink() {
        let first = Arc::new(Capture::default());
        let second = Arc::new(Capture::default());
        let telemetry = Telemetry::disabled()
            .with_sink(first.clone())
            .with_sink(second.clone());

        telemetry.emit(&TelemetryEvent::new("ping"));

        assert_eq!(first.0.lock().unwrap().as_slice(), ["ping"]);
        assert_eq!(second.0.lock().unwrap().as_slice(), ["ping"]);
    }

    #[test]
    fn test_failing_and_panicking_sinks_are_absorbed() {
        let capture = Arc::new(Capture::default());
        let telemetry = Telemetry::disabled()
            .with_sink(Arc::new(Broken))
            .with_sink(Arc::new(Exploding))
            .with_sink(capture.clone());

        telemetry.emit(&TelemetryEvent::new("ping"));

        assert_eq!(telemetry.dropped_failures(), 2);
        assert_eq!(capture.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_event_builder() {
        let event = TelemetryEvent::new("metric")
            .with_value(42.5)
            .with("planet", "kepler-186f")
            .with("habitable", true);

        assert!((event.value - 42.5).abs() < f64::EPSILON);
        assert_eq!(event.property("habitable"), Some(&Value::Bool(true)));
    }
}

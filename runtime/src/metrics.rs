//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for the runtime:
//! - Dispatched operations per feature
//! - Circuit breaker state and call outcomes
//! - Retry attempts
//! - Telemetry events forwarded through [`MetricsSink`]
//!
//! # Example
//!
//! ```rust,no_run
//! use starport_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use starport_core::telemetry::{TelemetryError, TelemetryEvent, TelemetrySink};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Installs the global recorder and exposes metrics on an HTTP endpoint for scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions, install the global recorder and serve `/metrics` on `addr`.
    ///
    /// The listener is bound before this returns and served by a task on the current Tokio
    /// runtime, so this must be called from within one.
    ///
    /// # Errors
    ///
    /// Returns error if no Tokio runtime is running or the exporter cannot be built or bound.
    ///
    /// # Note
    ///
    /// A second install in the same process (e.g. across tests) is logged and treated
    /// as success; the first recorder stays in place, no listener is started and `handle()`
    /// stays `None`.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| MetricsError::Install(e.to_string()))?;
        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let (recorder, exporter) = {
            let _guard = runtime.enter();
            builder.build().map_err(|e| MetricsError::Build(e.to_string()))?
        };
        let handle = recorder.handle();

        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        let addr = self.addr;
        runtime.spawn(async move {
            if let Err(_e) = exporter.await {
                // ExporterError implements neither Debug nor Display in metrics-exporter-prometheus 0.15.
                tracing::error!(%addr, "Metrics exporter stopped");
            }
        });
        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Metrics exporter installed");
        Ok(())
    }

    /// Address the exporter listens on
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Dispatcher
    describe_counter!(
        "starport_operations_total",
        "Operations applied, by feature and operation"
    );
    describe_counter!(
        "starport_operation_rejections_total",
        "Operations rejected with a lifecycle error"
    );
    describe_histogram!(
        "starport_operation_duration_seconds",
        "Time taken to apply an operation, including lock wait"
    );

    // Circuit breakers
    describe_gauge!(
        "starport_breaker_state",
        "Current circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!(
        "starport_breaker_calls_total",
        "Calls through a circuit breaker, by outcome"
    );
    describe_counter!(
        "starport_breaker_transitions_total",
        "Circuit breaker state transitions"
    );

    // Retry
    describe_counter!("starport_retry_attempts_total", "Total number of attempts made");
    describe_counter!(
        "starport_retry_successes_total",
        "Retried operations that eventually succeeded"
    );
    describe_counter!(
        "starport_retry_exhausted_total",
        "Retried operations that ran out of attempts"
    );

    // Telemetry
    describe_counter!(
        "starport_telemetry_events_total",
        "Telemetry events forwarded to the metrics sink"
    );
    describe_histogram!(
        "starport_telemetry_event_value",
        "Values carried by telemetry events"
    );
}

/// Dispatcher metrics recorder.
pub struct DispatchMetrics;

impl DispatchMetrics {
    /// Record an applied operation.
    pub fn record_operation(feature: &'static str, operation: &'static str, duration: Duration) {
        counter!("starport_operations_total", "feature" => feature, "operation" => operation)
            .increment(1);
        histogram!("starport_operation_duration_seconds", "feature" => feature)
            .record(duration.as_secs_f64());
    }

    /// Record a rejected operation.
    pub fn record_rejection(feature: &'static str, operation: &'static str) {
        counter!("starport_operation_rejections_total", "feature" => feature, "operation" => operation)
            .increment(1);
    }
}

/// Circuit breaker metrics recorder.
pub struct BreakerMetrics;

impl BreakerMetrics {
    /// Record circuit breaker state.
    ///
    /// 0 = Closed, 1 = `HalfOpen`, 2 = Open
    pub fn record_state(breaker: &str, state: f64) {
        gauge!("starport_breaker_state", "breaker" => breaker.to_string()).set(state);
    }

    /// Record a call outcome (`success`, `failure` or `rejected`).
    pub fn record_call(breaker: &str, outcome: &'static str) {
        counter!("starport_breaker_calls_total", "breaker" => breaker.to_string(), "outcome" => outcome)
            .increment(1);
    }

    /// Record a state transition.
    pub fn record_transition(breaker: &str, to: &'static str) {
        counter!("starport_breaker_transitions_total", "breaker" => breaker.to_string(), "to" => to)
            .increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record an attempt.
    pub fn record_attempt() {
        counter!("starport_retry_attempts_total").increment(1);
    }

    /// Record an operation that succeeded after at least one retry.
    pub fn record_success() {
        counter!("starport_retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("starport_retry_exhausted_total").increment(1);
    }
}

/// Telemetry sink that turns events into Prometheus series
///
/// Each event increments `starport_telemetry_events_total{event=...}` and records its value
/// in `starport_telemetry_event_value{event=...}`. Properties are not used as labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSink;

impl TelemetrySink for MetricsSink {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn emit(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        if !event.value.is_finite() {
            return Err(TelemetryError::Rejected(format!(
                "non-finite value for {}",
                event.name
            )));
        }
        counter!("starport_telemetry_events_total", "event" => event.name.clone()).increment(1);
        histogram!("starport_telemetry_event_value", "event" => event.name.clone()).record(event.value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn test_metrics_server_serves_scrape_endpoint() {
        // Only test in this binary that installs the global recorder
        let addr = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();
        assert!(server.handle().is_some());

        DispatchMetrics::record_operation("badges", "unlock_badge", Duration::from_millis(2));
        BreakerMetrics::record_call("payments", "success");
        MetricsSink.emit(&TelemetryEvent::new("carts_recovered")).unwrap();

        let rendered = server.render().unwrap();
        assert!(rendered.contains("starport_operations_total"));
        assert!(rendered.contains("starport_breaker_calls_total"));
        assert!(rendered.contains("starport_telemetry_events_total"));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("starport_operations_total"));
    }

    #[test]
    fn test_start_outside_runtime_is_an_error() {
        let mut server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(matches!(server.start(), Err(MetricsError::Install(_))));
        assert!(server.handle().is_none());
    }

    #[test]
    fn test_metrics_sink_rejects_non_finite_values() {
        let result = MetricsSink.emit(&TelemetryEvent::new("latency").with_value(f64::NAN));
        assert!(matches!(result, Err(TelemetryError::Rejected(_))));
    }
}

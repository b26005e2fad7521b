//! Telemetry sinks backed by the logging stack.

use starport_core::telemetry::{TelemetryError, TelemetryEvent, TelemetrySink};

/// Writes every telemetry event as a structured `tracing` event
///
/// Events go to the `starport::telemetry` target, so they can be filtered separately
/// (e.g. `RUST_LOG=starport::telemetry=info`).
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink {
    verbose: bool,
}

impl TracingSink {
    /// Sink logging at `info`
    #[must_use]
    pub const fn new() -> Self {
        Self { verbose: false }
    }

    /// Sink logging at `debug`, for high-volume events
    #[must_use]
    pub const fn verbose() -> Self {
        Self { verbose: true }
    }
}

impl TelemetrySink for TracingSink {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn emit(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        let properties = serde_json::to_string(&event.properties)
            .map_err(|e| TelemetryError::Rejected(e.to_string()))?;

        if self.verbose {
            tracing::debug!(
                target: "starport::telemetry",
                event = %event.name,
                value = event.value,
                properties = %properties,
                "telemetry"
            );
        } else {
            tracing::info!(
                target: "starport::telemetry",
                event = %event.name,
                value = event.value,
                properties = %properties,
                "telemetry"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starport_core::telemetry::Telemetry;
    use std::sync::Arc;

    #[test]
    fn test_tracing_sink_accepts_events() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let event = TelemetryEvent::new("loyalty_points_earned")
            .with_value(120.0)
            .with("account", "acct_1");

        assert_eq!(TracingSink::new().emit(&event), Ok(()));
        assert_eq!(TracingSink::verbose().emit(&event), Ok(()));
    }

    #[test]
    fn test_tracing_sink_behind_adapter_never_drops() {
        let telemetry = Telemetry::disabled().with_sink(Arc::new(TracingSink::new()));
        telemetry.emit(&TelemetryEvent::new("spans_finished"));
        assert_eq!(telemetry.dropped_failures(), 0);
    }
}

//! Runtime configuration.
//!
//! Loads configuration from `STARPORT_*` environment variables with sensible defaults.
//! Unparseable values fall back to the default and are logged at `warn`.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use starport_core::environment::{RandomSource, SeededRandom};
use std::net::{AddrParseError, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Configuration shared by every feature of one application root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// `tracing` filter directive, e.g. `info,starport::telemetry=debug`
    pub log_filter: String,
    /// Whether to install the Prometheus exporter
    pub metrics_enabled: bool,
    /// Metrics exporter host
    pub metrics_host: String,
    /// Metrics exporter port
    pub metrics_port: u16,
    /// Capacity of bounded histories (decision logs, ledgers, finished spans)
    pub history_limit: usize,
    /// Consecutive failures before a breaker opens
    pub breaker_failure_threshold: usize,
    /// Milliseconds a breaker stays open before probing
    pub breaker_timeout_ms: u64,
    /// Half-open successes needed to close a breaker
    pub breaker_success_threshold: usize,
    /// Retries after the first attempt
    pub retry_max_retries: usize,
    /// Delay before the first retry, in milliseconds
    pub retry_initial_delay_ms: u64,
    /// Backoff cap, in milliseconds
    pub retry_max_delay_ms: u64,
    /// Jitter fraction applied to retry delays
    pub retry_jitter: f64,
    /// Seed for the random source; entropy when unset
    pub rng_seed: Option<u64>,
    /// Reminders a cart may receive before reminders are refused
    pub cart_max_reminders: u32,
    /// Upper bound of simulated job latency, in milliseconds
    pub job_max_latency_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
            metrics_enabled: false,
            metrics_host: "0.0.0.0".to_string(),
            metrics_port: 9090,
            history_limit: 1000,
            breaker_failure_threshold: 5,
            breaker_timeout_ms: 60_000,
            breaker_success_threshold: 2,
            retry_max_retries: 3,
            retry_initial_delay_ms: 100,
            retry_max_delay_ms: 30_000,
            retry_jitter: 0.1,
            rng_seed: None,
            cart_max_reminders: 3,
            job_max_latency_ms: 50,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            log_filter: lookup("STARPORT_LOG").unwrap_or(defaults.log_filter),
            metrics_enabled: parse_or(&lookup, "STARPORT_METRICS_ENABLED", defaults.metrics_enabled),
            metrics_host: lookup("STARPORT_METRICS_HOST").unwrap_or(defaults.metrics_host),
            metrics_port: parse_or(&lookup, "STARPORT_METRICS_PORT", defaults.metrics_port),
            history_limit: parse_or(&lookup, "STARPORT_HISTORY_LIMIT", defaults.history_limit),
            breaker_failure_threshold: parse_or(
                &lookup,
                "STARPORT_BREAKER_FAILURE_THRESHOLD",
                defaults.breaker_failure_threshold,
            ),
            breaker_timeout_ms: parse_or(&lookup, "STARPORT_BREAKER_TIMEOUT_MS", defaults.breaker_timeout_ms),
            breaker_success_threshold: parse_or(
                &lookup,
                "STARPORT_BREAKER_SUCCESS_THRESHOLD",
                defaults.breaker_success_threshold,
            ),
            retry_max_retries: parse_or(&lookup, "STARPORT_RETRY_MAX_RETRIES", defaults.retry_max_retries),
            retry_initial_delay_ms: parse_or(
                &lookup,
                "STARPORT_RETRY_INITIAL_DELAY_MS",
                defaults.retry_initial_delay_ms,
            ),
            retry_max_delay_ms: parse_or(&lookup, "STARPORT_RETRY_MAX_DELAY_MS", defaults.retry_max_delay_ms),
            retry_jitter: parse_or(&lookup, "STARPORT_RETRY_JITTER", defaults.retry_jitter),
            rng_seed: lookup("STARPORT_RNG_SEED").and_then(|raw| parse_value("STARPORT_RNG_SEED", &raw)),
            cart_max_reminders: parse_or(&lookup, "STARPORT_CART_MAX_REMINDERS", defaults.cart_max_reminders),
            job_max_latency_ms: parse_or(&lookup, "STARPORT_JOB_MAX_LATENCY_MS", defaults.job_max_latency_ms),
        }
    }

    /// Metrics exporter address.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn metrics_addr(&self) -> Result<SocketAddr, AddrParseError> {
        format!("{}:{}", self.metrics_host, self.metrics_port).parse()
    }

    /// Default configuration for new circuit breakers.
    #[must_use]
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::builder()
            .failure_threshold(self.breaker_failure_threshold)
            .timeout(Duration::from_millis(self.breaker_timeout_ms))
            .success_threshold(self.breaker_success_threshold)
            .build()
    }

    /// Default retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.retry_max_retries)
            .initial_delay(Duration::from_millis(self.retry_initial_delay_ms))
            .max_delay(Duration::from_millis(self.retry_max_delay_ms))
            .jitter(self.retry_jitter)
            .build()
    }

    /// Random source: seeded when `rng_seed` is set, entropy otherwise.
    #[must_use]
    pub fn random_source(&self) -> Arc<dyn RandomSource> {
        match self.rng_seed {
            Some(seed) => Arc::new(SeededRandom::new(seed)),
            None => Arc::new(SeededRandom::from_entropy()),
        }
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = raw, "Ignoring unparseable configuration value");
            None
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|raw| parse_value(key, &raw))
        .unwrap_or(default)
}

//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for all framework components:
//! - Event store operations
//! - Event bus publish/subscribe
//! - Circuit breaker state
//! - Reducer execution
//! - Effect handling
//!
//! # Example
//!
//! ```rust,no_run
//! use carpool_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start().await?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
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
    /// Failed to bind HTTP server
    #[error("Failed to bind metrics server: {0}")]
    Bind(#[from] std::io::Error),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Initialize metrics and start the HTTP server.
    ///
    /// # Errors
    ///
    /// Returns error if metrics exporter cannot be installed or server cannot bind.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), this will fail
    /// with `MetricsError::Install`. In production, ensure this is only called once.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        // Register all metric descriptions
        register_metrics();

        // Build and install the Prometheus exporter
        let builder = PrometheusBuilder::new()
            // Configure histogram buckets for latency measurements
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        // Try to install the recorder
        // In tests, this may fail if a recorder is already installed
        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    // In tests, multiple MetricsServer instances may be created
                    // We'll allow this but warn about it
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Event Store Metrics
    describe_counter!(
        "event_store_events_appended_total",
        "Total number of events appended to the event store"
    );
    describe_counter!(
        "event_store_events_loaded_total",
        "Total number of events loaded from the event store"
    );
    describe_counter!(
        "event_store_snapshots_saved_total",
        "Total number of snapshots saved"
    );
    describe_histogram!(
        "event_store_append_duration_seconds",
        "Time taken to append events"
    );
    describe_histogram!(
        "event_store_load_duration_seconds",
        "Time taken to load events"
    );

    // Event Bus Metrics
    describe_counter!(
        "event_bus_messages_published_total",
        "Total number of messages published to event bus"
    );
    describe_counter!(
        "event_bus_messages_consumed_total",
        "Total number of messages consumed from event bus"
    );
    describe_counter!(
        "event_bus_publish_errors_total",
        "Total number of publish errors"
    );
    describe_counter!(
        "event_bus_consume_errors_total",
        "Total number of consume errors"
    );
    describe_histogram!(
        "event_bus_publish_duration_seconds",
        "Time taken to publish messages"
    );

    // Reducer Metrics
    describe_counter!(
        "reducer_actions_processed_total",
        "Total number of actions processed by reducers"
    );
    describe_counter!(
        "reducer_errors_total",
        "Total number of reducer errors"
    );
    describe_histogram!(
        "reducer_execution_duration_seconds",
        "Time taken to execute reducers"
    );

    // Effect Metrics
    describe_counter!(
        "effects_executed_total",
        "Total number of effects executed"
    );
    describe_counter!(
        "effects_failed_total",
        "Total number of effects that failed"
    );
    describe_histogram!(
        "effect_execution_duration_seconds",
        "Time taken to execute effects"
    );

    // Circuit Breaker Metrics
    describe_gauge!(
        "circuit_breaker_state",
        "Current circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!(
        "circuit_breaker_calls_total",
        "Total number of calls through circuit breaker"
    );
    describe_counter!(
        "circuit_breaker_successes_total",
        "Total number of successful calls"
    );
    describe_counter!(
        "circuit_breaker_failures_total",
        "Total number of failed calls"
    );
    describe_counter!(
        "circuit_breaker_rejections_total",
        "Total number of rejected calls (circuit open)"
    );

    // Retry Metrics
    describe_counter!(
        "retry_attempts_total",
        "Total number of retry attempts"
    );
    describe_counter!(
        "retry_successes_total",
        "Total number of successful retries"
    );
    describe_counter!(
        "retry_exhausted_total",
        "Total number of retry attempts that exhausted max retries"
    );
}

/// Event store metrics recorder.
pub struct EventStoreMetrics;

impl EventStoreMetrics {
    /// Record an event append operation.
    pub fn record_append(count: usize, duration: Duration) {
        counter!("event_store_events_appended_total").increment(count as u64);
        histogram!("event_store_append_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an event load operation.
    pub fn record_load(count: usize, duration: Duration) {
        counter!("event_store_events_loaded_total").increment(count as u64);
        histogram!("event_store_load_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a snapshot save operation.
    pub fn record_snapshot() {
        counter!("event_store_snapshots_saved_total").increment(1);
    }
}

/// Event bus metrics recorder.
pub struct EventBusMetrics;

impl EventBusMetrics {
    /// Record a message publish.
    pub fn record_publish(duration: Duration) {
        counter!("event_bus_messages_published_total").increment(1);
        histogram!("event_bus_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a message consumption.
    pub fn record_consume() {
        counter!("event_bus_messages_consumed_total").increment(1);
    }

    /// Record a publish error.
    pub fn record_publish_error() {
        counter!("event_bus_publish_errors_total").increment(1);
    }

    /// Record a consume error.
    pub fn record_consume_error() {
        counter!("event_bus_consume_errors_total").increment(1);
    }
}

/// Reducer metrics recorder.
pub struct ReducerMetrics;

impl ReducerMetrics {
    /// Record an action processed.
    pub fn record_action(duration: Duration) {
        counter!("reducer_actions_processed_total").increment(1);
        histogram!("reducer_execution_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a reducer error.
    pub fn record_error() {
        counter!("reducer_errors_total").increment(1);
    }
}

/// Effect metrics recorder.
pub struct EffectMetrics;

impl EffectMetrics {
    /// Record an effect execution.
    pub fn record_execution(duration: Duration) {
        counter!("effects_executed_total").increment(1);
        histogram!("effect_execution_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an effect failure.
    pub fn record_failure() {
        counter!("effects_failed_total").increment(1);
    }
}

/// Circuit breaker metrics recorder.
pub struct CircuitBreakerMetrics;

impl CircuitBreakerMetrics {
    /// Record circuit breaker state.
    ///
    /// 0 = Closed, 1 = `HalfOpen`, 2 = Open
    pub fn record_state(state: f64) {
        gauge!("circuit_breaker_state").set(state);
    }

    /// Record a call attempt.
    pub fn record_call() {
        counter!("circuit_breaker_calls_total").increment(1);
    }

    /// Record a successful call.
    pub fn record_success() {
        counter!("circuit_breaker_successes_total").increment(1);
    }

    /// Record a failed call.
    pub fn record_failure() {
        counter!("circuit_breaker_failures_total").increment(1);
    }

    /// Record a rejected call (circuit open).
    pub fn record_rejection() {
        counter!("circuit_breaker_rejections_total").increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}

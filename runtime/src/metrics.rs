//! Prometheus metrics for the messaging layer.
//!
//! Metric collection for every reliability component:
//! - Connection manager (reconnect attempts and outcomes)
//! - Publisher (publishes, retries, exhausted budgets)
//! - Consumer (deliveries and their ack/requeue/reject outcome, handler latency)
//!
//! Recording goes through the `metrics` facade and is a no-op until a recorder is
//! installed, so library code records unconditionally.
//!
//! # Example
//!
//! ```rust,no_run
//! use checkin_messaging_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
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
}

/// Prometheus metrics recorder.
///
/// Installs a global Prometheus recorder; the rendered text is served by whatever HTTP
/// surface embeds this crate.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address the embedding HTTP surface exposes metrics on (for logs)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), this logs a warning and
    /// succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics recorder installed - scrape at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
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
    /// Returns `None` if the recorder was not installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Connection Metrics
    describe_counter!(
        "messaging_connections_established_total",
        "Total number of broker connections established (initial and reconnects)"
    );
    describe_counter!(
        "messaging_connection_drops_total",
        "Total number of unexpected broker connection closures"
    );
    describe_counter!(
        "messaging_reconnect_attempts_total",
        "Total number of reconnect attempts"
    );
    describe_counter!(
        "messaging_reconnects_exhausted_total",
        "Total number of reconnect loops that gave up"
    );

    // Publisher Metrics
    describe_counter!(
        "messaging_messages_published_total",
        "Total number of messages published"
    );
    describe_counter!(
        "messaging_publish_failures_total",
        "Total number of publishes that exhausted their retry budget"
    );
    describe_histogram!(
        "messaging_publish_duration_seconds",
        "Time taken to publish a message, retries included"
    );

    // Consumer Metrics
    describe_counter!(
        "messaging_messages_consumed_total",
        "Total number of deliveries processed, labelled by outcome"
    );
    describe_counter!(
        "messaging_stream_reopens_total",
        "Total number of delivery streams re-opened after closing"
    );
    describe_histogram!(
        "messaging_processing_duration_seconds",
        "Time taken by message handlers"
    );

    // Retry Metrics
    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!("retry_successes_total", "Total number of successful retries");
    describe_counter!(
        "retry_exhausted_total",
        "Total number of retry attempts that exhausted max retries"
    );
}

/// Connection manager metrics recorder.
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    /// Record an established connection.
    pub fn record_established() {
        counter!("messaging_connections_established_total").increment(1);
    }

    /// Record an unexpected connection closure.
    pub fn record_drop() {
        counter!("messaging_connection_drops_total").increment(1);
    }

    /// Record a reconnect attempt.
    pub fn record_reconnect_attempt() {
        counter!("messaging_reconnect_attempts_total").increment(1);
    }

    /// Record a reconnect loop that gave up.
    pub fn record_reconnect_exhausted() {
        counter!("messaging_reconnects_exhausted_total").increment(1);
    }
}

/// Publisher metrics recorder.
pub struct PublisherMetrics;

impl PublisherMetrics {
    /// Record a successful publish.
    pub fn record_publish(duration: Duration) {
        counter!("messaging_messages_published_total").increment(1);
        histogram!("messaging_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a publish that exhausted its budget.
    pub fn record_failure() {
        counter!("messaging_publish_failures_total").increment(1);
    }
}

/// Consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a processed delivery and its outcome.
    pub fn record_outcome(outcome: &'static str) {
        counter!("messaging_messages_consumed_total", "outcome" => outcome).increment(1);
    }

    /// Record handler latency.
    pub fn record_processing(message_type: &str, duration: Duration) {
        histogram!(
            "messaging_processing_duration_seconds",
            "message_type" => message_type.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a delivery stream re-open.
    pub fn record_stream_reopen() {
        counter!("messaging_stream_reopens_total").increment(1);
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

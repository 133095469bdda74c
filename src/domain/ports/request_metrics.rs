//! Request Metrics Port
//!
//! Defines the interface the pipeline reports request outcomes through.

use crate::domain::entities::ResponseSource;
use crate::domain::errors::GatewayError;
use std::time::Duration;

/// Sink for per-pool request outcomes.
///
/// This is an outbound port; the Prometheus exporter implements it.
pub trait RequestMetrics: Send + Sync {
    /// Record a response returned to a client.
    fn record_response(&self, pool: &str, source: ResponseSource, latency: Duration);

    /// Record a request that ended in an error.
    fn record_error(&self, pool: &str, error: &GatewayError, latency: Duration);

    /// Record a retried attempt.
    fn record_retry(&self, pool: &str);
}

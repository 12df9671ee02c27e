//! Data-plane metrics: request counts by status, a latency histogram,
//! and an upstream failure counter.

use http::StatusCode;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        histogram::{exponential_buckets, Histogram},
    },
    registry::Registry,
};
use std::time::Duration;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct StatusLabels {
    status: u32,
}

#[derive(Clone, Debug)]
pub struct ProxyMetrics {
    requests: Family<StatusLabels, Counter>,
    duration: Histogram,
    pub(crate) upstream_errors: Counter,
}

// === impl ProxyMetrics ===

impl ProxyMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::unregistered();
        reg.register(
            "http_requests",
            "Requests handled by the data plane",
            metrics.requests.clone(),
        );
        reg.register(
            "http_request_duration_seconds",
            "End-to-end request latency",
            metrics.duration.clone(),
        );
        reg.register(
            "upstream_errors",
            "Upstream requests that failed",
            metrics.upstream_errors.clone(),
        );
        metrics
    }

    /// Metrics that report nowhere; handy for tests.
    pub fn unregistered() -> Self {
        Self {
            requests: Family::default(),
            duration: Histogram::new(exponential_buckets(0.001, 2.0, 14)),
            upstream_errors: Counter::default(),
        }
    }

    pub(crate) fn observe(&self, status: StatusCode, elapsed: Duration) {
        self.requests
            .get_or_create(&StatusLabels {
                status: status.as_u16().into(),
            })
            .inc();
        self.duration.observe(elapsed.as_secs_f64());
    }
}

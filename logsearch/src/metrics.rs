//! Prometheus metrics for request orchestration.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// The logical request types the orchestrator keeps apart.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RequestKind {
    Detail,
    Histogram,
    Distribution,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub kind: RequestKind,
}

impl From<RequestKind> for RequestLabels {
    fn from(kind: RequestKind) -> Self {
        Self { kind }
    }
}

/// Container for all console metrics.
pub struct Metrics {
    registry: Registry,

    /// Requests handed to the backend.
    pub requests_issued_total: Family<RequestLabels, Counter>,

    /// Requests cancelled before completing.
    pub requests_cancelled_total: Family<RequestLabels, Counter>,

    /// Responses discarded because a newer request superseded them.
    pub responses_stale_total: Family<RequestLabels, Counter>,

    /// Requests that completed with an error.
    pub requests_failed_total: Family<RequestLabels, Counter>,

    /// Requests not issued because their condition key was unchanged.
    pub requests_deduplicated_total: Family<RequestLabels, Counter>,

    /// Rows currently held by the row accumulator.
    pub buffered_rows: Gauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_issued_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "logsearch_requests_issued",
            "Requests issued to the search backend",
            requests_issued_total.clone(),
        );

        let requests_cancelled_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "logsearch_requests_cancelled",
            "Requests cancelled before completion",
            requests_cancelled_total.clone(),
        );

        let responses_stale_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "logsearch_responses_stale",
            "Responses dropped because a newer request superseded them",
            responses_stale_total.clone(),
        );

        let requests_failed_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "logsearch_requests_failed",
            "Requests that completed with an error",
            requests_failed_total.clone(),
        );

        let requests_deduplicated_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "logsearch_requests_deduplicated",
            "Requests skipped because the condition key was unchanged",
            requests_deduplicated_total.clone(),
        );

        let buffered_rows = Gauge::default();
        registry.register(
            "logsearch_buffered_rows",
            "Rows held by the row accumulator",
            buffered_rows.clone(),
        );

        Self {
            registry,
            requests_issued_total,
            requests_cancelled_total,
            responses_stale_total,
            requests_failed_total,
            requests_deduplicated_total,
            buffered_rows,
        }
    }

    pub fn issued(&self, kind: RequestKind) -> u64 {
        self.requests_issued_total.get_or_create(&kind.into()).get()
    }

    pub fn cancelled(&self, kind: RequestKind) -> u64 {
        self.requests_cancelled_total.get_or_create(&kind.into()).get()
    }

    pub fn stale(&self, kind: RequestKind) -> u64 {
        self.responses_stale_total.get_or_create(&kind.into()).get()
    }

    pub fn deduplicated(&self, kind: RequestKind) -> u64 {
        self.requests_deduplicated_total
            .get_or_create(&kind.into())
            .get()
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(err) = encode(&mut buffer, &self.registry) {
            tracing::warn!(error = %err, "failed to encode metrics");
        }
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_encode_counters_by_request_kind() {
        // given
        let metrics = Metrics::new();

        // when
        metrics
            .requests_issued_total
            .get_or_create(&RequestKind::Detail.into())
            .inc();
        metrics.buffered_rows.set(42);

        // then
        let text = metrics.encode();
        assert!(text.contains("logsearch_requests_issued_total{kind=\"Detail\"} 1"));
        assert!(text.contains("logsearch_buffered_rows 42"));
        assert_eq!(metrics.issued(RequestKind::Detail), 1);
        assert_eq!(metrics.issued(RequestKind::Histogram), 0);
    }
}

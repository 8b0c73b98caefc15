use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Succeeded,
    Rejected,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub endpoint: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub result: ReconcileResult,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ReconcileResult {
    First,
    Second,
    Stale,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by forgedrop.
pub struct Metrics {
    // -- commits --
    pub commit_attempts_total: Family<OutcomeLabels, Counter>,
    pub commit_duration_seconds: Histogram,
    pub blobs_created_total: Counter,
    pub blob_bytes_total: Counter,

    // -- refresh --
    pub reconcile_total: Family<ReconcileLabels, Counter>,

    // -- upstream API --
    pub upstream_api_calls: Family<EndpointLabels, Counter>,
    pub upstream_api_rate_limit_remaining: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let commit_attempts_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "forgedrop_commit_attempts",
            "Commit attempts by outcome",
            commit_attempts_total.clone(),
        );

        let commit_duration_seconds = Histogram::new(exponential_buckets(0.05, 2.0, 14));
        registry.register(
            "forgedrop_commit_duration_seconds",
            "Wall time of successful commit attempts in seconds",
            commit_duration_seconds.clone(),
        );

        let blobs_created_total = Counter::default();
        registry.register(
            "forgedrop_blobs_created",
            "Blobs created upstream",
            blobs_created_total.clone(),
        );

        let blob_bytes_total = Counter::default();
        registry.register(
            "forgedrop_blob_bytes",
            "Raw bytes uploaded as blobs",
            blob_bytes_total.clone(),
        );

        let reconcile_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "forgedrop_reconcile",
            "Post-commit listing refreshes by the attempt that succeeded",
            reconcile_total.clone(),
        );

        let upstream_api_calls = Family::<EndpointLabels, Counter>::default();
        registry.register(
            "forgedrop_upstream_api_calls",
            "Upstream API call count by endpoint",
            upstream_api_calls.clone(),
        );

        let upstream_api_rate_limit_remaining: Gauge = Gauge::default();
        registry.register(
            "forgedrop_upstream_api_rate_limit_remaining",
            "Remaining upstream API calls before rate limit",
            upstream_api_rate_limit_remaining.clone(),
        );

        Self {
            commit_attempts_total,
            commit_duration_seconds,
            blobs_created_total,
            blob_bytes_total,
            reconcile_total,
            upstream_api_calls,
            upstream_api_rate_limit_remaining,
        }
    }

    pub fn record_commit(&self, outcome: Outcome) {
        self.commit_attempts_total
            .get_or_create(&OutcomeLabels { outcome })
            .inc();
    }

    pub fn record_api_call(&self, endpoint: &str) {
        self.upstream_api_calls
            .get_or_create(&EndpointLabels {
                endpoint: endpoint.to_string(),
            })
            .inc();
    }

    pub fn record_reconcile(&self, result: ReconcileResult) {
        self.reconcile_total
            .get_or_create(&ReconcileLabels { result })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

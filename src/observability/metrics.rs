//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `virtual_cluster_reconciliations_total` - Total number of reconciliations
//! - `virtual_cluster_reconciliation_errors_total` - Total number of reconciliation errors
//! - `virtual_cluster_reconciliation_duration_seconds` - Duration of reconciliation passes
//! - `virtual_cluster_server_not_ready_retries_total` - Passes deferred on a booting server
//! - `virtual_cluster_clusters_managed` - Current number of Clusters being managed
//! - `virtual_cluster_finalizations_total` - Total number of finalized Clusters

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntGauge, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "virtual_cluster_reconciliations_total",
        "Total number of reconciliations",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "virtual_cluster_reconciliation_errors_total",
        "Total number of reconciliation errors",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "virtual_cluster_reconciliation_duration_seconds",
            "Duration of reconciliation passes in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static SERVER_NOT_READY_RETRIES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "virtual_cluster_server_not_ready_retries_total",
        "Total number of passes deferred because the virtual server was not ready",
    )
    .expect("Failed to create SERVER_NOT_READY_RETRIES_TOTAL metric - this should never happen")
});

static CLUSTERS_MANAGED: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "virtual_cluster_clusters_managed",
        "Current number of Clusters being managed",
    )
    .expect("Failed to create CLUSTERS_MANAGED metric - this should never happen")
});

static FINALIZATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "virtual_cluster_finalizations_total",
        "Total number of finalized Clusters",
    )
    .expect("Failed to create FINALIZATIONS_TOTAL metric - this should never happen")
});

#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(SERVER_NOT_READY_RETRIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CLUSTERS_MANAGED.clone()))?;
    REGISTRY.register(Box::new(FINALIZATIONS_TOTAL.clone()))?;

    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

pub fn increment_server_not_ready_retries() {
    SERVER_NOT_READY_RETRIES_TOTAL.inc();
}

pub fn set_clusters_managed(count: i64) {
    CLUSTERS_MANAGED.set(count);
}

pub fn increment_finalizations() {
    FINALIZATIONS_TOTAL.inc();
}

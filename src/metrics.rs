//! Prometheus metrics for the ingestion run
//!
//! Counters are labelled by provider source so a single scrape (or the
//! `--print-metrics` dump at the end of a run) shows where listings were
//! lost: at the provider, in normalization, or in the store.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramOpts, HistogramVec,
    IntCounterVec, TextEncoder,
};
use tracing::error;

// ============================================
// METRIC DEFINITIONS
// ============================================

static PAGES_FETCHED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "events_ingestion_pages_fetched_total",
        "Provider pages fetched successfully",
        &["source"]
    )
    .expect("Failed to create pages_fetched metric")
});

static RATE_LIMITED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "events_ingestion_rate_limited_total",
        "Provider responses that signalled rate limiting (HTTP 429)",
        &["source"]
    )
    .expect("Failed to create rate_limited metric")
});

static PROVIDER_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "events_ingestion_provider_errors_total",
        "Fatal provider errors by kind",
        &["source", "kind"]
    )
    .expect("Failed to create provider_errors metric")
});

static EVENTS_NORMALIZED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "events_ingestion_events_normalized_total",
        "Raw records that produced a canonical event",
        &["source"]
    )
    .expect("Failed to create events_normalized metric")
});

static EVENTS_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "events_ingestion_events_dropped_total",
        "Raw records dropped for missing or malformed mandatory fields",
        &["source"]
    )
    .expect("Failed to create events_dropped metric")
});

static EVENTS_UPSERTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "events_ingestion_events_upserted_total",
        "Canonical events written to the store",
        &["source"]
    )
    .expect("Failed to create events_upserted metric")
});

static ROWS_DEACTIVATED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "events_ingestion_rows_deactivated_total",
        "Stored events deactivated by the staleness sweep",
        &["source"]
    )
    .expect("Failed to create rows_deactivated metric")
});

static PAGE_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    let buckets = vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];
    register_histogram_vec!(
        HistogramOpts::new(
            "events_ingestion_page_latency_seconds",
            "Latency of a single provider page request"
        )
        .buckets(buckets),
        &["source"]
    )
    .expect("Failed to create page_latency metric")
});

// ============================================
// METRICS API
// ============================================

pub fn record_page_fetched(source: &str, latency_secs: f64) {
    PAGES_FETCHED.with_label_values(&[source]).inc();
    PAGE_LATENCY.with_label_values(&[source]).observe(latency_secs);
}

pub fn record_rate_limited(source: &str) {
    RATE_LIMITED.with_label_values(&[source]).inc();
}

pub fn record_provider_error(source: &str, kind: &str) {
    PROVIDER_ERRORS.with_label_values(&[source, kind]).inc();
}

pub fn record_normalized(source: &str, kept: u64, dropped: u64) {
    EVENTS_NORMALIZED.with_label_values(&[source]).inc_by(kept);
    EVENTS_DROPPED.with_label_values(&[source]).inc_by(dropped);
}

pub fn record_upserted(source: &str, count: u64) {
    EVENTS_UPSERTED.with_label_values(&[source]).inc_by(count);
}

pub fn record_deactivated(source: &str, count: u64) {
    ROWS_DEACTIVATED.with_label_values(&[source]).inc_by(count);
}

// ============================================
// METRICS COLLECTION
// ============================================

/// Collects all metrics as Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}

//! Prometheus metrics for bundle processing

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec,
};
use std::time::Duration;

lazy_static! {
    /// Completed bundle entries by request method and HTTP status
    pub static ref BUNDLE_ENTRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tessera_bundle_entries_total",
        "Total number of completed bundle entries",
        &["method", "status"]
    )
    .expect("Failed to register BUNDLE_ENTRIES_TOTAL");

    /// Time from the start of an entry to its response being recorded
    pub static ref BUNDLE_ENTRY_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "tessera_bundle_entry_duration_seconds",
        "Bundle entry processing time in seconds",
        &["method"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("Failed to register BUNDLE_ENTRY_DURATION_SECONDS");

    /// Processed bundles by type and outcome (completed, aborted, failed)
    pub static ref BUNDLES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tessera_bundles_total",
        "Total number of processed batch/transaction bundles",
        &["type", "outcome"]
    )
    .expect("Failed to register BUNDLES_TOTAL");

    /// Bundle entry count
    pub static ref BUNDLE_SIZE: HistogramVec = register_histogram_vec!(
        "tessera_bundle_entries",
        "Number of entries in batch/transaction bundles",
        &["type"],
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]
    )
    .expect("Failed to register BUNDLE_SIZE");

    /// Payloads removed after the bundle that wrote them did not complete
    pub static ref PAYLOAD_COMPENSATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tessera_payload_compensations_total",
        "Payload cleanup attempts by result (deleted, failed, orphaned)",
        &["result"]
    )
    .expect("Failed to register PAYLOAD_COMPENSATIONS_TOTAL");
}

pub fn record_entry(method: &str, status: u16, elapsed: Duration) {
    BUNDLE_ENTRIES_TOTAL
        .with_label_values(&[method, &status.to_string()])
        .inc();
    BUNDLE_ENTRY_DURATION_SECONDS
        .with_label_values(&[method])
        .observe(elapsed.as_secs_f64());
}

pub fn record_bundle(bundle_type: &str, outcome: &str, entries: usize) {
    BUNDLES_TOTAL
        .with_label_values(&[bundle_type, outcome])
        .inc();
    BUNDLE_SIZE
        .with_label_values(&[bundle_type])
        .observe(entries as f64);
}

pub fn record_compensation(result: &str) {
    PAYLOAD_COMPENSATIONS_TOTAL
        .with_label_values(&[result])
        .inc();
}

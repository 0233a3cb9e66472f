//! Prometheus metrics for queue, lock, and execution activity.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Counter for processed batches by terminal status
    static ref BATCHES: IntCounterVec = register_int_counter_vec!(
        "projectq_batches_total",
        "Total number of batches processed",
        &["status"]
    ).unwrap();

    /// Counter for executed items by status
    static ref ITEMS: IntCounterVec = register_int_counter_vec!(
        "projectq_items_total",
        "Total number of work items executed",
        &["status"]
    ).unwrap();

    /// Histogram for item action duration
    static ref ITEM_DURATION: Histogram = register_histogram!(
        "projectq_item_duration_seconds",
        "Work item action duration in seconds",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]
    ).unwrap();

    /// Counter for lock contention requeues
    static ref LOCK_CONTENTION: IntCounter = register_int_counter!(
        "projectq_lock_contention_total",
        "Batches requeued because another worker held the key's lock"
    ).unwrap();

    /// Counter for lost leases
    static ref RENEWAL_FAILURES: IntCounter = register_int_counter!(
        "projectq_lock_renewal_failures_total",
        "Lease renewals that failed, fencing the holding worker"
    ).unwrap();

    /// Gauge for keys currently executing in this process
    static ref EXECUTING_KEYS: IntGauge = register_int_gauge!(
        "projectq_executing_keys",
        "Number of project keys currently executing an item in this process"
    ).unwrap();
}

/// Record one processed batch.
pub fn record_batch(status: &str) {
    BATCHES.with_label_values(&[status]).inc();
}

/// Record one executed item and its action duration.
pub fn record_item(status: &str, duration_secs: f64) {
    ITEMS.with_label_values(&[status]).inc();
    ITEM_DURATION.observe(duration_secs);
}

/// Record a lock-contention requeue.
pub fn record_lock_contention() {
    LOCK_CONTENTION.inc();
}

/// Record a failed lease renewal.
pub fn record_renewal_failure() {
    RENEWAL_FAILURES.inc();
}

/// Update the executing-keys gauge.
pub fn set_executing_keys(count: i64) {
    EXECUTING_KEYS.set(count);
}

/// Export all metrics in Prometheus text format.
pub fn export() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

//! # Metrics
//!
//! Prometheus metrics for monitoring the operator.
//!
//! ## Metrics Exposed
//!
//! - `service_instance_reconciliations_total` - Total number of reconciliations
//! - `service_instance_reconciliation_errors_total` - Total number of reconciliation errors
//! - `service_instance_reconciliation_duration_seconds` - Duration of reconciliations
//! - `service_instance_requeues_total` - Requeues by reason
//! - `service_instance_sm_operations_total` - Service manager calls by operation
//! - `service_instance_sm_operation_duration_seconds` - Duration of service manager calls
//! - `service_instance_sm_operation_errors_total` - Failed service manager calls by operation and error class
//! - `service_instance_secret_fanout_total` - Instances enqueued because a watched secret changed

use anyhow::Result;
use prometheus::{Histogram, HistogramVec, IntCounter, IntCounterVec, Registry};
use std::sync::LazyLock;

// Metrics
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "service_instance_reconciliations_total",
        "Total number of reconciliations",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "service_instance_reconciliation_errors_total",
        "Total number of reconciliation errors",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "service_instance_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_instance_requeues_total",
            "Total number of requeues by reason",
        ),
        &["reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static SM_OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_instance_sm_operations_total",
            "Total number of service manager calls by operation",
        ),
        &["operation"],
    )
    .expect("Failed to create SM_OPERATIONS_TOTAL metric - this should never happen")
});

static SM_OPERATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "service_instance_sm_operation_duration_seconds",
            "Duration of service manager calls in seconds by operation",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["operation"],
    )
    .expect("Failed to create SM_OPERATION_DURATION metric - this should never happen")
});

static SM_OPERATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_instance_sm_operation_errors_total",
            "Total number of failed service manager calls by operation and error class",
        ),
        &["operation", "class"],
    )
    .expect("Failed to create SM_OPERATION_ERRORS_TOTAL metric - this should never happen")
});

static SECRET_FANOUT_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "service_instance_secret_fanout_total",
        "Total number of instances enqueued because a watched secret changed",
    )
    .expect("Failed to create SECRET_FANOUT_TOTAL metric - this should never happen")
});

pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SM_OPERATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SM_OPERATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(SM_OPERATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SECRET_FANOUT_TOTAL.clone()))?;

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

pub fn increment_requeues_total(reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[reason]).inc();
}

/// Record one completed service manager call
pub fn record_sm_operation(operation: &str, duration: f64) {
    SM_OPERATIONS_TOTAL.with_label_values(&[operation]).inc();
    SM_OPERATION_DURATION
        .with_label_values(&[operation])
        .observe(duration);
}

pub fn increment_sm_operation_errors(operation: &str, class: &str) {
    SM_OPERATION_ERRORS_TOTAL
        .with_label_values(&[operation, class])
        .inc();
}

pub fn increment_secret_fanout(count: u64) {
    SECRET_FANOUT_TOTAL.inc_by(count);
}

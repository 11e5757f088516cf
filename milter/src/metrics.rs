use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec,
};

/// Holds references to all registered counters so we can update them safely.
struct MetricsHandles {
    callbacks: IntCounterVec,
    protocol_errors: IntCounter,
    handler_failures: IntCounter,
    verdicts: IntCounterVec,
}

/// Process-wide counters; they reset only on restart.
static METRICS: Lazy<MetricsHandles> = Lazy::new(|| MetricsHandles {
    callbacks: register_int_counter_vec!(
        "milter_callbacks_total",
        "Total milter callbacks processed, by callback kind.",
        &["kind"]
    )
    .expect("register milter_callbacks_total counter vec"),
    protocol_errors: register_int_counter!(
        "milter_protocol_errors_total",
        "Total callbacks that violated the milter sequencing or payload contract."
    )
    .expect("register milter_protocol_errors_total counter"),
    handler_failures: register_int_counter!(
        "milter_handler_failures_total",
        "Total callback invocations contained by the failure guard."
    )
    .expect("register milter_handler_failures_total counter"),
    verdicts: register_int_counter_vec!(
        "milter_verdicts_total",
        "Total end-of-message verdicts, by outcome.",
        &["verdict"]
    )
    .expect("register milter_verdicts_total counter vec"),
});

/// Records one processed callback of the given kind.
pub fn callback(kind: &'static str) {
    METRICS.callbacks.with_label_values(&[kind]).inc();
}

pub fn callback_count(kind: &str) -> u64 {
    METRICS.callbacks.with_label_values(&[kind]).get()
}

/// Records a protocol-sequence or payload violation by the MTA side.
pub fn protocol_error() {
    METRICS.protocol_errors.inc();
}

pub fn protocol_error_count() -> u64 {
    METRICS.protocol_errors.get()
}

/// Records a failure-guard activation.
pub fn handler_failure() {
    METRICS.handler_failures.inc();
}

pub fn handler_failure_count() -> u64 {
    METRICS.handler_failures.get()
}

/// Records the verdict returned for a finalized message.
pub fn verdict(verdict: &'static str) {
    METRICS.verdicts.with_label_values(&[verdict]).inc();
}

pub fn verdict_count(verdict: &str) -> u64 {
    METRICS.verdicts.with_label_values(&[verdict]).get()
}

//! Prometheus metrics for the puller process
//!
//! These are process-wide. Per-pipeline numbers live in
//! [`crate::pipeline::PipelineStats`].

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Encoder, Gauge, Histogram, TextEncoder,
};

// ── Reader metrics ───────────────────────────────────────────────────────────

pub static DOCUMENTS_READ: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hwpc_puller_documents_read_total",
        "Raw documents read from the source log"
    )
    .expect("register hwpc_puller_documents_read_total")
});

pub static OVERRUN_MISSED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hwpc_puller_overrun_missed_total",
        "Reports evicted from the source log before the reader got to them"
    )
    .expect("register hwpc_puller_overrun_missed_total")
});

pub static STORE_RETRIES: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hwpc_puller_store_retries_total",
        "Store reads that failed and were retried"
    )
    .expect("register hwpc_puller_store_retries_total")
});

// ── Routing metrics ──────────────────────────────────────────────────────────

pub static REPORTS_ROUTED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hwpc_puller_reports_routed_total",
        "Valid reports matched by at least one filter"
    )
    .expect("register hwpc_puller_reports_routed_total")
});

pub static REPORTS_UNMATCHED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hwpc_puller_reports_unmatched_total",
        "Valid reports matched by no filter"
    )
    .expect("register hwpc_puller_reports_unmatched_total")
});

pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "hwpc_puller_errors_total",
        "Rejections and isolated failures by kind",
        &["kind"]
    )
    .expect("register hwpc_puller_errors_total")
});

// ── Consumer metrics ─────────────────────────────────────────────────────────

pub static INVOCATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "hwpc_puller_invocations_total",
        "Consumer invocations by filter and outcome",
        &["filter", "status"]
    )
    .expect("register hwpc_puller_invocations_total")
});

pub static INVOCATION_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "hwpc_puller_invocation_duration_seconds",
        "Consumer invocation latency",
        vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]
    )
    .expect("register hwpc_puller_invocation_duration_seconds")
});

pub static IN_FLIGHT: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "hwpc_puller_invocations_in_flight",
        "Consumer invocations queued or running"
    )
    .expect("register hwpc_puller_invocations_in_flight")
});

/// Render all registered metrics to Prometheus text format.
pub fn encode_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_touched_metrics() {
        DOCUMENTS_READ.inc();
        ERRORS_TOTAL.with_label_values(&["validation"]).inc();
        let text = encode_metrics().unwrap();
        assert!(text.contains("hwpc_puller_documents_read_total"));
        assert!(text.contains("hwpc_puller_errors_total{kind=\"validation\"}"));
    }
}

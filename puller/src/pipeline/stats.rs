//! Per-pipeline counters
//!
//! Every update is mirrored into the process-wide Prometheus metrics.

use crate::error::ErrorKind;
use crate::metrics;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineStats {
    documents_read: AtomicU64,
    reports_accepted: AtomicU64,
    reports_routed: AtomicU64,
    reports_unmatched: AtomicU64,
    deliveries: AtomicU64,
    overrun_missed: AtomicU64,
    abandoned: AtomicU64,
    errors: [AtomicU64; ErrorKind::ALL.len()],
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_read(&self) {
        self.documents_read.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_accepted(&self) {
        self.reports_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_routed(&self) {
        self.reports_routed.fetch_add(1, Ordering::Relaxed);
        metrics::REPORTS_ROUTED.inc();
    }

    pub(crate) fn record_unmatched(&self) {
        self.reports_unmatched.fetch_add(1, Ordering::Relaxed);
        metrics::REPORTS_UNMATCHED.inc();
    }

    pub(crate) fn record_delivery(&self) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_overrun(&self, missed: u64) {
        self.overrun_missed.fetch_add(missed, Ordering::Relaxed);
    }

    pub(crate) fn record_abandoned(&self, count: u64) {
        self.abandoned.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self, kind: ErrorKind) {
        self.errors[kind.index()].fetch_add(1, Ordering::Relaxed);
        metrics::ERRORS_TOTAL.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn errors(&self, kind: ErrorKind) -> u64 {
        self.errors[kind.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            documents_read: self.documents_read.load(Ordering::Relaxed),
            reports_accepted: self.reports_accepted.load(Ordering::Relaxed),
            reports_routed: self.reports_routed.load(Ordering::Relaxed),
            reports_unmatched: self.reports_unmatched.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            overrun_missed: self.overrun_missed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            errors: ErrorKind::ALL
                .iter()
                .map(|kind| (kind.as_str(), self.errors(*kind)))
                .collect(),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub documents_read: u64,
    pub reports_accepted: u64,
    pub reports_routed: u64,
    pub reports_unmatched: u64,
    /// Consumer invocations that completed successfully
    pub deliveries: u64,
    pub overrun_missed: u64,
    /// Invocations still running when the drain timeout expired
    pub abandoned: u64,
    pub errors: BTreeMap<&'static str, u64>,
}

impl StatsSnapshot {
    pub fn errors(&self, kind: ErrorKind) -> u64 {
        self.errors.get(kind.as_str()).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_updates() {
        let stats = PipelineStats::new();
        stats.record_read();
        stats.record_read();
        stats.record_accepted();
        stats.record_unmatched();
        stats.record_overrun(4);
        stats.record_error(ErrorKind::Validation);
        stats.record_error(ErrorKind::Overrun);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.documents_read, 2);
        assert_eq!(snapshot.reports_accepted, 1);
        assert_eq!(snapshot.reports_unmatched, 1);
        assert_eq!(snapshot.overrun_missed, 4);
        assert_eq!(snapshot.errors(ErrorKind::Validation), 1);
        assert_eq!(snapshot.errors(ErrorKind::Overrun), 1);
        assert_eq!(snapshot.errors(ErrorKind::Consumer), 0);
        assert_eq!(snapshot.errors.len(), ErrorKind::ALL.len());
    }
}

//! Run reports and the running success-rate metric.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Cap on the error list carried by one report.
pub const MAX_REPORT_ERRORS: usize = 50;

/// Observable outcome of one ingestion run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    /// Items returned by the provider.
    pub fetched: u64,
    /// Items that normalized into a task or reminder.
    pub extracted: u64,
    /// Extracted items flagged as spam (persisted but excluded from
    /// planning and nudges).
    pub skipped_spam: u64,
    /// Items skipped for any other reason (cancelled, unactionable,
    /// malformed).
    pub skipped_other: u64,
    /// New rows created.
    pub persisted_new: u64,
    /// Existing rows whose content changed.
    pub persisted_updated: u64,
    /// Vectors upserted by the encode stage.
    pub encoded: u64,
    /// Whether an optional stage (encoding) failed.
    pub degraded: bool,
    /// Bounded list of item-level errors.
    pub errors: Vec<String>,
}

impl RunReport {
    /// Record an item-level error, keeping the list bounded.
    pub fn push_error(&mut self, error: impl Into<String>) {
        if self.errors.len() < MAX_REPORT_ERRORS {
            self.errors.push(error.into());
        }
    }
}

/// Process-wide ingestion counters (atomic, lock-free).
#[derive(Debug, Default)]
pub struct IngestMetrics {
    runs: AtomicU64,
    failed_runs: AtomicU64,
    items_persisted: AtomicU64,
}

/// Point-in-time view of [`IngestMetrics`] for health checks.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricsSnapshot {
    pub runs: u64,
    pub failed_runs: u64,
    pub items_persisted: u64,
    /// Completed runs divided by all runs; 1.0 before the first run.
    pub success_rate: f64,
}

impl IngestMetrics {
    /// Record a completed run and its persisted-row count.
    pub fn record_success(&self, report: &RunReport) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.items_persisted.fetch_add(
            report.persisted_new.saturating_add(report.persisted_updated),
            Ordering::Relaxed,
        );
    }

    /// Record a run that terminated with an error.
    pub fn record_failure(&self) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.failed_runs.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let runs = self.runs.load(Ordering::Relaxed);
        let failed = self.failed_runs.load(Ordering::Relaxed);
        let success_rate = if runs == 0 {
            1.0
        } else {
            // Both fit in f64's integer range for any realistic uptime.
            #[allow(clippy::cast_precision_loss)]
            {
                (runs.saturating_sub(failed)) as f64 / runs as f64
            }
        };
        MetricsSnapshot {
            runs,
            failed_runs: failed,
            items_persisted: self.items_persisted.load(Ordering::Relaxed),
            success_rate,
        }
    }
}

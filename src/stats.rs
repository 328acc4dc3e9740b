//! Drop and error counters
//!
//! One instance lives for the whole process and is shared by every generation.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ExporterStats {
    unknown_metrics: AtomicU64,
    unknown_logs: AtomicU64,
    invalid_values: AtomicU64,
    template_issues: AtomicU64,
    backend_errors: AtomicU64,
    timeouts: AtomicU64,
    rejected_points: AtomicU64,
    rejected_log_entries: AtomicU64,
    sink_errors: AtomicU64,
    descriptor_errors: AtomicU64,
    spans_sampled: AtomicU64,
    spans_unsampled: AtomicU64,
    buffer_overflows: AtomicU64,
    flushes: AtomicU64,
}

macro_rules! counter {
    ($($inc:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $inc(&self, n: u64) {
                self.$field.fetch_add(n, Ordering::Relaxed);
            }
        )*
    };
}

impl ExporterStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        add_unknown_metrics => unknown_metrics,
        add_unknown_logs => unknown_logs,
        add_invalid_values => invalid_values,
        add_template_issues => template_issues,
        add_backend_errors => backend_errors,
        add_timeouts => timeouts,
        add_rejected_points => rejected_points,
        add_rejected_log_entries => rejected_log_entries,
        add_sink_errors => sink_errors,
        add_descriptor_errors => descriptor_errors,
        add_spans_sampled => spans_sampled,
        add_spans_unsampled => spans_unsampled,
        add_buffer_overflows => buffer_overflows,
        add_flushes => flushes,
    }

    /// Count a failed backend call, separating timeouts
    pub fn record_backend_error(&self, err: &crate::errors::BackendError) {
        if err.is_timeout() {
            self.add_timeouts(1);
        }
        self.add_backend_errors(1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            unknown_metrics: self.unknown_metrics.load(Ordering::Relaxed),
            unknown_logs: self.unknown_logs.load(Ordering::Relaxed),
            invalid_values: self.invalid_values.load(Ordering::Relaxed),
            template_issues: self.template_issues.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            rejected_points: self.rejected_points.load(Ordering::Relaxed),
            rejected_log_entries: self.rejected_log_entries.load(Ordering::Relaxed),
            sink_errors: self.sink_errors.load(Ordering::Relaxed),
            descriptor_errors: self.descriptor_errors.load(Ordering::Relaxed),
            spans_sampled: self.spans_sampled.load(Ordering::Relaxed),
            spans_unsampled: self.spans_unsampled.load(Ordering::Relaxed),
            buffer_overflows: self.buffer_overflows.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub unknown_metrics: u64,
    pub unknown_logs: u64,
    pub invalid_values: u64,
    pub template_issues: u64,
    pub backend_errors: u64,
    pub timeouts: u64,
    pub rejected_points: u64,
    pub rejected_log_entries: u64,
    pub sink_errors: u64,
    pub descriptor_errors: u64,
    pub spans_sampled: u64,
    pub spans_unsampled: u64,
    pub buffer_overflows: u64,
    pub flushes: u64,
}

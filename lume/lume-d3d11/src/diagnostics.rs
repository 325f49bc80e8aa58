//! Counters shared by the device and its contexts, and the device-lost report.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Logs a misuse warning and counts it. Misuse is never fatal: the caller returns early.
macro_rules! misuse {
    ($diagnostics:expr, $($arg:tt)+) => {{
        $diagnostics.record_warning();
        log::warn!($($arg)+);
    }};
}
pub(crate) use misuse;

#[derive(Debug, Default)]
pub struct Diagnostics {
    warnings: AtomicU64,
    errors: AtomicU64,
    draws: AtomicU64,
    dispatches: AtomicU64,
    descriptor_set_applies: AtomicU64,
    submissions: AtomicU64,
}

/// Point-in-time copy of [`Diagnostics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiagnosticsSnapshot {
    pub warnings: u64,
    pub errors: u64,
    pub draws: u64,
    pub dispatches: u64,
    pub descriptor_set_applies: u64,
    pub submissions: u64,
}

impl Diagnostics {
    pub fn record_warning(&self) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_draws(&self, count: u64) {
        self.draws.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatch(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_descriptor_set_apply(&self) {
        self.descriptor_set_applies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_submission(&self) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            warnings: self.warnings.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            draws: self.draws.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            descriptor_set_applies: self.descriptor_set_applies.load(Ordering::Relaxed),
            submissions: self.submissions.load(Ordering::Relaxed),
        }
    }
}

/// What was known when the driver reported the device gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLostReport {
    pub reason: String,
    pub counters: DiagnosticsSnapshot,
}

impl fmt::Display for DeviceLostReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "device lost ({}); {} draws, {} dispatches, {} submissions, {} warnings, {} errors",
            self.reason,
            self.counters.draws,
            self.counters.dispatches,
            self.counters.submissions,
            self.counters.warnings,
            self.counters.errors,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn misuse_counts_and_report_formats() {
        let diagnostics = Diagnostics::default();
        misuse!(diagnostics, "bad call {}", 1);
        diagnostics.record_draws(3);
        let report = DeviceLostReport {
            reason: "hung".into(),
            counters: diagnostics.snapshot(),
        };
        assert_eq!(report.counters.warnings, 1);
        assert_eq!(report.counters.draws, 3);
        assert!(report.to_string().starts_with("device lost (hung); 3 draws"));
    }
}

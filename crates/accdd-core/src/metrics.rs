//! Global atomic counters for cycle orchestration.
//!
//! Counters are incremented at the call site. [`Metrics::flush`] emits the
//! current values as one `tracing::info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    cycles_started: AtomicU64,
    cycles_done: AtomicU64,
    cycles_failed: AtomicU64,
    fix_iterations: AtomicU64,
    audit_reviews: AtomicU64,
    files_transferred: AtomicU64,
    syncs_skipped: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            cycles_started: AtomicU64::new(0),
            cycles_done: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
            fix_iterations: AtomicU64::new(0),
            audit_reviews: AtomicU64::new(0),
            files_transferred: AtomicU64::new(0),
            syncs_skipped: AtomicU64::new(0),
        }
    }

    pub fn inc_cycles_started(&self) {
        self.cycles_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cycles_done(&self) {
        self.cycles_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cycles_failed(&self) {
        self.cycles_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fix_iterations(&self) {
        self.fix_iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_audit_reviews(&self) {
        self.audit_reviews.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_files_transferred(&self, n: u64) {
        self.files_transferred.fetch_add(n, Ordering::Relaxed);
        tracing::trace!(metric = "files_transferred", n, "counter incremented");
    }

    /// A sync found nothing to upload.
    pub fn inc_syncs_skipped(&self) {
        self.syncs_skipped.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "syncs_skipped", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            cycles_started = self.cycles_started(),
            cycles_done = self.cycles_done(),
            cycles_failed = self.cycles_failed(),
            fix_iterations = self.fix_iterations(),
            audit_reviews = self.audit_reviews(),
            files_transferred = self.files_transferred(),
            syncs_skipped = self.syncs_skipped(),
        );
    }

    pub fn cycles_started(&self) -> u64 {
        self.cycles_started.load(Ordering::Relaxed)
    }

    pub fn cycles_done(&self) -> u64 {
        self.cycles_done.load(Ordering::Relaxed)
    }

    pub fn cycles_failed(&self) -> u64 {
        self.cycles_failed.load(Ordering::Relaxed)
    }

    pub fn fix_iterations(&self) -> u64 {
        self.fix_iterations.load(Ordering::Relaxed)
    }

    pub fn audit_reviews(&self) -> u64 {
        self.audit_reviews.load(Ordering::Relaxed)
    }

    pub fn files_transferred(&self) -> u64 {
        self.files_transferred.load(Ordering::Relaxed)
    }

    pub fn syncs_skipped(&self) -> u64 {
        self.syncs_skipped.load(Ordering::Relaxed)
    }
}

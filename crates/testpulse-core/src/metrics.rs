//! Global atomic counters for engine observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single `tracing::info!`
//! event (e.g. after a replay batch or a worker drain).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters; no allocations, no locking.
pub struct Metrics {
    defects_created: AtomicU64,
    defects_reopened: AtomicU64,
    defects_closed: AtomicU64,
    traces_enqueued: AtomicU64,
    traces_completed: AtomicU64,
    traces_failed: AtomicU64,
    predictor_fallbacks: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            defects_created: AtomicU64::new(0),
            defects_reopened: AtomicU64::new(0),
            defects_closed: AtomicU64::new(0),
            traces_enqueued: AtomicU64::new(0),
            traces_completed: AtomicU64::new(0),
            traces_failed: AtomicU64::new(0),
            predictor_fallbacks: AtomicU64::new(0),
        }
    }

    pub fn inc_defects_created(&self) {
        self.defects_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_defects_reopened(&self) {
        self.defects_reopened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_defects_closed(&self) {
        self.defects_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_traces_enqueued(&self) {
        self.traces_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_traces_completed(&self) {
        self.traces_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_traces_failed(&self) {
        self.traces_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_predictor_fallbacks(&self) {
        self.predictor_fallbacks.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "predictor_fallbacks", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            defects_created = self.defects_created(),
            defects_reopened = self.defects_reopened(),
            defects_closed = self.defects_closed(),
            traces_enqueued = self.traces_enqueued(),
            traces_completed = self.traces_completed(),
            traces_failed = self.traces_failed(),
            predictor_fallbacks = self.predictor_fallbacks(),
        );
    }

    pub fn defects_created(&self) -> u64 {
        self.defects_created.load(Ordering::Relaxed)
    }

    pub fn defects_reopened(&self) -> u64 {
        self.defects_reopened.load(Ordering::Relaxed)
    }

    pub fn defects_closed(&self) -> u64 {
        self.defects_closed.load(Ordering::Relaxed)
    }

    pub fn traces_enqueued(&self) -> u64 {
        self.traces_enqueued.load(Ordering::Relaxed)
    }

    pub fn traces_completed(&self) -> u64 {
        self.traces_completed.load(Ordering::Relaxed)
    }

    pub fn traces_failed(&self) -> u64 {
        self.traces_failed.load(Ordering::Relaxed)
    }

    pub fn predictor_fallbacks(&self) -> u64 {
        self.predictor_fallbacks.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.defects_created,
            &self.defects_reopened,
            &self.defects_closed,
            &self.traces_enqueued,
            &self.traces_completed,
            &self.traces_failed,
            &self.predictor_fallbacks,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

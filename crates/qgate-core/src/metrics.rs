//! Process-wide orchestration counters.
//!
//! Counters are bumped silently at the call site. [`Metrics::flush`] emits
//! the current values as one `info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lock-free atomic counters.
pub struct Metrics {
    runs_started: AtomicU64,
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
    runs_cancelled: AtomicU64,
    gate_updates: AtomicU64,
    updates_discarded: AtomicU64,
    retries_dispatched: AtomicU64,
    bypasses_requested: AtomicU64,
    escalations_raised: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub runs_cancelled: u64,
    pub gate_updates: u64,
    pub updates_discarded: u64,
    pub retries_dispatched: u64,
    pub bypasses_requested: u64,
    pub escalations_raised: u64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(metric = stringify!($field), "counter incremented");
        }
    };
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            runs_started: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            runs_cancelled: AtomicU64::new(0),
            gate_updates: AtomicU64::new(0),
            updates_discarded: AtomicU64::new(0),
            retries_dispatched: AtomicU64::new(0),
            bypasses_requested: AtomicU64::new(0),
            escalations_raised: AtomicU64::new(0),
        }
    }

    counter!(inc_runs_started, runs_started);
    counter!(inc_runs_completed, runs_completed);
    counter!(inc_runs_failed, runs_failed);
    counter!(inc_runs_cancelled, runs_cancelled);
    counter!(inc_gate_updates, gate_updates);
    counter!(inc_updates_discarded, updates_discarded);
    counter!(inc_retries, retries_dispatched);
    counter!(inc_bypasses, bypasses_requested);
    counter!(inc_escalations, escalations_raised);

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            runs_cancelled: self.runs_cancelled.load(Ordering::Relaxed),
            gate_updates: self.gate_updates.load(Ordering::Relaxed),
            updates_discarded: self.updates_discarded.load(Ordering::Relaxed),
            retries_dispatched: self.retries_dispatched.load(Ordering::Relaxed),
            bypasses_requested: self.bypasses_requested.load(Ordering::Relaxed),
            escalations_raised: self.escalations_raised.load(Ordering::Relaxed),
        }
    }

    /// Emit every counter as a single `info!` event.
    ///
    /// Call at natural boundaries (end of a simulation, shutdown) rather than
    /// on every increment.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            runs_started = s.runs_started,
            runs_completed = s.runs_completed,
            runs_failed = s.runs_failed,
            runs_cancelled = s.runs_cancelled,
            gate_updates = s.gate_updates,
            updates_discarded = s.updates_discarded,
            retries_dispatched = s.retries_dispatched,
            bypasses_requested = s.bypasses_requested,
            escalations_raised = s.escalations_raised,
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.runs_started,
            &self.runs_completed,
            &self.runs_failed,
            &self.runs_cancelled,
            &self.gate_updates,
            &self.updates_discarded,
            &self.retries_dispatched,
            &self.bypasses_requested,
            &self.escalations_raised,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_runs_started();
        m.inc_runs_started();
        m.inc_retries();
        let s = m.snapshot();
        assert_eq!(s.runs_started, 2);
        assert_eq!(s.retries_dispatched, 1);
        assert_eq!(s.runs_failed, 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_escalations();
        m.inc_updates_discarded();
        m.reset();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }
}

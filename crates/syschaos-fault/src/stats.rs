//! Session-level counters.
//!
//! Updated with relaxed atomics on every decision, so they are safe to bump
//! from any thread (including from signal context) and are only
//! approximately consistent with each other when read concurrently.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by a [`DecisionEngine`](crate::engine::DecisionEngine).
#[derive(Debug, Default)]
pub struct SessionStats {
    intercepted: AtomicU64,
    ineligible: AtomicU64,
    failed_before: AtomicU64,
    failed_after: AtomicU64,
    delayed_before: AtomicU64,
    delayed_after: AtomicU64,
    decision_faults: AtomicU64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_intercepted(&self) {
        self.intercepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ineligible(&self) {
        self.ineligible.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, after: bool) {
        let counter = if after {
            &self.failed_after
        } else {
            &self.failed_before
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delay(&self, after: bool) {
        let counter = if after {
            &self.delayed_after
        } else {
            &self.delayed_before
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fault(&self) {
        self.decision_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> Stats {
        Stats {
            intercepted: self.intercepted.load(Ordering::Relaxed),
            ineligible: self.ineligible.load(Ordering::Relaxed),
            failed_before: self.failed_before.load(Ordering::Relaxed),
            failed_after: self.failed_after.load(Ordering::Relaxed),
            delayed_before: self.delayed_before.load(Ordering::Relaxed),
            delayed_after: self.delayed_after.load(Ordering::Relaxed),
            decision_faults: self.decision_faults.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`SessionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Calls to a configured syscall that reached the engine.
    pub intercepted: u64,
    /// Intercepted calls rejected by their eligibility rule.
    pub ineligible: u64,
    /// Failures reported without running the real call.
    pub failed_before: u64,
    /// Failures reported after the real call completed.
    pub failed_after: u64,
    pub delayed_before: u64,
    pub delayed_after: u64,
    /// Decisions that hit an internal inconsistency and passed through.
    pub decision_faults: u64,
}

impl Stats {
    pub fn failed(&self) -> u64 {
        self.failed_before + self.failed_after
    }

    pub fn delayed(&self) -> u64 {
        self.delayed_before + self.delayed_after
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "intercepted={} ineligible={} failed={}+{} delayed={}+{} faults={}",
            self.intercepted,
            self.ineligible,
            self.failed_before,
            self.failed_after,
            self.delayed_before,
            self.delayed_after,
            self.decision_faults
        )
    }
}

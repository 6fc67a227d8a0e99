//! Shared progress counters for a running job.
//!
//! All counters are atomics so workers update them without locking; a
//! [`ProgressStats`] snapshot is taken whenever an observer asks.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Point-in-time progress snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressStats {
    /// Items discovered so far (grows while the source is still feeding).
    pub total: usize,
    /// Items with a terminal record (success or failure).
    pub completed: usize,
    /// Items that produced validated output.
    pub succeeded: usize,
    /// Items that failed or timed out.
    pub failed: usize,
    /// Workers currently processing an item.
    pub active_workers: usize,
}

impl ProgressStats {
    /// Whether every discovered item has a terminal record.
    pub fn is_done(&self) -> bool {
        self.completed >= self.total && self.active_workers == 0
    }
}

/// Lock-free counters shared between workers and observers.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    total: AtomicUsize,
    completed: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    active_workers: AtomicUsize,
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register newly discovered items.
    pub fn add_total(&self, n: usize) {
        self.total.fetch_add(n, Ordering::SeqCst);
    }

    /// A worker picked up an item.
    pub fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    /// A worker finished its item (regardless of outcome).
    pub fn worker_finished(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Record a successful terminal result.
    pub fn record_success(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.succeeded.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a failed terminal result.
    pub fn record_failure(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    /// Roll a previous terminal result back out of the counters, so an
    /// operator-initiated re-run does not double count its item.
    pub fn rollback(&self, was_success: bool) {
        self.completed.fetch_sub(1, Ordering::SeqCst);
        if was_success {
            self.succeeded.fetch_sub(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Zero every counter; used when a job starts without appending to a
    /// previous run.
    pub fn reset(&self) {
        self.total.store(0, Ordering::SeqCst);
        self.completed.store(0, Ordering::SeqCst);
        self.succeeded.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        self.active_workers.store(0, Ordering::SeqCst);
    }

    /// Snapshot the current counters.
    pub fn snapshot(&self) -> ProgressStats {
        ProgressStats {
            total: self.total.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            active_workers: self.active_workers.load(Ordering::SeqCst),
        }
    }
}

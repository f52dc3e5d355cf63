//! Queue statistics.
//!
//! In-process counters are kept in [`SharedQueueStats`], shared by every
//! worker through an `Arc` and updated with atomic increments. They reset when
//! the process restarts. [`QueueStats`] is the snapshot returned by
//! `TaskQueue::get_stats`, combining those counters with live broker depths.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Snapshot of queue state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Tasks in the ready set.
    pub pending: u64,
    /// Tasks in the processing list.
    pub processing: u64,
    /// Tasks waiting in the scheduled set.
    pub scheduled: u64,
    /// Worker loops currently running.
    pub workers_active: usize,
    /// Attempts finished by this process, whatever their outcome.
    pub tasks_processed: u64,
    /// Tasks this process failed terminally.
    pub tasks_failed: u64,
    /// Retries this process scheduled.
    pub tasks_retried: u64,
}

impl QueueStats {
    /// Tasks known to the broker that have not reached a terminal state.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.processing + self.scheduled
    }

    /// Share of processed attempts that ended in a terminal failure, in percent.
    pub fn failure_rate(&self) -> f64 {
        if self.tasks_processed == 0 {
            return 0.0;
        }
        (self.tasks_failed as f64 / self.tasks_processed as f64) * 100.0
    }
}

/// Shared in-process counters.
#[derive(Debug, Default)]
pub struct SharedQueueStats {
    tasks_processed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_retried: AtomicU64,
    workers_active: AtomicUsize,
}

impl SharedQueueStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_processed(&self) {
        self.tasks_processed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_retried(&self) {
        self.tasks_retried.fetch_add(1, Ordering::SeqCst);
    }

    pub fn worker_started(&self) {
        self.workers_active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn worker_stopped(&self) {
        self.workers_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn workers_active(&self) -> usize {
        self.workers_active.load(Ordering::SeqCst)
    }

    /// Builds a snapshot from the counters and the given broker depths.
    pub fn snapshot(&self, pending: u64, processing: u64, scheduled: u64) -> QueueStats {
        QueueStats {
            pending,
            processing,
            scheduled,
            workers_active: self.workers_active(),
            tasks_processed: self.tasks_processed.load(Ordering::SeqCst),
            tasks_failed: self.tasks_failed.load(Ordering::SeqCst),
            tasks_retried: self.tasks_retried.load(Ordering::SeqCst),
        }
    }
}

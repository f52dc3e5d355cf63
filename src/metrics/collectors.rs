//! High-level recording interface over the raw Prometheus metrics.
//!
//! The worker pool and the queue API record through [`MetricsCollector`]
//! rather than touching the statics directly, so that label usage stays
//! consistent and recording is a no-op when metrics were never initialized.

use super::prometheus::{
    ACTIVE_WORKERS, QUEUE_DEPTH, TASKS_ENQUEUED, TASKS_IN_PROGRESS, TASKS_TOTAL,
    TASK_DURATION, TASK_RETRIES_TOTAL,
};

/// Metrics collector for recording queue operational metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a finished task attempt.
    ///
    /// # Arguments
    ///
    /// * `status` - Status the attempt ended in (e.g., "completed", "retrying")
    /// * `task_name` - Handler name of the task
    /// * `duration_secs` - Attempt duration in seconds
    pub fn record_attempt(&self, status: &str, task_name: &str, duration_secs: f64) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[status, task_name]).inc();
        }

        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[task_name])
                .observe(duration_secs);
        }

        tracing::trace!(
            status = status,
            task_name = task_name,
            duration_secs = duration_secs,
            "Recorded task attempt metric"
        );
    }

    /// Record a retry being scheduled.
    pub fn record_retry(&self, task_name: &str) {
        if let Some(retries) = TASK_RETRIES_TOTAL.get() {
            retries.with_label_values(&[task_name]).inc();
        }
    }

    /// Record a task being enqueued.
    pub fn record_enqueued(&self) {
        if let Some(enqueued) = TASKS_ENQUEUED.get() {
            enqueued.inc();
        }
    }

    /// Update the depth gauge of one queue structure.
    pub fn update_queue_depth(&self, queue: &str, depth: u64) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[queue]).set(depth as f64);
        }

        tracing::trace!(queue = queue, depth = depth, "Updated queue depth metric");
    }

    /// Update the count of running worker loops.
    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }
    }

    /// Increment the count of tasks in progress by 1.
    pub fn inc_tasks_in_progress(&self) {
        if let Some(in_progress) = TASKS_IN_PROGRESS.get() {
            in_progress.inc();
        }
    }

    /// Decrement the count of tasks in progress by 1.
    pub fn dec_tasks_in_progress(&self) {
        if let Some(in_progress) = TASKS_IN_PROGRESS.get() {
            in_progress.dec();
        }
    }
}

//! Metrics module for Prometheus-based monitoring.
//!
//! Exposes task attempt counters and durations, retry counts, queue depths,
//! and worker gauges for the task queue.
//!
//! # Example
//!
//! ```ignore
//! use taskforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_attempt("completed", "grading_task", 12.5);
//!
//! // Export metrics for Prometheus scraping
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, QUEUE_DEPTH, REGISTRY, TASKS_ENQUEUED, TASKS_IN_PROGRESS, TASKS_TOTAL,
    TASK_DURATION, TASK_RETRIES_TOTAL,
};

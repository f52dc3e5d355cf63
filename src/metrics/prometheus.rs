//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by taskforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all taskforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total task attempts finished, labeled by resulting status and task name.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Attempt duration in seconds, labeled by task name.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Total retries scheduled, labeled by task name.
pub static TASK_RETRIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total tasks enqueued.
pub static TASKS_ENQUEUED: OnceLock<Counter> = OnceLock::new();

/// Number of tasks per queue structure (ready, scheduled, processing).
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of tasks currently executing in this process.
pub static TASKS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of running worker loops.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Until it runs,
/// every recording method of [`MetricsCollector`](super::MetricsCollector) is a
/// no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Task metrics
    let tasks_total = CounterVec::new(
        Opts::new("taskforge_tasks_total", "Total task attempts finished"),
        &["status", "task_name"],
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "taskforge_task_duration_seconds",
            "Task attempt duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        &["task_name"],
    )?;

    let task_retries_total = CounterVec::new(
        Opts::new("taskforge_task_retries_total", "Total task retries scheduled"),
        &["task_name"],
    )?;

    let tasks_enqueued = Counter::new("taskforge_tasks_enqueued_total", "Total tasks enqueued")?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("taskforge_queue_depth", "Number of tasks per queue"),
        &["queue"],
    )?;

    let tasks_in_progress = Gauge::new(
        "taskforge_tasks_in_progress",
        "Number of tasks currently executing",
    )?;

    // Worker metrics
    let active_workers = Gauge::new("taskforge_active_workers", "Number of running worker loops")?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(task_retries_total.clone()))?;
    registry.register(Box::new(tasks_enqueued.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(tasks_in_progress.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = TASK_RETRIES_TOTAL.set(task_retries_total);
    let _ = TASKS_ENQUEUED.set(tasks_enqueued);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = TASKS_IN_PROGRESS.set(tasks_in_progress);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, the returned
/// string is a Prometheus comment describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

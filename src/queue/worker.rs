//! Worker loops that pop ready tasks and run them through their handlers.
//!
//! Each worker:
//! - Pops the highest-priority ready id (moving it onto the processing list)
//! - Executes one attempt under the task's timeout, capturing panics
//! - Records the outcome and either completes, reschedules, or fails the task
//! - Sleeps `poll_interval` when the ready set is empty and `error_backoff`
//!   after a broker error
//!
//! Shutdown is signalled through a broadcast channel. A worker finishes its
//! current attempt before it observes the signal.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::handler::{HandlerError, HandlerRegistry, TaskHandler};
use super::stats::SharedQueueStats;
use super::store::TaskStore;
use super::task::{
    TaskDefinition, TaskResult, TaskStatus, ERROR_TASK_DATA_EXPIRED, ERROR_TASK_EXPIRED,
};
use crate::config::RetryBackoff;
use crate::error::QueueError;
use crate::metrics::MetricsCollector;

/// Label used in metrics when the task name is unknown.
const UNKNOWN_TASK_NAME: &str = "unknown";

/// Timing knobs of a worker loop.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    pub retry_backoff: RetryBackoff,
}

/// Decrements the live worker count when a loop ends, including when its
/// Tokio task is aborted.
struct ActiveWorkerGuard {
    stats: Arc<SharedQueueStats>,
    metrics: MetricsCollector,
}

impl ActiveWorkerGuard {
    fn new(stats: Arc<SharedQueueStats>, metrics: MetricsCollector) -> Self {
        stats.worker_started();
        metrics.update_workers(stats.workers_active());
        Self { stats, metrics }
    }
}

impl Drop for ActiveWorkerGuard {
    fn drop(&mut self) {
        self.stats.worker_stopped();
        self.metrics.update_workers(self.stats.workers_active());
    }
}

/// A single worker loop.
pub struct Worker {
    /// Unique identifier for this worker, recorded in task results.
    id: String,
    store: Arc<TaskStore>,
    /// Handlers frozen at start.
    handlers: Arc<HandlerRegistry>,
    shutdown_rx: broadcast::Receiver<()>,
    settings: WorkerSettings,
    stats: Arc<SharedQueueStats>,
    metrics: MetricsCollector,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        store: Arc<TaskStore>,
        handlers: Arc<HandlerRegistry>,
        shutdown_rx: broadcast::Receiver<()>,
        settings: WorkerSettings,
        stats: Arc<SharedQueueStats>,
    ) -> Self {
        Self {
            id: id.into(),
            store,
            handlers,
            shutdown_rx,
            settings,
            stats,
            metrics: MetricsCollector::new(),
        }
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Main worker loop.
    ///
    /// Continuously pops and processes tasks until a shutdown signal is
    /// received or the shutdown sender is dropped.
    pub async fn run(mut self) {
        let _active = ActiveWorkerGuard::new(Arc::clone(&self.stats), self.metrics);
        info!(worker_id = %self.id, "Worker started");

        loop {
            // Check for shutdown signal (non-blocking)
            match self.shutdown_rx.try_recv() {
                Ok(())
                | Err(broadcast::error::TryRecvError::Closed)
                | Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            let wait = match self.store.pop_ready().await {
                Ok(Some(task_id)) => {
                    self.process_task(task_id).await;
                    continue;
                }
                Ok(None) => {
                    debug!(worker_id = %self.id, "No tasks available");
                    self.settings.poll_interval
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to pop ready task");
                    self.settings.error_backoff
                }
            };

            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Processes one popped task id and releases it from the processing list
    /// once its outcome is recorded.
    pub async fn process_task(&self, task_id: Uuid) {
        let start_time = Instant::now();
        self.metrics.inc_tasks_in_progress();

        let outcome = self.execute_attempt(task_id).await;

        self.metrics.dec_tasks_in_progress();
        let duration = start_time.elapsed();

        match outcome {
            Ok((status, task_name)) => {
                self.metrics
                    .record_attempt(&status.to_string(), &task_name, duration.as_secs_f64());

                if let Err(e) = self.store.finish_processing(task_id).await {
                    error!(
                        worker_id = %self.id,
                        task_id = %task_id,
                        error = %e,
                        "Failed to remove task from processing list"
                    );
                }
            }
            Err(e) => {
                // The id stays on the processing list so `recover_processing`
                // can requeue it.
                error!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    error = %e,
                    "Failed to record task outcome"
                );
            }
        }

        self.stats.record_processed();
    }

    /// Runs one attempt and returns the status it ended in with the task name.
    async fn execute_attempt(&self, task_id: Uuid) -> Result<(TaskStatus, String), QueueError> {
        let started_at = Utc::now();
        let retry_count = self.previous_retry_count(task_id).await?;

        let Some(task) = self.store.load_task(task_id).await? else {
            warn!(worker_id = %self.id, task_id = %task_id, "Task data expired before execution");
            self.fail(task_id, started_at, ERROR_TASK_DATA_EXPIRED, retry_count)
                .await?;
            return Ok((TaskStatus::Failed, UNKNOWN_TASK_NAME.to_string()));
        };

        if task.is_expired(started_at) {
            warn!(
                worker_id = %self.id,
                task_id = %task_id,
                task_name = %task.name,
                "Task expired before execution"
            );
            self.fail(task_id, started_at, ERROR_TASK_EXPIRED, retry_count)
                .await?;
            return Ok((TaskStatus::Failed, task.name));
        }

        let Some(handler) = self.handlers.get(&task.name) else {
            error!(
                worker_id = %self.id,
                task_id = %task_id,
                task_name = %task.name,
                "No handler registered"
            );
            let message = format!("no handler registered for task type: {}", task.name);
            self.fail(task_id, started_at, &message, retry_count).await?;
            return Ok((TaskStatus::Failed, task.name));
        };

        info!(
            worker_id = %self.id,
            task_id = %task_id,
            task_name = %task.name,
            retry_count = retry_count,
            "Processing task"
        );

        self.store
            .store_result(&TaskResult::processing(
                task_id, &self.id, started_at, retry_count,
            ))
            .await?;

        let status = match self.invoke(handler.as_ref(), &task).await {
            Ok(value) => {
                self.store
                    .store_result(&TaskResult::completed(
                        task_id,
                        &self.id,
                        started_at,
                        value.clone(),
                        retry_count,
                    ))
                    .await?;
                info!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    task_name = %task.name,
                    duration_ms = (Utc::now() - started_at).num_milliseconds(),
                    "Task completed successfully"
                );
                run_hook(handler.on_success(&task, &value)).await;
                TaskStatus::Completed
            }
            Err(error) => {
                self.handle_failure(handler.as_ref(), &task, started_at, retry_count, error)
                    .await?
            }
        };

        Ok((status, task.name))
    }

    /// Invokes the handler under the task timeout, turning panics and
    /// timeouts into handler errors.
    async fn invoke(
        &self,
        handler: &dyn TaskHandler,
        task: &TaskDefinition,
    ) -> Result<Value, HandlerError> {
        let execution = AssertUnwindSafe(handler.execute(task)).catch_unwind();

        match tokio::time::timeout(task.timeout_duration(), execution).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
            Err(_) => Err(HandlerError::Timeout(task.timeout)),
        }
    }

    /// Retry path shared by handler errors, panics and timeouts.
    ///
    /// A timeout reaches `on_failure` on every attempt, retried or not; other
    /// errors reach it only once the task fails terminally.
    async fn handle_failure(
        &self,
        handler: &dyn TaskHandler,
        task: &TaskDefinition,
        started_at: DateTime<Utc>,
        retry_count: u32,
        error: HandlerError,
    ) -> Result<TaskStatus, QueueError> {
        let next_retry = if retry_count < task.max_retries {
            self.retry_at(task, retry_count + 1)
                .map(|next_run| (retry_count + 1, next_run))
        } else {
            None
        };

        if let Some((retry_count, next_run)) = next_retry {
            warn!(
                worker_id = %self.id,
                task_id = %task.id,
                task_name = %task.name,
                retry_count = retry_count,
                max_retries = task.max_retries,
                next_run = %next_run,
                error = %error,
                "Task failed, scheduling retry"
            );

            self.store
                .store_result(
                    &TaskResult::retrying(
                        task.id,
                        &self.id,
                        started_at,
                        error.to_string(),
                        retry_count,
                    )
                    .with_error_detail(format!("{:?}", error)),
                )
                .await?;
            self.store.push_scheduled(&task.rescheduled(next_run)).await?;

            self.stats.record_retried();
            self.metrics.record_retry(&task.name);
            if error.is_timeout() {
                run_hook(handler.on_failure(task, &error)).await;
            }
            run_hook(handler.on_retry(task, retry_count, &error)).await;
            Ok(TaskStatus::Retrying)
        } else {
            error!(
                worker_id = %self.id,
                task_id = %task.id,
                task_name = %task.name,
                retry_count = retry_count,
                error = %error,
                "Task failed permanently"
            );

            self.store
                .store_result(
                    &TaskResult::failed(
                        task.id,
                        &self.id,
                        started_at,
                        error.to_string(),
                        retry_count,
                    )
                    .with_error_detail(format!("{:?}", error)),
                )
                .await?;

            self.stats.record_failed();
            run_hook(handler.on_failure(task, &error)).await;
            Ok(TaskStatus::Failed)
        }
    }

    /// When retry `retry_count` of `task` is due, or `None` when that lies
    /// outside the representable time range.
    fn retry_at(&self, task: &TaskDefinition, retry_count: u32) -> Option<DateTime<Utc>> {
        let delay = self
            .settings
            .retry_backoff
            .delay(task.retry_delay_duration(), retry_count);
        let next_run = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay));

        if next_run.is_none() {
            warn!(
                worker_id = %self.id,
                task_id = %task.id,
                retry_delay = task.retry_delay,
                "Retry delay out of range, failing task"
            );
        }
        next_run
    }

    /// Writes a terminal failure that bypasses the retry path.
    async fn fail(
        &self,
        task_id: Uuid,
        started_at: DateTime<Utc>,
        message: &str,
        retry_count: u32,
    ) -> Result<(), QueueError> {
        self.store
            .store_result(&TaskResult::failed(
                task_id, &self.id, started_at, message, retry_count,
            ))
            .await?;
        self.stats.record_failed();
        Ok(())
    }

    async fn previous_retry_count(&self, task_id: Uuid) -> Result<u32, QueueError> {
        Ok(self
            .store
            .load_result(task_id)
            .await?
            .map(|result| result.retry_count)
            .unwrap_or(0))
    }
}

/// Awaits a lifecycle hook, logging instead of propagating a panic.
async fn run_hook<F>(hook: F)
where
    F: std::future::Future<Output = ()>,
{
    if let Err(panic) = AssertUnwindSafe(hook).catch_unwind().await {
        error!(
            error = %panic_message(panic.as_ref()),
            "Task handler hook panicked"
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

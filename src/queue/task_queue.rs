//! The [`TaskQueue`] facade: enqueue API, introspection, and the lifecycle of
//! the worker pool and scheduler loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::handler::{HandlerRegistry, TaskHandler};
use super::scheduler::Scheduler;
use super::stats::{QueueStats, SharedQueueStats};
use super::store::TaskStore;
use super::task::{EnqueueOptions, TaskDefinition, TaskResult, ERROR_TASK_DATA_EXPIRED};
use super::worker::{Worker, WorkerSettings};
use crate::broker::{Broker, RedisBroker};
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::metrics::MetricsCollector;

/// Asynchronous priority task queue.
///
/// Handlers are registered before [`start`](Self::start); enqueue,
/// cancellation, and introspection work whether or not this process runs
/// workers, so a producer-only process never calls `start`.
pub struct TaskQueue {
    config: QueueConfig,
    store: Arc<TaskStore>,
    handlers: HandlerRegistry,
    stats: Arc<SharedQueueStats>,
    metrics: MetricsCollector,
    /// Broadcast channel for shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
    /// Handles of the spawned worker loops and the scheduler loop.
    handles: Vec<JoinHandle<()>>,
    is_running: AtomicBool,
}

impl TaskQueue {
    /// Creates a queue over an existing broker.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Config` if the configuration is invalid.
    pub fn new(broker: Arc<dyn Broker>, config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let store = Arc::new(TaskStore::from_config(broker, &config));

        Ok(Self {
            config,
            store,
            handlers: HandlerRegistry::new(),
            stats: Arc::new(SharedQueueStats::new()),
            metrics: MetricsCollector::new(),
            shutdown_tx,
            handles: Vec::new(),
            is_running: AtomicBool::new(false),
        })
    }

    /// Connects to Redis at `config.redis_url` and creates a queue over it.
    pub async fn connect(config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        let broker = RedisBroker::connect(&config.redis_url).await?;
        Self::new(Arc::new(broker), config)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Registers the handler for tasks named `name`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::AlreadyRunning` once the queue has started and
    /// `QueueError::HandlerAlreadyRegistered` for a duplicate name.
    pub fn register_handler(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), QueueError> {
        if self.is_running() {
            return Err(QueueError::AlreadyRunning);
        }

        let name = name.into();
        self.handlers.register(name.clone(), handler)?;
        info!(task_name = %name, "Registered task handler");
        Ok(())
    }

    /// Names of the registered handlers, sorted.
    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.names()
    }

    /// Validates and submits a task, returning its id.
    ///
    /// Tasks whose `scheduled_at` is in the future go to the scheduled set;
    /// everything else goes straight to the ready set. Nothing is written when
    /// validation fails.
    pub async fn enqueue(
        &self,
        name: &str,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<Uuid, QueueError> {
        let task = TaskDefinition::new(name, payload, options)?;

        if task.is_deferred(Utc::now()) {
            self.store.push_scheduled(&task).await?;
            info!(
                task_id = %task.id,
                task_name = %task.name,
                scheduled_at = ?task.scheduled_at,
                "Scheduled task"
            );
        } else {
            self.store.push_ready(&task).await?;
            info!(
                task_id = %task.id,
                task_name = %task.name,
                priority = %task.priority,
                "Enqueued task"
            );
        }

        self.metrics.record_enqueued();
        Ok(task.id)
    }

    /// Current result record of a task, if any transition has happened yet.
    pub async fn get_result(&self, task_id: Uuid) -> Result<Option<TaskResult>, QueueError> {
        self.store.load_result(task_id).await
    }

    /// Cancels a task that has not been picked up by a worker.
    ///
    /// Returns `false` when the task is neither ready nor scheduled, which
    /// covers tasks already executing and tasks already finished.
    pub async fn cancel(&self, task_id: Uuid) -> Result<bool, QueueError> {
        let removed = self.store.remove_ready(task_id).await?
            || self.store.remove_scheduled(task_id).await?;
        if !removed {
            return Ok(false);
        }

        let retry_count = self
            .store
            .load_result(task_id)
            .await?
            .map(|result| result.retry_count)
            .unwrap_or(0);
        self.store
            .store_result(&TaskResult::cancelled(task_id, retry_count))
            .await?;

        info!(task_id = %task_id, "Cancelled task");
        Ok(true)
    }

    /// Counters of this process combined with live broker depths.
    pub async fn get_stats(&self) -> Result<QueueStats, QueueError> {
        let pending = self.store.ready_len().await?;
        let processing = self.store.processing_len().await?;
        let scheduled = self.store.scheduled_len().await?;

        self.metrics.update_queue_depth("ready", pending);
        self.metrics.update_queue_depth("processing", processing);
        self.metrics.update_queue_depth("scheduled", scheduled);

        Ok(self.stats.snapshot(pending, processing, scheduled))
    }

    /// Moves ids left in the processing list by a crashed process back to the
    /// ready set, returning how many were requeued.
    ///
    /// Ids whose task blob has expired are failed with "task data expired".
    /// Only run this while no worker of this namespace is executing, since a
    /// live attempt looks the same as an abandoned one.
    pub async fn recover_processing(&self) -> Result<usize, QueueError> {
        let mut recovered = 0;

        for member in self.store.processing_ids().await? {
            if !self.store.remove_processing_entry(&member).await? {
                continue;
            }

            let task_id = match Uuid::parse_str(&member) {
                Ok(id) => id,
                Err(e) => {
                    error!(member = %member, error = %e, "Dropping malformed processing entry");
                    continue;
                }
            };

            match self.store.load_task(task_id).await? {
                Some(task) => {
                    self.store.push_ready(&task).await?;
                    recovered += 1;
                }
                None => {
                    warn!(task_id = %task_id, "Recovered task has no data, marking failed");
                    let retry_count = self
                        .store
                        .load_result(task_id)
                        .await?
                        .map(|result| result.retry_count)
                        .unwrap_or(0);
                    self.store
                        .store_result(&TaskResult::failed(
                            task_id,
                            "recovery",
                            Utc::now(),
                            ERROR_TASK_DATA_EXPIRED,
                            retry_count,
                        ))
                        .await?;
                }
            }
        }

        Ok(recovered)
    }

    /// Deletes the ready, scheduled, and processing structures.
    ///
    /// **Warning**: queued tasks are lost. Results and task blobs are left to
    /// expire.
    pub async fn purge(&self) -> Result<(), QueueError> {
        self.store.purge().await?;
        warn!(namespace = %self.config.namespace, "Purged task queues");
        Ok(())
    }

    /// Starts the worker pool and the scheduler loop.
    ///
    /// The handler registry is frozen at this point.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::NoHandlers` when nothing is registered and
    /// `QueueError::AlreadyRunning` if the queue is already running.
    pub async fn start(&mut self) -> Result<(), QueueError> {
        if self.is_running() {
            return Err(QueueError::AlreadyRunning);
        }
        if self.handlers.is_empty() {
            return Err(QueueError::NoHandlers);
        }

        self.store.broker().ping().await?;

        if self.config.recover_on_start {
            // Recover any tasks stuck in the processing list from previous runs
            match self.recover_processing().await {
                Ok(recovered) => {
                    if recovered > 0 {
                        info!(recovered = recovered, "Recovered tasks from processing list");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to recover processing tasks");
                }
            }
        }

        let handlers = Arc::new(self.handlers.clone());
        let settings = WorkerSettings {
            poll_interval: self.config.poll_interval,
            error_backoff: self.config.error_backoff,
            retry_backoff: self.config.retry_backoff,
        };

        for i in 0..self.config.num_workers {
            let worker = Worker::new(
                format!("worker-{}", i),
                Arc::clone(&self.store),
                Arc::clone(&handlers),
                self.shutdown_tx.subscribe(),
                settings,
                Arc::clone(&self.stats),
            );
            self.handles.push(tokio::spawn(worker.run()));
        }

        let scheduler = Scheduler::new(
            Arc::clone(&self.store),
            self.config.scheduler_interval,
            self.config.scheduler_error_backoff,
            self.shutdown_tx.subscribe(),
        );
        self.handles.push(tokio::spawn(scheduler.run()));

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            num_workers = self.config.num_workers,
            handlers = ?self.handlers.names(),
            "Task queue started"
        );

        Ok(())
    }

    /// Signals every loop to stop and waits for in-flight attempts.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::NotRunning` if the queue was not started and
    /// `QueueError::ShutdownTimeout` if `shutdown_timeout` elapses first. In
    /// that case the remaining loops are aborted and their in-flight ids stay
    /// in the processing list for [`recover_processing`](Self::recover_processing).
    pub async fn stop(&mut self) -> Result<(), QueueError> {
        if !self.is_running() {
            return Err(QueueError::NotRunning);
        }

        info!("Initiating task queue shutdown");

        // Ignore send error - loops may have already stopped
        let _ = self.shutdown_tx.send(());

        let mut handles: Vec<JoinHandle<()>> = self.handles.drain(..).collect();
        let shutdown_future = async {
            for handle in handles.iter_mut() {
                if let Err(e) = handle.await {
                    error!(error = %e, "Queue loop panicked during shutdown");
                }
            }
        };

        let outcome = match self.config.shutdown_timeout {
            Some(limit) => tokio::time::timeout(limit, shutdown_future)
                .await
                .map_err(|_| QueueError::ShutdownTimeout(limit)),
            None => {
                shutdown_future.await;
                Ok(())
            }
        };

        self.is_running.store(false, Ordering::SeqCst);

        match outcome {
            Ok(()) => {
                info!("Task queue shutdown complete");
                Ok(())
            }
            Err(e) => {
                for handle in &handles {
                    handle.abort();
                }
                error!(error = %e, "Task queue shutdown timed out, aborting loops");
                Err(e)
            }
        }
    }
}

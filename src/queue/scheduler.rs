//! Scheduler loop that promotes due scheduled tasks into the ready set.
//!
//! This is the only path by which delayed tasks and retries become eligible
//! for execution. Each due entry is claimed by removing it from the scheduled
//! set before it is pushed to the ready set, so concurrent schedulers never
//! promote the same entry twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::store::{from_epoch_seconds, ScheduledEntry, TaskStore};
use super::task::TaskDefinition;
use crate::error::QueueError;

pub struct Scheduler {
    store: Arc<TaskStore>,
    interval: Duration,
    error_backoff: Duration,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Scheduler {
    pub fn new(
        store: Arc<TaskStore>,
        interval: Duration,
        error_backoff: Duration,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            store,
            interval,
            error_backoff,
            shutdown_rx,
        }
    }

    /// Runs promotion passes until shutdown.
    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs_f64(), "Scheduler started");

        loop {
            let wait = match self.promote_due(Utc::now()).await {
                Ok(promoted) => {
                    if promoted > 0 {
                        info!(promoted = promoted, "Promoted scheduled tasks");
                    }
                    self.interval
                }
                Err(e) => {
                    error!(error = %e, "Scheduler pass failed");
                    self.error_backoff
                }
            };

            tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("Scheduler stopped");
    }

    /// Promotes every entry due at `now`, returning how many reached the
    /// ready set.
    ///
    /// A failure on one entry is logged and does not stop the pass; only a
    /// failure to read the scheduled set is returned.
    pub async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let entries = self.store.due_scheduled(now).await?;
        let mut promoted = 0;

        for entry in entries {
            match self.promote(&entry).await {
                Ok(true) => promoted += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(error = %e, score = entry.score, "Failed to promote scheduled entry");
                }
            }
        }

        Ok(promoted)
    }

    async fn promote(&self, entry: &ScheduledEntry) -> Result<bool, QueueError> {
        let task: TaskDefinition = match serde_json::from_str(&entry.member) {
            Ok(task) => task,
            Err(e) => {
                error!(error = %e, "Dropping unparsable scheduled entry");
                self.store.claim_scheduled(entry).await?;
                return Ok(false);
            }
        };

        if !self.store.claim_scheduled(entry).await? {
            debug!(task_id = %task.id, "Scheduled entry already claimed");
            return Ok(false);
        }

        if let Err(e) = self.store.push_ready(&task).await {
            warn!(task_id = %task.id, error = %e, "Promotion failed, restoring scheduled entry");
            self.store.restore_scheduled(entry).await?;
            return Err(e);
        }

        debug!(
            task_id = %task.id,
            task_name = %task.name,
            due_at = ?from_epoch_seconds(entry.score),
            "Task moved to ready set"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::QueueConfig;
    use crate::queue::task::{EnqueueOptions, TaskPriority};
    use serde_json::json;

    fn scheduler() -> (Scheduler, Arc<TaskStore>, broadcast::Sender<()>) {
        let store = Arc::new(TaskStore::from_config(
            Arc::new(MemoryBroker::new()),
            &QueueConfig::default(),
        ));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            Duration::from_millis(10),
            Duration::from_millis(10),
            shutdown_rx,
        );
        (scheduler, store, shutdown_tx)
    }

    fn task_due_in(seconds: i64, priority: TaskPriority) -> TaskDefinition {
        TaskDefinition::new("echo", json!({}), EnqueueOptions::new().with_priority(priority))
            .expect("valid task")
            .rescheduled(Utc::now() + chrono::Duration::seconds(seconds))
    }

    #[tokio::test]
    async fn test_promotes_only_due_entries() {
        let (scheduler, store, _tx) = scheduler();
        let due = task_due_in(-5, TaskPriority::High);
        let later = task_due_in(3600, TaskPriority::High);
        store.push_scheduled(&due).await.expect("push");
        store.push_scheduled(&later).await.expect("push");

        let promoted = scheduler.promote_due(Utc::now()).await.expect("pass");
        assert_eq!(promoted, 1);
        assert_eq!(store.ready_len().await.expect("len"), 1);
        assert_eq!(store.scheduled_len().await.expect("len"), 1);
        assert_eq!(store.pop_ready().await.expect("pop"), Some(due.id));

        // A second pass finds nothing new
        assert_eq!(scheduler.promote_due(Utc::now()).await.expect("pass"), 0);
    }

    #[tokio::test]
    async fn test_unparsable_entry_dropped_without_stopping_pass() {
        let (scheduler, store, _tx) = scheduler();
        let due = task_due_in(-1, TaskPriority::Normal);
        store.push_scheduled(&due).await.expect("push");
        store
            .broker()
            .zadd(&store.keys().scheduled, "{not json", 0.0)
            .await
            .expect("zadd");

        let promoted = scheduler.promote_due(Utc::now()).await.expect("pass");
        assert_eq!(promoted, 1);
        assert_eq!(store.scheduled_len().await.expect("len"), 0);
    }

    #[tokio::test]
    async fn test_promotion_refreshes_blob() {
        let (scheduler, store, _tx) = scheduler();
        let due = task_due_in(-1, TaskPriority::Low);
        store.push_scheduled(&due).await.expect("push");
        store
            .broker()
            .del(&store.keys().task(due.id))
            .await
            .expect("del");

        scheduler.promote_due(Utc::now()).await.expect("pass");
        assert_eq!(store.load_task(due.id).await.expect("load"), Some(due));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (scheduler, store, tx) = scheduler();
        let due = task_due_in(-1, TaskPriority::Urgent);
        store.push_scheduled(&due).await.expect("push");

        let handle = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.ready_len().await.expect("len"), 1);

        tx.send(()).expect("send");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler stops promptly")
            .expect("scheduler task");
    }
}

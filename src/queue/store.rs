//! Broker-backed persistence for tasks, queues, and results.
//!
//! # Key layout
//!
//! | Key                | Type       | Content                                    |
//! |--------------------|------------|--------------------------------------------|
//! | `task:{id}`        | string     | serialized `TaskDefinition`, with TTL      |
//! | `result:{id}`      | string     | serialized `TaskResult`, with TTL          |
//! | `queue:ready`      | sorted set | task ids, score = priority                 |
//! | `queue:scheduled`  | sorted set | serialized tasks, score = due epoch secs   |
//! | `queue:processing` | list       | ids currently being executed               |
//!
//! With a non-empty namespace every key is prefixed with `{namespace}:`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use super::task::{TaskDefinition, TaskResult};
use crate::broker::Broker;
use crate::config::QueueConfig;
use crate::error::QueueError;

/// Broker key names for one queue namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    prefix: String,
    /// Sorted set of ready task ids.
    pub ready: String,
    /// Sorted set of serialized scheduled tasks.
    pub scheduled: String,
    /// List of ids being processed.
    pub processing: String,
}

impl QueueKeys {
    pub fn new(namespace: &str) -> Self {
        let prefix = if namespace.is_empty() {
            String::new()
        } else {
            format!("{}:", namespace)
        };

        Self {
            ready: format!("{}queue:ready", prefix),
            scheduled: format!("{}queue:scheduled", prefix),
            processing: format!("{}queue:processing", prefix),
            prefix,
        }
    }

    pub fn task(&self, id: Uuid) -> String {
        format!("{}task:{}", self.prefix, id)
    }

    pub fn result(&self, id: Uuid) -> String {
        format!("{}result:{}", self.prefix, id)
    }
}

/// Retention applied to the records the store writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub task_ttl: Duration,
    pub scheduled_task_ttl: Duration,
    pub result_ttl: Duration,
}

impl From<&QueueConfig> for Retention {
    fn from(config: &QueueConfig) -> Self {
        Self {
            task_ttl: config.task_ttl,
            scheduled_task_ttl: config.scheduled_task_ttl,
            result_ttl: config.result_ttl,
        }
    }
}

/// A due entry read from the scheduled set.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledEntry {
    /// Raw sorted-set member, needed to remove the entry.
    pub member: String,
    /// Due time as epoch seconds.
    pub score: f64,
}

/// Queue-level operations over a [`Broker`].
pub struct TaskStore {
    broker: Arc<dyn Broker>,
    keys: QueueKeys,
    retention: Retention,
}

impl TaskStore {
    pub fn new(broker: Arc<dyn Broker>, keys: QueueKeys, retention: Retention) -> Self {
        Self {
            broker,
            keys,
            retention,
        }
    }

    /// Creates a store using the namespace and retention of `config`.
    pub fn from_config(broker: Arc<dyn Broker>, config: &QueueConfig) -> Self {
        Self::new(broker, QueueKeys::new(&config.namespace), Retention::from(config))
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Stores the task blob with the immediate TTL and adds its id to the
    /// ready set, scored by priority.
    pub async fn push_ready(&self, task: &TaskDefinition) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(task)?;
        self.broker
            .set_ex(&self.keys.task(task.id), &serialized, self.retention.task_ttl)
            .await?;
        self.broker
            .zadd(&self.keys.ready, &task.id.to_string(), task.priority.score())
            .await?;
        Ok(())
    }

    /// Stores the task blob with the scheduled TTL and adds the serialized
    /// task to the scheduled set, scored by its due time.
    ///
    /// A task without `scheduled_at` is scheduled for now.
    pub async fn push_scheduled(&self, task: &TaskDefinition) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(task)?;
        let due = task.scheduled_at.unwrap_or_else(Utc::now);
        self.broker
            .set_ex(
                &self.keys.task(task.id),
                &serialized,
                self.retention.scheduled_task_ttl,
            )
            .await?;
        self.broker
            .zadd(&self.keys.scheduled, &serialized, epoch_seconds(due))
            .await?;
        Ok(())
    }

    /// Loads a task blob; `None` if it never existed or expired.
    pub async fn load_task(&self, id: Uuid) -> Result<Option<TaskDefinition>, QueueError> {
        match self.broker.get(&self.keys.task(id)).await? {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Atomically pops the highest-priority ready id and records it in the
    /// processing list.
    ///
    /// Entries that are not valid ids are dropped with an error log.
    pub async fn pop_ready(&self) -> Result<Option<Uuid>, QueueError> {
        loop {
            let Some((member, _score)) = self.broker.zpopmax(&self.keys.ready).await? else {
                return Ok(None);
            };

            match Uuid::parse_str(&member) {
                Ok(id) => {
                    self.broker.lpush(&self.keys.processing, &member).await?;
                    return Ok(Some(id));
                }
                Err(e) => {
                    tracing::error!(member = %member, error = %e, "Dropping malformed ready entry");
                }
            }
        }
    }

    /// Removes an id from the processing list.
    pub async fn finish_processing(&self, id: Uuid) -> Result<(), QueueError> {
        self.broker
            .lrem(&self.keys.processing, 0, &id.to_string())
            .await?;
        Ok(())
    }

    /// Ids currently recorded as processing.
    pub async fn processing_ids(&self) -> Result<Vec<String>, QueueError> {
        Ok(self.broker.lrange_all(&self.keys.processing).await?)
    }

    /// Removes one occurrence of a raw processing entry, returning whether it
    /// was present.
    pub async fn remove_processing_entry(&self, member: &str) -> Result<bool, QueueError> {
        Ok(self.broker.lrem(&self.keys.processing, 1, member).await? > 0)
    }

    /// Removes an id from the ready set, returning whether it was present.
    pub async fn remove_ready(&self, id: Uuid) -> Result<bool, QueueError> {
        Ok(self.broker.zrem(&self.keys.ready, &id.to_string()).await? > 0)
    }

    /// Removes the scheduled entry of a task, returning whether one was found.
    ///
    /// The scheduled set is keyed by the serialized task, so this scans it.
    pub async fn remove_scheduled(&self, id: Uuid) -> Result<bool, QueueError> {
        let entries = self
            .broker
            .zrangebyscore(&self.keys.scheduled, f64::NEG_INFINITY, f64::INFINITY)
            .await?;

        for (member, _score) in entries {
            let matches = serde_json::from_str::<TaskDefinition>(&member)
                .map(|task| task.id == id)
                .unwrap_or(false);
            if matches && self.broker.zrem(&self.keys.scheduled, &member).await? > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Scheduled entries whose due time is at or before `now`, oldest first.
    pub async fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledEntry>, QueueError> {
        let entries = self
            .broker
            .zrangebyscore(&self.keys.scheduled, f64::NEG_INFINITY, epoch_seconds(now))
            .await?;
        Ok(entries
            .into_iter()
            .map(|(member, score)| ScheduledEntry { member, score })
            .collect())
    }

    /// Claims a scheduled entry by removing it; `false` means another
    /// scheduler removed it first.
    pub async fn claim_scheduled(&self, entry: &ScheduledEntry) -> Result<bool, QueueError> {
        Ok(self.broker.zrem(&self.keys.scheduled, &entry.member).await? > 0)
    }

    /// Puts a claimed scheduled entry back.
    pub async fn restore_scheduled(&self, entry: &ScheduledEntry) -> Result<(), QueueError> {
        self.broker
            .zadd(&self.keys.scheduled, &entry.member, entry.score)
            .await?;
        Ok(())
    }

    /// Overwrites the result record of a task.
    pub async fn store_result(&self, result: &TaskResult) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(result)?;
        self.broker
            .set_ex(
                &self.keys.result(result.task_id),
                &serialized,
                self.retention.result_ttl,
            )
            .await?;
        Ok(())
    }

    /// Loads the current result record of a task.
    pub async fn load_result(&self, id: Uuid) -> Result<Option<TaskResult>, QueueError> {
        match self.broker.get(&self.keys.result(id)).await? {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Number of ids in the ready set.
    pub async fn ready_len(&self) -> Result<u64, QueueError> {
        Ok(self.broker.zcard(&self.keys.ready).await?)
    }

    /// Number of entries in the scheduled set.
    pub async fn scheduled_len(&self) -> Result<u64, QueueError> {
        Ok(self.broker.zcard(&self.keys.scheduled).await?)
    }

    /// Number of ids in the processing list.
    pub async fn processing_len(&self) -> Result<u64, QueueError> {
        Ok(self.broker.llen(&self.keys.processing).await?)
    }

    /// Deletes the ready, scheduled, and processing structures.
    ///
    /// Task blobs and results are left to expire.
    pub async fn purge(&self) -> Result<(), QueueError> {
        self.broker.del(&self.keys.ready).await?;
        self.broker.del(&self.keys.scheduled).await?;
        self.broker.del(&self.keys.processing).await?;
        Ok(())
    }
}

/// Unix timestamp in seconds with millisecond precision.
pub fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

/// Inverse of [`epoch_seconds`].
pub fn from_epoch_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt((seconds * 1000.0).round() as i64)
        .single()
}

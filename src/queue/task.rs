//! Task definitions and results.
//!
//! This module defines the records the queue persists in the broker:
//!
//! - `TaskDefinition`: an immutable description of a unit of work
//! - `TaskPriority`: dispatch priority, higher values dequeue first
//! - `EnqueueOptions`: the optional enqueue parameters, validated up front
//! - `TaskResult`: the current outcome record of a task
//! - `TaskStatus`: lifecycle state carried by a `TaskResult`

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ValidationError;

/// Default number of retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Upper bound accepted for `max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Default delay before the first retry, in seconds.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 60;

/// Default per-attempt timeout, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Upper bound accepted for `retry_delay`: one week.
pub const MAX_RETRY_DELAY_SECS: u64 = 7 * 24 * 3600;

/// Upper bound accepted for `timeout`: one day.
pub const MAX_TIMEOUT_SECS: u64 = 24 * 3600;

/// Error recorded when `expires_at` passed before the task could start.
pub const ERROR_TASK_EXPIRED: &str = "task expired";

/// Error recorded when the task blob expired from the broker before execution.
pub const ERROR_TASK_DATA_EXPIRED: &str = "task data expired";

/// Dispatch priority of a task.
///
/// Serialized as its numeric level so that the stored JSON matches the
/// sorted-set score.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum TaskPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl TaskPriority {
    /// All priority levels, lowest first.
    pub const ALL: [TaskPriority; 4] = [Self::Low, Self::Normal, Self::High, Self::Urgent];

    /// Sorted-set score used for the ready queue.
    pub fn score(self) -> f64 {
        f64::from(u8::from(self))
    }
}

impl From<TaskPriority> for u8 {
    fn from(priority: TaskPriority) -> Self {
        priority as u8
    }
}

impl TryFrom<u8> for TaskPriority {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Low),
            1 => Ok(Self::Normal),
            2 => Ok(Self::High),
            3 => Ok(Self::Urgent),
            other => Err(ValidationError::UnknownPriority(other.to_string())),
        }
    }
}

impl FromStr for TaskPriority {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" | "0" => Ok(Self::Low),
            "normal" | "1" => Ok(Self::Normal),
            "high" | "2" => Ok(Self::High),
            "urgent" | "3" => Ok(Self::Urgent),
            _ => Err(ValidationError::UnknownPriority(s.to_string())),
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Normal => write!(f, "normal"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Urgent => write!(f, "urgent"),
        }
    }
}

/// Optional parameters accepted by `TaskQueue::enqueue`.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOptions {
    pub priority: TaskPriority,
    /// When to run the task; `None` or a past time means immediately.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: u32,
    /// Base delay before a retry, in seconds.
    pub retry_delay: u64,
    /// Hard limit for a single attempt, in seconds.
    pub timeout: u64,
    /// Tasks that have not started by this time are failed without running.
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: TaskPriority::Normal,
            scheduled_at: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY_SECS,
            timeout: DEFAULT_TIMEOUT_SECS,
            expires_at: None,
            created_by: None,
        }
    }
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Schedules the task `delay` from now.
    ///
    /// A delay past the representable range saturates at
    /// `DateTime::<Utc>::MAX_UTC`, i.e. the task never becomes due.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        let at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay_secs(mut self, seconds: u64) -> Self {
        self.retry_delay = seconds;
        self
    }

    pub fn with_timeout_secs(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    pub fn with_expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = Some(created_by.into());
        self
    }

    /// Checks the numeric bounds of the options.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ValidationError::MaxRetriesOutOfRange {
                value: self.max_retries,
                max: MAX_RETRIES_LIMIT,
            });
        }
        if !(1..=MAX_RETRY_DELAY_SECS).contains(&self.retry_delay) {
            return Err(ValidationError::RetryDelayOutOfRange {
                value: self.retry_delay,
                max: MAX_RETRY_DELAY_SECS,
            });
        }
        if !(1..=MAX_TIMEOUT_SECS).contains(&self.timeout) {
            return Err(ValidationError::TimeoutOutOfRange {
                value: self.timeout,
                max: MAX_TIMEOUT_SECS,
            });
        }
        Ok(())
    }
}

/// An immutable description of a unit of work.
///
/// Once persisted a definition is never modified in place: a retry stores a
/// copy with a new `scheduled_at` under the same `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: Uuid,
    /// Name of the handler that executes this task.
    pub name: String,
    /// Opaque document handed to the handler verbatim.
    #[serde(default)]
    pub payload: Value,
    pub priority: TaskPriority,
    pub max_retries: u32,
    /// Base retry delay in seconds.
    pub retry_delay: u64,
    /// Per-attempt timeout in seconds.
    pub timeout: u64,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl TaskDefinition {
    /// Creates a validated task definition with a fresh id.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` if the name is empty or any option is out
    /// of range.
    pub fn new(
        name: impl Into<String>,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyTaskName);
        }
        options.validate()?;

        Ok(Self {
            id: Uuid::new_v4(),
            name,
            payload,
            priority: options.priority,
            max_retries: options.max_retries,
            retry_delay: options.retry_delay,
            timeout: options.timeout,
            scheduled_at: options.scheduled_at,
            expires_at: options.expires_at,
            created_at: Utc::now(),
            created_by: options.created_by,
        })
    }

    /// Returns whether the task must go to the scheduled queue rather than
    /// the ready queue.
    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_some_and(|at| at > now)
    }

    /// Returns whether the task's `expires_at` has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }

    /// Returns a copy of this definition scheduled for `at`.
    pub fn rescheduled(&self, at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at: Some(at),
            ..self.clone()
        }
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn retry_delay_duration(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl TaskStatus {
    /// Returns whether no further transition can follow this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
            TaskStatus::Retrying => write!(f, "retrying"),
        }
    }
}

/// Current outcome record of a task.
///
/// There is one record per task id; each status transition overwrites it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub status: TaskStatus,
    /// Handler output, only set when the task completed.
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Debug rendering of the error chain.
    #[serde(default)]
    pub error_detail: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    /// Number of retries scheduled so far.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub worker_id: Option<String>,
}

impl TaskResult {
    fn base(task_id: Uuid, status: TaskStatus, retry_count: u32) -> Self {
        Self {
            task_id,
            status,
            result: None,
            error: None,
            error_detail: None,
            started_at: None,
            completed_at: None,
            execution_time_ms: None,
            retry_count,
            worker_id: None,
        }
    }

    /// Record written right before a handler is invoked.
    pub fn processing(
        task_id: Uuid,
        worker_id: impl Into<String>,
        started_at: DateTime<Utc>,
        retry_count: u32,
    ) -> Self {
        Self {
            started_at: Some(started_at),
            worker_id: Some(worker_id.into()),
            ..Self::base(task_id, TaskStatus::Processing, retry_count)
        }
    }

    /// Record of a successful attempt.
    pub fn completed(
        task_id: Uuid,
        worker_id: impl Into<String>,
        started_at: DateTime<Utc>,
        result: Value,
        retry_count: u32,
    ) -> Self {
        Self {
            result: Some(result),
            worker_id: Some(worker_id.into()),
            ..Self::base(task_id, TaskStatus::Completed, retry_count).finished(started_at)
        }
    }

    /// Terminal failure record.
    pub fn failed(
        task_id: Uuid,
        worker_id: impl Into<String>,
        started_at: DateTime<Utc>,
        error: impl Into<String>,
        retry_count: u32,
    ) -> Self {
        Self {
            error: Some(error.into()),
            worker_id: Some(worker_id.into()),
            ..Self::base(task_id, TaskStatus::Failed, retry_count).finished(started_at)
        }
    }

    /// Record of a failed attempt that has been rescheduled.
    pub fn retrying(
        task_id: Uuid,
        worker_id: impl Into<String>,
        started_at: DateTime<Utc>,
        error: impl Into<String>,
        retry_count: u32,
    ) -> Self {
        Self {
            error: Some(error.into()),
            worker_id: Some(worker_id.into()),
            ..Self::base(task_id, TaskStatus::Retrying, retry_count).finished(started_at)
        }
    }

    /// Terminal record of a task removed from the queue before it ran.
    pub fn cancelled(task_id: Uuid, retry_count: u32) -> Self {
        Self {
            completed_at: Some(Utc::now()),
            ..Self::base(task_id, TaskStatus::Cancelled, retry_count)
        }
    }

    /// Attaches a detailed error description.
    pub fn with_error_detail(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }

    fn finished(mut self, started_at: DateTime<Utc>) -> Self {
        let completed_at = Utc::now();
        self.started_at = Some(started_at);
        self.completed_at = Some(completed_at);
        self.execution_time_ms = Some(
            (completed_at - started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

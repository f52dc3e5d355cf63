//! Task handlers and the registry that resolves them by name.
//!
//! A handler is the pluggable business logic behind a task name. The queue
//! only knows the [`TaskHandler`] trait; registration happens once at startup
//! and the registry is frozen when the worker pool starts.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use super::task::TaskDefinition;
use crate::error::QueueError;

/// Errors produced by a task attempt.
///
/// Every variant is recoverable through the retry path; the worker decides
/// between a retry and a terminal failure based on the task's `max_retries`.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler reported a failure.
    #[error("{0}")]
    Execution(String),

    /// The payload did not have the shape the handler expects.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The attempt exceeded the task's timeout.
    #[error("Task timed out after {0} seconds")]
    Timeout(u64),

    /// The handler panicked.
    #[error("Handler panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    /// Convenience constructor for `HandlerError::Execution`.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Business logic executed for tasks of a given name.
///
/// Implementations should be stateless with respect to individual tasks:
/// the same handler instance serves every worker concurrently.
///
/// # Example
///
/// ```ignore
/// use taskforge::queue::{HandlerError, TaskDefinition, TaskHandler};
///
/// struct GradingHandler;
///
/// #[async_trait::async_trait]
/// impl TaskHandler for GradingHandler {
///     async fn execute(&self, task: &TaskDefinition) -> Result<serde_json::Value, HandlerError> {
///         let submission = task.payload["submission_id"]
///             .as_str()
///             .ok_or_else(|| HandlerError::InvalidPayload("missing submission_id".into()))?;
///         Ok(serde_json::json!({ "graded": submission }))
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Runs one attempt of the task and returns its result document.
    async fn execute(&self, task: &TaskDefinition) -> Result<Value, HandlerError>;

    /// Called after the task completed and its result was stored.
    async fn on_success(&self, _task: &TaskDefinition, _result: &Value) {}

    /// Called once the task failed terminally, and after every timed out
    /// attempt even when a retry follows (then before `on_retry`).
    async fn on_failure(&self, _task: &TaskDefinition, _error: &HandlerError) {}

    /// Called after a failed attempt was rescheduled.
    async fn on_retry(&self, _task: &TaskDefinition, _retry_count: u32, _error: &HandlerError) {}
}

/// Name to handler mapping.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::HandlerAlreadyRegistered` if the name is taken.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), QueueError> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(QueueError::HandlerAlreadyRegistered(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Looks up the handler for a task name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

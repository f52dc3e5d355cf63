//! Error types for taskforge operations.
//!
//! Subsystem-specific errors live next to their subsystem
//! ([`BrokerError`](crate::broker::BrokerError),
//! [`HandlerError`](crate::queue::HandlerError),
//! [`ConfigError`](crate::config::ConfigError)); this module holds the
//! enqueue-time validation errors and the top-level queue error that wraps
//! everything a caller of [`TaskQueue`](crate::queue::TaskQueue) can observe.

use std::time::Duration;

use thiserror::Error;

use crate::broker::BrokerError;
use crate::config::ConfigError;

/// Errors raised while validating enqueue parameters.
///
/// Validation always happens before any broker write, so a validation error
/// never leaves partial state behind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Task name cannot be empty")]
    EmptyTaskName,

    #[error("Unknown task priority '{0}': must be 0-3 or low, normal, high, urgent")]
    UnknownPriority(String),

    #[error("max_retries must be between 0 and {max}, got {value}")]
    MaxRetriesOutOfRange { value: u32, max: u32 },

    #[error("retry_delay must be between 1 and {max} seconds, got {value}")]
    RetryDelayOutOfRange { value: u64, max: u64 },

    #[error("timeout must be between 1 and {max} seconds, got {value}")]
    TimeoutOutOfRange { value: u64, max: u64 },
}

/// Errors returned by the task queue API.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Enqueue parameters were rejected.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The backing broker failed.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Failed to serialize or deserialize queue records.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Queue configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// `start()` was called on a running queue, or a handler was registered
    /// after start.
    #[error("Task queue is already running")]
    AlreadyRunning,

    /// `stop()` was called on a queue that is not running.
    #[error("Task queue is not running")]
    NotRunning,

    /// `start()` was called without any registered handler.
    #[error("No task handlers registered")]
    NoHandlers,

    /// A handler with the same name is already registered.
    #[error("Handler '{0}' is already registered")]
    HandlerAlreadyRegistered(String),

    /// Workers did not stop within the configured shutdown timeout.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

//! taskforge: asynchronous priority task queue backed by Redis.
//!
//! Producers enqueue named tasks with a JSON payload, a priority, and an
//! optional schedule; a pool of workers executes them through registered
//! handlers with timeouts, retries, and persisted results.

// Core modules
pub mod broker;
pub mod cli;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod queue;

// Re-export commonly used types
pub use broker::{Broker, BrokerError, MemoryBroker, RedisBroker};
pub use config::{ConfigError, QueueConfig, RetryBackoff};
pub use error::{QueueError, ValidationError};
pub use queue::{
    EnqueueOptions, HandlerError, QueueStats, TaskDefinition, TaskHandler, TaskPriority,
    TaskQueue, TaskResult, TaskStatus,
};

//! Asynchronous priority task queue.
//!
//! This module provides the queue itself:
//!
//! - **TaskQueue**: enqueue API, cancellation, stats, and the lifecycle of the
//!   worker pool and scheduler loop
//! - **Worker**: loop that pops the highest-priority ready task and executes it
//!   under a timeout with retries
//! - **Scheduler**: loop that promotes due delayed and retried tasks
//! - **TaskStore**: broker key layout and queue-level operations
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │  (enqueue)   │
//!                      └──────┬───────┘
//!              scheduled_at   │   immediate
//!           ┌─────────────────┴───────────────┐
//!           ▼                                 ▼
//!    ┌──────────────┐    Scheduler     ┌──────────────┐
//!    │  scheduled   │ ───────────────► │    ready     │
//!    │ (due time)   │                  │  (priority)  │
//!    └──────▲───────┘                  └──────┬───────┘
//!           │ retry                           │ ZPOPMAX
//!           │         ┌─────────┐             │
//!           └──────── │ Workers │ ◄───────────┘
//!                     └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use taskforge::config::QueueConfig;
//! use taskforge::queue::{EnqueueOptions, TaskPriority, TaskQueue};
//!
//! let mut queue = TaskQueue::connect(QueueConfig::from_env()?).await?;
//! queue.register_handler("grading_task", Arc::new(GradingHandler))?;
//! queue.start().await?;
//!
//! let id = queue
//!     .enqueue(
//!         "grading_task",
//!         serde_json::json!({"submission_id": "abc"}),
//!         EnqueueOptions::new().with_priority(TaskPriority::High),
//!     )
//!     .await?;
//!
//! let result = queue.get_result(id).await?;
//! queue.stop().await?;
//! ```

pub mod handler;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod task;
pub mod task_queue;
pub mod worker;

pub use handler::{HandlerError, HandlerRegistry, TaskHandler};
pub use scheduler::Scheduler;
pub use stats::{QueueStats, SharedQueueStats};
pub use store::{QueueKeys, Retention, TaskStore};
pub use task::{
    EnqueueOptions, TaskDefinition, TaskPriority, TaskResult, TaskStatus, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_DELAY_SECS, DEFAULT_TIMEOUT_SECS, MAX_RETRIES_LIMIT, MAX_RETRY_DELAY_SECS,
    MAX_TIMEOUT_SECS,
};
pub use task_queue::TaskQueue;
pub use worker::{Worker, WorkerSettings};

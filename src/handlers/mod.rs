//! Built-in task handlers registered by the `taskforge worker` command.
//!
//! - `echo` returns its payload unchanged
//! - `sleep` waits `payload.seconds` and reports how long it slept
//!
//! They are useful for smoke-testing a deployment and exercising timeouts and
//! retries without writing a handler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::QueueError;
use crate::queue::{HandlerError, TaskDefinition, TaskHandler, TaskQueue};

/// Name under which [`EchoHandler`] is registered.
pub const ECHO_TASK: &str = "echo";

/// Name under which [`SleepHandler`] is registered.
pub const SLEEP_TASK: &str = "sleep";

/// Returns the task payload as its result.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn execute(&self, task: &TaskDefinition) -> Result<Value, HandlerError> {
        Ok(task.payload.clone())
    }
}

/// Sleeps for `payload.seconds` (integer or fractional).
#[derive(Debug, Clone, Copy, Default)]
pub struct SleepHandler;

impl SleepHandler {
    fn duration(payload: &Value) -> Result<Duration, HandlerError> {
        let seconds = payload
            .get("seconds")
            .and_then(Value::as_f64)
            .ok_or_else(|| HandlerError::InvalidPayload("expected numeric 'seconds'".into()))?;

        Duration::try_from_secs_f64(seconds)
            .map_err(|e| HandlerError::InvalidPayload(format!("invalid 'seconds': {}", e)))
    }
}

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn execute(&self, task: &TaskDefinition) -> Result<Value, HandlerError> {
        let duration = Self::duration(&task.payload)?;
        tokio::time::sleep(duration).await;
        Ok(json!({ "slept_seconds": duration.as_secs_f64() }))
    }
}

/// Registers every built-in handler on `queue`.
pub fn register_builtin(queue: &mut TaskQueue) -> Result<(), QueueError> {
    queue.register_handler(ECHO_TASK, Arc::new(EchoHandler))?;
    queue.register_handler(SLEEP_TASK, Arc::new(SleepHandler))?;
    Ok(())
}

//! End-to-end tests of the task queue against the in-memory broker.
//!
//! Run with: cargo test --test queue_integration

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use taskforge::handlers::{EchoHandler, SleepHandler};
use taskforge::queue::{HandlerError, TaskDefinition, TaskHandler};
use taskforge::{
    EnqueueOptions, MemoryBroker, QueueConfig, QueueError, TaskPriority, TaskQueue, TaskResult,
    TaskStatus,
};
use uuid::Uuid;

/// Records the `label` field of each payload it runs, in order.
#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<String>>,
}

impl RecordingHandler {
    fn seen(&self) -> Vec<String> {
        self.seen.lock().expect("lock").clone()
    }
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    async fn execute(&self, task: &TaskDefinition) -> Result<Value, HandlerError> {
        let label = task.payload["label"].as_str().unwrap_or_default().to_string();
        self.seen.lock().expect("lock").push(label.clone());
        Ok(json!({ "label": label }))
    }
}

/// Always fails and remembers every retry count it was told about.
#[derive(Default)]
struct FailingHandler {
    calls: AtomicU32,
    retries: Mutex<Vec<u32>>,
    failures: AtomicU32,
}

#[async_trait]
impl TaskHandler for FailingHandler {
    async fn execute(&self, _task: &TaskDefinition) -> Result<Value, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::execution("upstream unavailable"))
    }

    async fn on_retry(&self, _task: &TaskDefinition, retry_count: u32, _error: &HandlerError) {
        self.retries.lock().expect("lock").push(retry_count);
    }

    async fn on_failure(&self, _task: &TaskDefinition, _error: &HandlerError) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

fn test_config() -> QueueConfig {
    QueueConfig::default()
        .with_num_workers(1)
        .with_poll_interval(Duration::from_millis(20))
        .with_scheduler_interval(Duration::from_millis(50))
        .with_error_backoff(Duration::from_millis(50))
        .with_scheduler_error_backoff(Duration::from_millis(50))
}

fn new_queue(config: QueueConfig) -> TaskQueue {
    TaskQueue::new(Arc::new(MemoryBroker::new()), config).expect("queue")
}

/// Polls until the task's result satisfies `done` or the deadline passes.
async fn wait_for<F>(queue: &TaskQueue, id: Uuid, deadline: Duration, done: F) -> TaskResult
where
    F: Fn(&TaskResult) -> bool,
{
    let result = tokio::time::timeout(deadline, async {
        loop {
            if let Some(result) = queue.get_result(id).await.expect("get_result") {
                if done(&result) {
                    return result;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;

    result.unwrap_or_else(|_| panic!("task {} did not reach the expected state in time", id))
}

async fn wait_for_terminal(queue: &TaskQueue, id: Uuid) -> TaskResult {
    wait_for(queue, id, Duration::from_secs(15), TaskResult::is_terminal).await
}

#[tokio::test]
async fn test_round_trip_result() {
    let mut queue = new_queue(test_config());
    queue
        .register_handler("echo", Arc::new(EchoHandler))
        .expect("register");
    queue.start().await.expect("start");

    let payload = json!({"submission": "abc", "scores": [1, 2, 3]});
    let id = queue
        .enqueue("echo", payload.clone(), EnqueueOptions::new())
        .await
        .expect("enqueue");

    let result = wait_for_terminal(&queue, id).await;
    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.result, Some(payload));
    assert_eq!(result.retry_count, 0);
    assert_eq!(result.worker_id.as_deref(), Some("worker-0"));
    assert!(result.execution_time_ms.is_some());

    queue.stop().await.expect("stop");

    let stats = queue.get_stats().await.expect("stats");
    assert_eq!(stats.tasks_processed, 1);
    assert_eq!(stats.tasks_failed, 0);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.workers_active, 0);
}

#[tokio::test]
async fn test_urgent_runs_before_low_with_single_worker() {
    let handler = Arc::new(RecordingHandler::default());
    let mut queue = new_queue(test_config());
    queue
        .register_handler("record", handler.clone())
        .expect("register");

    // Enqueue before starting so both are ready when the worker first pops
    let low = queue
        .enqueue(
            "record",
            json!({"label": "low"}),
            EnqueueOptions::new().with_priority(TaskPriority::Low),
        )
        .await
        .expect("enqueue");
    let normal = queue
        .enqueue("record", json!({"label": "normal"}), EnqueueOptions::new())
        .await
        .expect("enqueue");
    let urgent = queue
        .enqueue(
            "record",
            json!({"label": "urgent"}),
            EnqueueOptions::new().with_priority(TaskPriority::Urgent),
        )
        .await
        .expect("enqueue");

    queue.start().await.expect("start");
    for id in [low, normal, urgent] {
        wait_for_terminal(&queue, id).await;
    }
    queue.stop().await.expect("stop");

    assert_eq!(handler.seen(), vec!["urgent", "normal", "low"]);
}

#[tokio::test]
async fn test_scheduled_task_waits_for_scheduler() {
    let handler = Arc::new(RecordingHandler::default());
    let mut queue = new_queue(test_config());
    queue
        .register_handler("record", handler.clone())
        .expect("register");
    queue.start().await.expect("start");

    let id = queue
        .enqueue(
            "record",
            json!({"label": "later"}),
            EnqueueOptions::new().with_delay(Duration::from_millis(800)),
        )
        .await
        .expect("enqueue");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(queue.get_result(id).await.expect("result").is_none());
    let stats = queue.get_stats().await.expect("stats");
    assert_eq!(stats.scheduled, 1);
    assert_eq!(stats.pending, 0);
    assert!(handler.seen().is_empty());

    let result = wait_for_terminal(&queue, id).await;
    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(handler.seen(), vec!["later"]);

    queue.stop().await.expect("stop");
}

#[tokio::test]
async fn test_failing_handler_retries_then_fails() {
    let handler = Arc::new(FailingHandler::default());
    let mut queue = new_queue(test_config());
    queue
        .register_handler("flaky", handler.clone())
        .expect("register");
    queue.start().await.expect("start");

    let id = queue
        .enqueue(
            "flaky",
            json!({}),
            EnqueueOptions::new()
                .with_max_retries(2)
                .with_retry_delay_secs(1),
        )
        .await
        .expect("enqueue");

    let first = wait_for(&queue, id, Duration::from_secs(5), |r| {
        r.status == TaskStatus::Retrying
    })
    .await;
    assert_eq!(first.retry_count, 1);
    assert_eq!(first.error.as_deref(), Some("upstream unavailable"));

    let result = wait_for_terminal(&queue, id).await;
    queue.stop().await.expect("stop");

    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.retry_count, 2);
    assert_eq!(result.error.as_deref(), Some("upstream unavailable"));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    assert_eq!(*handler.retries.lock().expect("lock"), vec![1, 2]);
    assert_eq!(handler.failures.load(Ordering::SeqCst), 1);

    let stats = queue.get_stats().await.expect("stats");
    assert_eq!(stats.tasks_retried, 2);
    assert_eq!(stats.tasks_failed, 1);
    assert_eq!(stats.tasks_processed, 3);
}

#[tokio::test]
async fn test_timeout_follows_retry_path() {
    let mut queue = new_queue(test_config());
    queue
        .register_handler("sleep", Arc::new(SleepHandler))
        .expect("register");
    queue.start().await.expect("start");

    let id = queue
        .enqueue(
            "sleep",
            json!({"seconds": 10}),
            EnqueueOptions::new()
                .with_timeout_secs(1)
                .with_max_retries(1)
                .with_retry_delay_secs(1),
        )
        .await
        .expect("enqueue");

    let result = wait_for_terminal(&queue, id).await;
    queue.stop().await.expect("stop");

    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.retry_count, 1);
    assert_eq!(result.error.as_deref(), Some("Task timed out after 1 seconds"));
}

#[tokio::test]
async fn test_expired_task_is_not_executed() {
    let handler = Arc::new(RecordingHandler::default());
    let mut queue = new_queue(test_config());
    queue
        .register_handler("record", handler.clone())
        .expect("register");

    let id = queue
        .enqueue(
            "record",
            json!({"label": "stale"}),
            EnqueueOptions::new().with_expires_at(Utc::now() - chrono::Duration::seconds(1)),
        )
        .await
        .expect("enqueue");

    queue.start().await.expect("start");
    let result = wait_for_terminal(&queue, id).await;
    queue.stop().await.expect("stop");

    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("task expired"));
    assert!(handler.seen().is_empty());
}

#[tokio::test]
async fn test_unregistered_task_fails() {
    let mut queue = new_queue(test_config());
    queue
        .register_handler("echo", Arc::new(EchoHandler))
        .expect("register");
    queue.start().await.expect("start");

    let id = queue
        .enqueue("resize_image", json!({}), EnqueueOptions::new())
        .await
        .expect("enqueue");

    let result = wait_for_terminal(&queue, id).await;
    queue.stop().await.expect("stop");

    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(
        result.error.as_deref(),
        Some("no handler registered for task type: resize_image")
    );
    assert_eq!(result.retry_count, 0);
}

#[tokio::test]
async fn test_cancel_ready_and_running_tasks() {
    let mut queue = new_queue(test_config());
    queue
        .register_handler("sleep", Arc::new(SleepHandler))
        .expect("register");

    let queued = queue
        .enqueue("sleep", json!({"seconds": 0}), EnqueueOptions::new())
        .await
        .expect("enqueue");
    assert!(queue.cancel(queued).await.expect("cancel"));
    let cancelled = queue.get_result(queued).await.expect("result").expect("present");
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    queue.start().await.expect("start");
    let running = queue
        .enqueue("sleep", json!({"seconds": 0.5}), EnqueueOptions::new())
        .await
        .expect("enqueue");
    wait_for(&queue, running, Duration::from_secs(5), |r| {
        r.status == TaskStatus::Processing
    })
    .await;
    assert!(!queue.cancel(running).await.expect("cancel"));

    let finished = wait_for_terminal(&queue, running).await;
    assert_eq!(finished.status, TaskStatus::Completed);
    assert!(!queue.cancel(running).await.expect("cancel"));

    queue.stop().await.expect("stop");
    // The cancelled task never ran
    let cancelled = queue.get_result(queued).await.expect("result").expect("present");
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_task() {
    let mut queue = new_queue(test_config());
    queue
        .register_handler("sleep", Arc::new(SleepHandler))
        .expect("register");
    queue.start().await.expect("start");

    let id = queue
        .enqueue("sleep", json!({"seconds": 0.3}), EnqueueOptions::new())
        .await
        .expect("enqueue");
    wait_for(&queue, id, Duration::from_secs(5), |r| {
        r.status == TaskStatus::Processing
    })
    .await;

    queue.stop().await.expect("stop");

    let result = queue.get_result(id).await.expect("result").expect("present");
    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(queue.get_stats().await.expect("stats").processing, 0);
}

#[tokio::test]
async fn test_shutdown_timeout_leaves_task_recoverable() {
    let config = test_config().with_shutdown_timeout(Duration::from_millis(100));
    let mut queue = new_queue(config);
    queue
        .register_handler("sleep", Arc::new(SleepHandler))
        .expect("register");
    queue.start().await.expect("start");

    let id = queue
        .enqueue("sleep", json!({"seconds": 30}), EnqueueOptions::new())
        .await
        .expect("enqueue");
    wait_for(&queue, id, Duration::from_secs(5), |r| {
        r.status == TaskStatus::Processing
    })
    .await;

    let err = queue.stop().await.expect_err("stop should time out");
    assert!(matches!(err, QueueError::ShutdownTimeout(_)));
    assert!(!queue.is_running());

    assert_eq!(queue.get_stats().await.expect("stats").processing, 1);
    assert_eq!(queue.recover_processing().await.expect("recover"), 1);

    let stats = queue.get_stats().await.expect("stats");
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.pending, 1);
}

#[tokio::test]
async fn test_validation_errors_write_nothing() {
    let queue = new_queue(test_config());

    let invalid = [
        ("", EnqueueOptions::new()),
        ("echo", EnqueueOptions::new().with_max_retries(11)),
        ("echo", EnqueueOptions::new().with_retry_delay_secs(0)),
        ("echo", EnqueueOptions::new().with_timeout_secs(0)),
        (
            "echo",
            EnqueueOptions::new().with_retry_delay_secs(1_000_000_000_000_000),
        ),
        (
            "echo",
            EnqueueOptions::new().with_timeout_secs(1_000_000_000_000_000),
        ),
    ];
    for (name, options) in invalid {
        let err = queue
            .enqueue(name, json!({}), options)
            .await
            .expect_err("validation should fail");
        assert!(matches!(err, QueueError::Validation(_)), "{:?}", err);
    }

    let stats = queue.get_stats().await.expect("stats");
    assert_eq!(stats.outstanding(), 0);
}

#[tokio::test]
async fn test_lifecycle_rules() {
    let mut queue = new_queue(test_config());
    assert!(matches!(queue.start().await, Err(QueueError::NoHandlers)));

    queue
        .register_handler("echo", Arc::new(EchoHandler))
        .expect("register");
    queue.start().await.expect("start");
    assert!(matches!(
        queue.register_handler("late", Arc::new(EchoHandler)),
        Err(QueueError::AlreadyRunning)
    ));
    queue.stop().await.expect("stop");

    // A stopped queue can be started again
    queue.start().await.expect("restart");
    let id = queue
        .enqueue("echo", json!(1), EnqueueOptions::new())
        .await
        .expect("enqueue");
    assert_eq!(wait_for_terminal(&queue, id).await.result, Some(json!(1)));
    queue.stop().await.expect("stop");
}

//! CLI command definitions for taskforge.
//!
//! The binary runs workers with the built-in handlers and offers producer and
//! operator commands against the same Redis namespace.

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::handlers::register_builtin;
use crate::metrics::{export_metrics, init_metrics};
use crate::queue::{EnqueueOptions, QueueStats, TaskPriority, TaskQueue, TaskResult};

/// Asynchronous priority task queue backed by Redis.
#[derive(Parser)]
#[command(name = "taskforge")]
#[command(about = "Asynchronous priority task queue backed by Redis")]
#[command(version)]
#[command(
    long_about = "taskforge runs task workers and manages the queue they consume.\n\nConfiguration is read from TASKFORGE_* environment variables; the flags below override it.\n\nExample usage:\n  taskforge worker --workers 4\n  taskforge enqueue echo --payload '{\"hello\":\"world\"}' --priority high"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis connection URL.
    #[arg(long, env = "TASKFORGE_REDIS_URL", global = true)]
    pub redis_url: Option<String>,

    /// Key namespace shared by producers and workers.
    #[arg(long, env = "TASKFORGE_NAMESPACE", global = true)]
    pub namespace: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the worker pool and scheduler with the built-in handlers.
    Worker(WorkerArgs),

    /// Submit a task.
    Enqueue(EnqueueArgs),

    /// Show the current result record of a task.
    Result(TaskIdArgs),

    /// Cancel a task that is still queued or scheduled.
    Cancel(TaskIdArgs),

    /// Show queue depths and counters.
    Stats(StatsArgs),

    /// Requeue tasks left in the processing list by a crashed worker.
    ///
    /// Only run this while no worker of the namespace is running.
    Recover,

    /// Delete every queued, scheduled, and processing entry.
    Purge(PurgeArgs),
}

/// Arguments for `taskforge worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Number of worker loops.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Requeue abandoned processing entries before starting.
    #[arg(long)]
    pub recover: bool,

    /// Seconds to wait for in-flight tasks on shutdown.
    #[arg(long)]
    pub shutdown_timeout: Option<u64>,
}

/// Arguments for `taskforge enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Handler name of the task.
    pub name: String,

    /// JSON payload.
    #[arg(short, long, default_value = "{}")]
    pub payload: String,

    /// Priority: low, normal, high, urgent, or 0-3.
    #[arg(long, default_value = "normal")]
    pub priority: TaskPriority,

    /// Run no earlier than this many seconds from now.
    #[arg(long)]
    pub delay: Option<u64>,

    /// Maximum number of retries after a failed attempt.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Seconds to wait before a retry.
    #[arg(long)]
    pub retry_delay: Option<u64>,

    /// Attempt timeout in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Fail the task instead of running it if it starts later than this many
    /// seconds from now.
    #[arg(long)]
    pub expires_in: Option<u64>,

    /// Free-form submitter identifier.
    #[arg(long)]
    pub created_by: Option<String>,
}

/// Arguments for commands that take a task id.
#[derive(Parser, Debug)]
pub struct TaskIdArgs {
    /// Task id returned by `enqueue`.
    pub task_id: Uuid,

    /// Output JSON instead of text.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Output formats for `taskforge stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatsFormat {
    Text,
    Json,
    Prometheus,
}

/// Arguments for `taskforge stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Output format.
    #[arg(short, long, value_enum, default_value = "text")]
    pub format: StatsFormat,
}

/// Arguments for `taskforge purge`.
#[derive(Parser, Debug)]
pub struct PurgeArgs {
    /// Confirm the deletion.
    #[arg(long)]
    pub yes: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// This is a convenience function that parses CLI args and runs the command.
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// This is the main entry point for the taskforge CLI.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = build_config(&cli)?;

    match cli.command {
        Commands::Worker(args) => run_worker_command(config, args).await,
        Commands::Enqueue(args) => run_enqueue_command(config, args).await,
        Commands::Result(args) => run_result_command(config, args).await,
        Commands::Cancel(args) => run_cancel_command(config, args).await,
        Commands::Stats(args) => run_stats_command(config, args).await,
        Commands::Recover => run_recover_command(config).await,
        Commands::Purge(args) => run_purge_command(config, args).await,
    }
}

/// Loads the environment configuration and applies the global flags.
fn build_config(cli: &Cli) -> anyhow::Result<QueueConfig> {
    let mut config = QueueConfig::from_env().context("Failed to load configuration")?;
    if let Some(url) = &cli.redis_url {
        config = config.with_redis_url(url.clone());
    }
    if let Some(namespace) = &cli.namespace {
        config = config.with_namespace(namespace.clone());
    }
    Ok(config)
}

async fn connect(config: QueueConfig) -> anyhow::Result<TaskQueue> {
    let url = config.redis_url.clone();
    TaskQueue::connect(config)
        .await
        .with_context(|| format!("Failed to connect to {}", url))
}

// ============================================================================
// Worker Command Implementation
// ============================================================================

async fn run_worker_command(mut config: QueueConfig, args: WorkerArgs) -> anyhow::Result<()> {
    if let Some(workers) = args.workers {
        config = config.with_num_workers(workers);
    }
    if args.recover {
        config = config.with_recover_on_start(true);
    }
    if let Some(seconds) = args.shutdown_timeout {
        config = config.with_shutdown_timeout(Duration::from_secs(seconds));
    }

    init_metrics().context("Failed to initialize metrics")?;

    let mut queue = connect(config).await?;
    register_builtin(&mut queue)?;
    queue.start().await?;

    info!("Worker running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    queue.stop().await?;

    let stats = queue.get_stats().await?;
    info!(
        processed = stats.tasks_processed,
        failed = stats.tasks_failed,
        retried = stats.tasks_retried,
        "Worker exited"
    );
    Ok(())
}

// ============================================================================
// Producer and Operator Commands
// ============================================================================

/// Builds enqueue options from the flags, leaving defaults for unset values.
fn enqueue_options(args: &EnqueueArgs) -> anyhow::Result<EnqueueOptions> {
    let mut options = EnqueueOptions::new().with_priority(args.priority);
    if let Some(delay) = args.delay {
        options = options.with_scheduled_at(seconds_from_now(delay, "--delay")?);
    }
    if let Some(max_retries) = args.max_retries {
        options = options.with_max_retries(max_retries);
    }
    if let Some(retry_delay) = args.retry_delay {
        options = options.with_retry_delay_secs(retry_delay);
    }
    if let Some(timeout) = args.timeout {
        options = options.with_timeout_secs(timeout);
    }
    if let Some(expires_in) = args.expires_in {
        options = options.with_expires_at(seconds_from_now(expires_in, "--expires-in")?);
    }
    if let Some(created_by) = &args.created_by {
        options = options.with_created_by(created_by.clone());
    }
    Ok(options)
}

fn seconds_from_now(seconds: u64, flag: &str) -> anyhow::Result<DateTime<Utc>> {
    i64::try_from(seconds)
        .ok()
        .and_then(chrono::TimeDelta::try_seconds)
        .and_then(|offset| Utc::now().checked_add_signed(offset))
        .ok_or_else(|| anyhow::anyhow!("{} of {} seconds is out of range", flag, seconds))
}

async fn run_enqueue_command(config: QueueConfig, args: EnqueueArgs) -> anyhow::Result<()> {
    let payload: Value =
        serde_json::from_str(&args.payload).context("Payload is not valid JSON")?;
    let options = enqueue_options(&args)?;

    let queue = connect(config).await?;
    let task_id = queue.enqueue(&args.name, payload, options).await?;

    println!("{}", task_id);
    Ok(())
}

async fn run_result_command(config: QueueConfig, args: TaskIdArgs) -> anyhow::Result<()> {
    let queue = connect(config).await?;

    match queue.get_result(args.task_id).await? {
        Some(result) if args.json => println!("{}", serde_json::to_string_pretty(&result)?),
        Some(result) => print!("{}", format_result(&result)),
        None if args.json => println!("null"),
        None => println!("No result for task {} (pending, unknown, or expired)", args.task_id),
    }
    Ok(())
}

async fn run_cancel_command(config: QueueConfig, args: TaskIdArgs) -> anyhow::Result<()> {
    let queue = connect(config).await?;
    let cancelled = queue.cancel(args.task_id).await?;

    if args.json {
        println!(
            "{}",
            serde_json::json!({ "task_id": args.task_id, "cancelled": cancelled })
        );
    } else if cancelled {
        println!("✓ Cancelled task {}", args.task_id);
    } else {
        println!(
            "Task {} is not queued (already running, finished, or unknown)",
            args.task_id
        );
    }
    Ok(())
}

async fn run_stats_command(config: QueueConfig, args: StatsArgs) -> anyhow::Result<()> {
    if args.format == StatsFormat::Prometheus {
        init_metrics().context("Failed to initialize metrics")?;
    }

    let queue = connect(config).await?;
    let stats = queue.get_stats().await?;

    match args.format {
        StatsFormat::Text => print!("{}", format_stats(&stats)),
        StatsFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        StatsFormat::Prometheus => print!("{}", export_metrics()),
    }
    Ok(())
}

async fn run_recover_command(config: QueueConfig) -> anyhow::Result<()> {
    let queue = connect(config).await?;
    let recovered = queue.recover_processing().await?;
    println!("✓ Requeued {} task(s)", recovered);
    Ok(())
}

async fn run_purge_command(config: QueueConfig, args: PurgeArgs) -> anyhow::Result<()> {
    if !args.yes {
        return Err(anyhow::anyhow!(
            "Refusing to purge without --yes: all queued tasks would be lost"
        ));
    }

    let queue = connect(config).await?;
    queue.purge().await?;
    println!("✓ Queues purged");
    Ok(())
}

fn format_stats(stats: &QueueStats) -> String {
    format!(
        "=== Queue Stats ===\n\
         Pending:        {}\n\
         Processing:     {}\n\
         Scheduled:      {}\n\
         \n\
         === This Process ===\n\
         Workers active: {}\n\
         Processed:      {}\n\
         Failed:         {} ({:.1}%)\n\
         Retried:        {}\n",
        stats.pending,
        stats.processing,
        stats.scheduled,
        stats.workers_active,
        stats.tasks_processed,
        stats.tasks_failed,
        stats.failure_rate(),
        stats.tasks_retried
    )
}

fn format_result(result: &TaskResult) -> String {
    let mut out = format!(
        "Task:        {}\nStatus:      {}\nRetries:     {}\n",
        result.task_id, result.status, result.retry_count
    );
    if let Some(worker) = &result.worker_id {
        out.push_str(&format!("Worker:      {}\n", worker));
    }
    if let Some(ms) = result.execution_time_ms {
        out.push_str(&format!("Duration:    {}ms\n", ms));
    }
    if let Some(error) = &result.error {
        out.push_str(&format!("Error:       {}\n", error));
    }
    if let Some(value) = &result.result {
        out.push_str(&format!("Result:      {}\n", value));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_enqueue() {
        let cli = Cli::try_parse_from([
            "taskforge",
            "enqueue",
            "echo",
            "--payload",
            r#"{"a":1}"#,
            "--priority",
            "urgent",
            "--max-retries",
            "5",
            "--delay",
            "30",
        ])
        .expect("parse");

        let Commands::Enqueue(args) = cli.command else {
            panic!("expected enqueue command");
        };
        assert_eq!(args.name, "echo");
        assert_eq!(args.priority, TaskPriority::Urgent);

        let options = enqueue_options(&args).expect("options");
        assert_eq!(options.priority, TaskPriority::Urgent);
        assert_eq!(options.max_retries, 5);
        assert!(options.scheduled_at.is_some_and(|at| at > Utc::now()));
    }

    #[test]
    fn test_enqueue_rejects_out_of_range_offsets() {
        for flag in ["--delay", "--expires-in"] {
            for seconds in ["1000000000000000", "18446744073709551615"] {
                let cli = Cli::try_parse_from(["taskforge", "enqueue", "echo", flag, seconds])
                    .expect("parse");
                let Commands::Enqueue(args) = cli.command else {
                    panic!("expected enqueue command");
                };
                let err = enqueue_options(&args).expect_err("out of range");
                assert!(err.to_string().contains(flag), "{}", err);
            }
        }
    }

    #[test]
    fn test_parse_numeric_priority() {
        let cli = Cli::try_parse_from(["taskforge", "enqueue", "echo", "--priority", "2"])
            .expect("parse");
        let Commands::Enqueue(args) = cli.command else {
            panic!("expected enqueue command");
        };
        assert_eq!(args.priority, TaskPriority::High);
    }

    #[test]
    fn test_parse_rejects_unknown_priority() {
        let result = Cli::try_parse_from(["taskforge", "enqueue", "echo", "--priority", "9"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_stats_format_and_globals() {
        let cli = Cli::try_parse_from([
            "taskforge",
            "stats",
            "--format",
            "prometheus",
            "--namespace",
            "grading",
        ])
        .expect("parse");
        assert_eq!(cli.namespace.as_deref(), Some("grading"));
        let Commands::Stats(args) = cli.command else {
            panic!("expected stats command");
        };
        assert_eq!(args.format, StatsFormat::Prometheus);
    }

    #[test]
    fn test_format_stats() {
        let stats = QueueStats {
            pending: 4,
            processing: 1,
            scheduled: 2,
            workers_active: 3,
            tasks_processed: 20,
            tasks_failed: 5,
            tasks_retried: 7,
        };
        let text = format_stats(&stats);
        assert!(text.contains("Pending:        4"));
        assert!(text.contains("Scheduled:      2"));
        assert!(text.contains("Workers active: 3"));
        assert!(text.contains("Processed:      20"));
        assert!(text.contains("Failed:         5 (25.0%)"));
        assert!(text.contains("Retried:        7"));
    }

    #[test]
    fn test_format_result() {
        let id = Uuid::new_v4();
        let result = TaskResult::completed(id, "worker-1", Utc::now(), json!({"ok": true}), 2);
        let text = format_result(&result);
        assert!(text.contains(&id.to_string()));
        assert!(text.contains("completed"));
        assert!(text.contains("Retries:     2"));
        assert!(text.contains("worker-1"));
        assert!(text.contains(r#"{"ok":true}"#));
    }
}

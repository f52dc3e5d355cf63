//! `taskforge` binary.
//!
//! Runs queue workers or a single producer/operator command against a Redis
//! namespace. See `taskforge --help`.

use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Sets up the global subscriber.
///
/// `RUST_LOG` wins when set. Otherwise `--log-level` applies to taskforge's
/// own events and dependencies (redis, tokio) only report warnings.
fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,taskforge={}", log_level)));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = taskforge::cli::parse_cli();
    init_tracing(&cli.log_level);

    debug!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = cli.namespace.as_deref().unwrap_or(""),
        "taskforge starting"
    );

    taskforge::cli::run_with_cli(cli).await
}

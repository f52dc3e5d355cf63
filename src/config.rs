//! Task queue configuration.
//!
//! Configuration covers the broker connection, the key namespace, worker and
//! scheduler timing, broker-side retention, and the retry backoff strategy.
//! It can be built in code with the `with_*` builder methods or loaded from
//! `TASKFORGE_*` environment variables.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// How the delay before a retry grows with the retry count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryBackoff {
    /// Every retry waits the task's `retry_delay`.
    #[default]
    Fixed,
    /// Retry `n` waits `retry_delay * 2^(n-1)`, capped at `max_delay`. The cap
    /// never shortens a wait below `retry_delay` itself.
    Exponential { max_delay: Duration },
}

impl RetryBackoff {
    /// Delay before retry number `retry_count` (1-based) given the task's base delay.
    pub fn delay(&self, base: Duration, retry_count: u32) -> Duration {
        match self {
            RetryBackoff::Fixed => base,
            RetryBackoff::Exponential { max_delay } => {
                let exponent = retry_count.saturating_sub(1).min(31);
                base.checked_mul(1u32 << exponent)
                    .unwrap_or(*max_delay)
                    .min(*max_delay)
                    .max(base)
            }
        }
    }
}

/// Configuration for the task queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    // Broker settings
    /// Redis connection URL.
    pub redis_url: String,
    /// Prefix prepended to every broker key; empty for none.
    pub namespace: String,

    // Worker settings
    /// Number of worker loops.
    pub num_workers: usize,
    /// How long an idle worker sleeps when the ready queue is empty.
    pub poll_interval: Duration,
    /// Sleep after a worker-level broker failure.
    pub error_backoff: Duration,
    /// Upper bound for `stop()`; `None` waits for every in-flight attempt.
    pub shutdown_timeout: Option<Duration>,
    /// Requeue ids left in the processing list when the queue starts.
    pub recover_on_start: bool,

    // Scheduler settings
    /// Interval between scheduler promotion passes.
    pub scheduler_interval: Duration,
    /// Sleep after a failed scheduler pass.
    pub scheduler_error_backoff: Duration,

    // Retention settings
    /// TTL of task blobs for immediately runnable tasks.
    pub task_ttl: Duration,
    /// TTL of task blobs for scheduled tasks and retries.
    pub scheduled_task_ttl: Duration,
    /// TTL of result records.
    pub result_ttl: Duration,

    // Retry settings
    pub retry_backoff: RetryBackoff,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            namespace: String::new(),
            num_workers: 3,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            shutdown_timeout: None,
            recover_on_start: false,
            scheduler_interval: Duration::from_secs(10),
            scheduler_error_backoff: Duration::from_secs(30),
            task_ttl: Duration::from_secs(3600),
            scheduled_task_ttl: Duration::from_secs(86400),
            result_ttl: Duration::from_secs(86400),
            retry_backoff: RetryBackoff::Fixed,
        }
    }
}

impl QueueConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from environment variables.
    ///
    /// Unset variables keep their default value:
    /// - `TASKFORGE_REDIS_URL` (falls back to `REDIS_URL`)
    /// - `TASKFORGE_NAMESPACE`
    /// - `TASKFORGE_WORKERS` (default: 3)
    /// - `TASKFORGE_POLL_INTERVAL_MS` (default: 1000)
    /// - `TASKFORGE_ERROR_BACKOFF_SECS` (default: 5)
    /// - `TASKFORGE_SHUTDOWN_TIMEOUT_SECS` (default: unbounded)
    /// - `TASKFORGE_RECOVER_ON_START` (default: false)
    /// - `TASKFORGE_SCHEDULER_INTERVAL_SECS` (default: 10)
    /// - `TASKFORGE_SCHEDULER_ERROR_BACKOFF_SECS` (default: 30)
    /// - `TASKFORGE_TASK_TTL_SECS` (default: 3600)
    /// - `TASKFORGE_SCHEDULED_TASK_TTL_SECS` (default: 86400)
    /// - `TASKFORGE_RESULT_TTL_SECS` (default: 86400)
    /// - `TASKFORGE_RETRY_BACKOFF`: `fixed` or `exponential` (default: fixed)
    /// - `TASKFORGE_RETRY_MAX_DELAY_SECS` (default: 3600, exponential only)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or the resulting
    /// configuration is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Broker settings
        if let Ok(val) = std::env::var("TASKFORGE_REDIS_URL").or_else(|_| std::env::var("REDIS_URL"))
        {
            config.redis_url = val;
        }

        if let Ok(val) = std::env::var("TASKFORGE_NAMESPACE") {
            config.namespace = val;
        }

        // Worker settings
        if let Ok(val) = std::env::var("TASKFORGE_WORKERS") {
            config.num_workers = parse_env_value(&val, "TASKFORGE_WORKERS")?;
        }

        if let Ok(val) = std::env::var("TASKFORGE_POLL_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "TASKFORGE_POLL_INTERVAL_MS")?;
            config.poll_interval = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("TASKFORGE_ERROR_BACKOFF_SECS") {
            config.error_backoff = parse_env_secs(&val, "TASKFORGE_ERROR_BACKOFF_SECS")?;
        }

        if let Ok(val) = std::env::var("TASKFORGE_SHUTDOWN_TIMEOUT_SECS") {
            config.shutdown_timeout =
                Some(parse_env_secs(&val, "TASKFORGE_SHUTDOWN_TIMEOUT_SECS")?);
        }

        if let Ok(val) = std::env::var("TASKFORGE_RECOVER_ON_START") {
            config.recover_on_start = parse_env_bool(&val, "TASKFORGE_RECOVER_ON_START")?;
        }

        // Scheduler settings
        if let Ok(val) = std::env::var("TASKFORGE_SCHEDULER_INTERVAL_SECS") {
            config.scheduler_interval = parse_env_secs(&val, "TASKFORGE_SCHEDULER_INTERVAL_SECS")?;
        }

        if let Ok(val) = std::env::var("TASKFORGE_SCHEDULER_ERROR_BACKOFF_SECS") {
            config.scheduler_error_backoff =
                parse_env_secs(&val, "TASKFORGE_SCHEDULER_ERROR_BACKOFF_SECS")?;
        }

        // Retention settings
        if let Ok(val) = std::env::var("TASKFORGE_TASK_TTL_SECS") {
            config.task_ttl = parse_env_secs(&val, "TASKFORGE_TASK_TTL_SECS")?;
        }

        if let Ok(val) = std::env::var("TASKFORGE_SCHEDULED_TASK_TTL_SECS") {
            config.scheduled_task_ttl = parse_env_secs(&val, "TASKFORGE_SCHEDULED_TASK_TTL_SECS")?;
        }

        if let Ok(val) = std::env::var("TASKFORGE_RESULT_TTL_SECS") {
            config.result_ttl = parse_env_secs(&val, "TASKFORGE_RESULT_TTL_SECS")?;
        }

        // Retry settings
        if let Ok(val) = std::env::var("TASKFORGE_RETRY_BACKOFF") {
            let max_delay = match std::env::var("TASKFORGE_RETRY_MAX_DELAY_SECS") {
                Ok(max) => parse_env_secs(&max, "TASKFORGE_RETRY_MAX_DELAY_SECS")?,
                Err(_) => Duration::from_secs(3600),
            };
            config.retry_backoff = parse_backoff(&val, max_delay)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.scheduler_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "scheduler_interval must be greater than 0".to_string(),
            ));
        }

        // Redis EX requires whole, positive seconds.
        for (name, ttl) in [
            ("task_ttl", self.task_ttl),
            ("scheduled_task_ttl", self.scheduled_task_ttl),
            ("result_ttl", self.result_ttl),
        ] {
            if ttl.as_secs() == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be at least 1 second",
                    name
                )));
            }
        }

        if let RetryBackoff::Exponential { max_delay } = self.retry_backoff {
            if max_delay.is_zero() {
                return Err(ConfigError::ValidationFailed(
                    "retry max_delay must be greater than 0".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Sets the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Sets the key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the number of worker loops.
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Sets the idle poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the worker error backoff.
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    /// Enables or disables processing-list recovery at start.
    pub fn with_recover_on_start(mut self, recover: bool) -> Self {
        self.recover_on_start = recover;
        self
    }

    /// Sets the scheduler promotion interval.
    pub fn with_scheduler_interval(mut self, interval: Duration) -> Self {
        self.scheduler_interval = interval;
        self
    }

    /// Sets the scheduler error backoff.
    pub fn with_scheduler_error_backoff(mut self, backoff: Duration) -> Self {
        self.scheduler_error_backoff = backoff;
        self
    }

    /// Sets the TTL of immediately runnable task blobs.
    pub fn with_task_ttl(mut self, ttl: Duration) -> Self {
        self.task_ttl = ttl;
        self
    }

    /// Sets the TTL of scheduled task blobs.
    pub fn with_scheduled_task_ttl(mut self, ttl: Duration) -> Self {
        self.scheduled_task_ttl = ttl;
        self
    }

    /// Sets the TTL of result records.
    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    /// Sets the retry backoff strategy.
    pub fn with_retry_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

/// Parse an environment variable value into the requested type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a number of seconds.
fn parse_env_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_env_value::<u64>(value, key).map(Duration::from_secs)
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

/// Parse a backoff strategy name.
pub fn parse_backoff(value: &str, max_delay: Duration) -> Result<RetryBackoff, ConfigError> {
    match value.to_lowercase().as_str() {
        "fixed" | "linear" => Ok(RetryBackoff::Fixed),
        "exponential" => Ok(RetryBackoff::Exponential { max_delay }),
        _ => Err(ConfigError::InvalidValue {
            key: "TASKFORGE_RETRY_BACKOFF".to_string(),
            message: format!("expected 'fixed' or 'exponential', got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert!(config.namespace.is_empty());
        assert_eq!(config.num_workers, 3);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.scheduler_interval, Duration::from_secs(10));
        assert_eq!(config.scheduler_error_backoff, Duration::from_secs(30));
        assert_eq!(config.error_backoff, Duration::from_secs(5));
        assert_eq!(config.task_ttl, Duration::from_secs(3600));
        assert_eq!(config.scheduled_task_ttl, Duration::from_secs(86400));
        assert_eq!(config.result_ttl, Duration::from_secs(86400));
        assert_eq!(config.retry_backoff, RetryBackoff::Fixed);
        assert!(config.shutdown_timeout.is_none());
        assert!(!config.recover_on_start);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = QueueConfig::new()
            .with_redis_url("redis://queue:6380")
            .with_namespace("grading")
            .with_num_workers(8)
            .with_poll_interval(Duration::from_millis(250))
            .with_scheduler_interval(Duration::from_secs(2))
            .with_shutdown_timeout(Duration::from_secs(120))
            .with_recover_on_start(true)
            .with_result_ttl(Duration::from_secs(600))
            .with_retry_backoff(RetryBackoff::Exponential {
                max_delay: Duration::from_secs(900),
            });

        assert_eq!(config.redis_url, "redis://queue:6380");
        assert_eq!(config.namespace, "grading");
        assert_eq!(config.num_workers, 8);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.scheduler_interval, Duration::from_secs(2));
        assert_eq!(config.shutdown_timeout, Some(Duration::from_secs(120)));
        assert!(config.recover_on_start);
        assert_eq!(config.result_ttl, Duration::from_secs(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(QueueConfig::new().with_num_workers(0).validate().is_err());
        assert!(QueueConfig::new().with_redis_url("").validate().is_err());
        assert!(QueueConfig::new()
            .with_poll_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(QueueConfig::new()
            .with_result_ttl(Duration::from_millis(500))
            .validate()
            .is_err());
        assert!(QueueConfig::new()
            .with_retry_backoff(RetryBackoff::Exponential {
                max_delay: Duration::ZERO
            })
            .validate()
            .is_err());
    }

    #[test]
    fn test_fixed_backoff_reuses_base_delay() {
        let backoff = RetryBackoff::Fixed;
        let base = Duration::from_secs(60);
        assert_eq!(backoff.delay(base, 1), base);
        assert_eq!(backoff.delay(base, 5), base);
    }

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let backoff = RetryBackoff::Exponential {
            max_delay: Duration::from_secs(300),
        };
        let base = Duration::from_secs(60);
        assert_eq!(backoff.delay(base, 1), Duration::from_secs(60));
        assert_eq!(backoff.delay(base, 2), Duration::from_secs(120));
        assert_eq!(backoff.delay(base, 3), Duration::from_secs(240));
        assert_eq!(backoff.delay(base, 4), Duration::from_secs(300));
        assert_eq!(backoff.delay(base, 40), Duration::from_secs(300));
    }

    #[test]
    fn test_exponential_backoff_keeps_base_above_cap() {
        let backoff = RetryBackoff::Exponential {
            max_delay: Duration::from_secs(300),
        };
        let base = Duration::from_secs(600);
        assert_eq!(backoff.delay(base, 1), base);
        assert_eq!(backoff.delay(base, 3), base);
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_env_value::<usize>("4", "K").expect("parses"), 4);
        assert!(parse_env_value::<usize>("four", "K").is_err());
        assert_eq!(
            parse_env_secs("30", "K").expect("parses"),
            Duration::from_secs(30)
        );
        assert!(parse_env_bool("yes", "K").expect("parses"));
        assert!(!parse_env_bool("off", "K").expect("parses"));
        assert!(parse_env_bool("maybe", "K").is_err());

        let max = Duration::from_secs(60);
        assert_eq!(parse_backoff("fixed", max).expect("parses"), RetryBackoff::Fixed);
        assert_eq!(
            parse_backoff("Exponential", max).expect("parses"),
            RetryBackoff::Exponential { max_delay: max }
        );
        assert!(parse_backoff("random", max).is_err());
    }
}

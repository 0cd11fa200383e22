//! Environment-driven configuration
//!
//! Every recognised option is enumerated here with its default. Sections are
//! plain structs with builder methods; `Config::from_env()` reads the
//! `MAHAVISHNU_*` environment (after loading `.env` via dotenvy) and falls
//! back to defaults for anything unset.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Concurrency limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConcurrencyConfig {
    /// Maximum workflows in flight at once
    pub max_concurrent_workflows: usize,

    /// Worker cap applied per pool
    pub max_concurrent_workers_per_pool: usize,

    /// Bounded wait before admission fails with `Exhausted`
    #[serde(with = "duration_millis")]
    pub admission_wait: Duration,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 100,
            max_concurrent_workers_per_pool: 16,
            admission_wait: Duration::from_secs(2),
        }
    }
}

/// Deadline defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadlineConfig {
    /// Applied when a submission carries no explicit deadline
    #[serde(with = "duration_millis")]
    pub default_task_timeout: Duration,

    /// Missing heartbeats for this long marks a worker crashed
    #[serde(with = "duration_millis")]
    pub worker_heartbeat_timeout: Duration,

    /// Cooperative-cancel window before force kill
    #[serde(with = "duration_millis")]
    pub cancel_grace_period: Duration,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            default_task_timeout: Duration::from_secs(300),
            worker_heartbeat_timeout: Duration::from_secs(300),
            cancel_grace_period: Duration::from_secs(5),
        }
    }
}

/// Raw circuit breaker settings (per-breaker defaults)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerSettings {
    /// Rolling-window failure count that opens the breaker
    pub threshold: u32,

    /// Consecutive failures that open the breaker regardless of the window
    pub consecutive_threshold: u32,

    /// Rolling window size
    #[serde(with = "duration_millis")]
    pub window: Duration,

    /// Time spent open before admitting a probe
    #[serde(with = "duration_millis")]
    pub cooldown: Duration,

    /// Cap for the doubling cooldown
    #[serde(with = "duration_millis")]
    pub max_cooldown: Duration,

    /// Consecutive half-open successes required to close
    pub success_threshold: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            threshold: 5,
            consecutive_threshold: 3,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
            success_threshold: 1,
        }
    }
}

/// Raw retry settings (per-step defaults)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySettings {
    /// Maximum attempts including the initial one
    pub max_attempts: u32,

    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Checkpoint storage settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Directory for the filesystem checkpoint store
    pub checkpoint_store_path: PathBuf,

    /// Blobs above this size are rejected with `Invalid`
    pub checkpoint_max_size_bytes: usize,

    /// Retention for checkpoints of failed/cancelled workflows
    pub checkpoint_retention_on_failure_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            checkpoint_store_path: PathBuf::from("./data/checkpoints"),
            checkpoint_max_size_bytes: 4 * 1024 * 1024,
            checkpoint_retention_on_failure_days: 7,
        }
    }
}

/// Health supervisor settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthConfig {
    /// Liveness fails above this memory usage
    pub memory_threshold_percent: u8,

    /// Liveness fails when more workflows than this look stuck
    pub stuck_workflow_threshold_count: usize,

    /// Sticky window for the degraded component state
    #[serde(with = "duration_millis")]
    pub degraded_cooldown: Duration,

    /// No scheduler progress signal for this long marks the scheduler wedged
    #[serde(with = "duration_millis")]
    pub scheduler_progress_timeout: Duration,

    /// A running workflow older than this counts towards stuck detection
    #[serde(with = "duration_millis")]
    pub stuck_workflow_age: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            memory_threshold_percent: 90,
            stuck_workflow_threshold_count: 50,
            degraded_cooldown: Duration::from_secs(30),
            scheduler_progress_timeout: Duration::from_secs(60),
            stuck_workflow_age: Duration::from_secs(600),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    pub concurrency: ConcurrencyConfig,
    pub deadlines: DeadlineConfig,
    pub breaker: BreakerSettings,
    pub retry: RetrySettings,
    pub storage: StorageConfig,
    pub health: HealthConfig,

    /// Opaque secret material, consumed by the external auth collaborator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_secret: Option<String>,

    /// PostgreSQL connection string for the durable stores
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// Server bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Config {
    /// Load configuration from the environment
    ///
    /// Loads `.env` first (ignored when absent), then reads `MAHAVISHNU_*`
    /// variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self {
            bind_addr: env::var("MAHAVISHNU_BIND_ADDR").unwrap_or_else(|_| default_bind_addr()),
            auth_secret: env::var("MAHAVISHNU_AUTH_SECRET").ok(),
            database_url: env::var("DATABASE_URL").ok(),
            ..Default::default()
        };

        if let Some(v) = parse_var::<usize>("MAHAVISHNU_MAX_CONCURRENT_WORKFLOWS")? {
            config.concurrency.max_concurrent_workflows = v;
        }
        if let Some(v) = parse_var::<usize>("MAHAVISHNU_MAX_CONCURRENT_WORKERS_PER_POOL")? {
            config.concurrency.max_concurrent_workers_per_pool = v;
        }
        if let Some(v) = parse_var::<u64>("MAHAVISHNU_ADMISSION_WAIT_MS")? {
            config.concurrency.admission_wait = Duration::from_millis(v);
        }

        if let Some(v) = parse_var::<u64>("MAHAVISHNU_DEFAULT_TASK_TIMEOUT_S")? {
            config.deadlines.default_task_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u64>("MAHAVISHNU_WORKER_HEARTBEAT_TIMEOUT_S")? {
            config.deadlines.worker_heartbeat_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u64>("MAHAVISHNU_CANCEL_GRACE_PERIOD_S")? {
            config.deadlines.cancel_grace_period = Duration::from_secs(v);
        }

        if let Some(v) = parse_var::<u32>("MAHAVISHNU_BREAKER_THRESHOLD")? {
            config.breaker.threshold = v;
        }
        if let Some(v) = parse_var::<u32>("MAHAVISHNU_BREAKER_CONSECUTIVE_THRESHOLD")? {
            config.breaker.consecutive_threshold = v;
        }
        if let Some(v) = parse_var::<u64>("MAHAVISHNU_BREAKER_COOLDOWN_S")? {
            config.breaker.cooldown = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u64>("MAHAVISHNU_BREAKER_MAX_COOLDOWN_S")? {
            config.breaker.max_cooldown = Duration::from_secs(v);
        }

        if let Some(v) = parse_var::<u32>("MAHAVISHNU_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = v;
        }
        if let Some(v) = parse_var::<u64>("MAHAVISHNU_RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<u64>("MAHAVISHNU_RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<f64>("MAHAVISHNU_RETRY_MULTIPLIER")? {
            config.retry.multiplier = v;
        }

        if let Ok(v) = env::var("MAHAVISHNU_CHECKPOINT_STORE_PATH") {
            config.storage.checkpoint_store_path = PathBuf::from(v);
        }
        if let Some(v) = parse_var::<usize>("MAHAVISHNU_CHECKPOINT_MAX_SIZE_BYTES")? {
            config.storage.checkpoint_max_size_bytes = v;
        }
        if let Some(v) = parse_var::<u32>("MAHAVISHNU_CHECKPOINT_RETENTION_ON_FAILURE_DAYS")? {
            config.storage.checkpoint_retention_on_failure_days = v;
        }

        if let Some(v) = parse_var::<u8>("MAHAVISHNU_MEMORY_THRESHOLD_PERCENT")? {
            config.health.memory_threshold_percent = v;
        }
        if let Some(v) = parse_var::<usize>("MAHAVISHNU_STUCK_WORKFLOW_THRESHOLD_COUNT")? {
            config.health.stuck_workflow_threshold_count = v;
        }
        if let Some(v) = parse_var::<u64>("MAHAVISHNU_DEGRADED_COOLDOWN_S")? {
            config.health.degraded_cooldown = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u64>("MAHAVISHNU_STUCK_WORKFLOW_AGE_S")? {
            config.health.stuck_workflow_age = Duration::from_secs(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.concurrency.max_concurrent_workflows == 0 {
            return Err(Error::invalid("max_concurrent_workflows must be positive"));
        }
        if self.concurrency.max_concurrent_workers_per_pool == 0 {
            return Err(Error::invalid(
                "max_concurrent_workers_per_pool must be positive",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::invalid("retry max_attempts must be positive"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(Error::invalid("retry multiplier must be at least 1.0")
                .with_context("multiplier", self.retry.multiplier));
        }
        if self.breaker.cooldown > self.breaker.max_cooldown {
            return Err(Error::invalid(
                "breaker cooldown must not exceed max_cooldown",
            ));
        }
        if self.storage.checkpoint_max_size_bytes == 0 {
            return Err(Error::invalid("checkpoint_max_size_bytes must be positive"));
        }
        if self.health.memory_threshold_percent > 100 {
            return Err(Error::invalid(
                "memory_threshold_percent must be at most 100",
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            Error::invalid(format!("cannot parse environment variable {name}"))
                .with_context("value", raw)
        }),
        Err(_) => Ok(None),
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.concurrency.max_concurrent_workflows, 100);
        assert_eq!(config.concurrency.admission_wait, Duration::from_secs(2));
        assert_eq!(config.breaker.threshold, 5);
        assert_eq!(config.breaker.consecutive_threshold, 3);
        assert_eq!(config.breaker.cooldown, Duration::from_secs(30));
        assert_eq!(config.breaker.max_cooldown, Duration::from_secs(300));
        assert_eq!(config.retry.multiplier, 2.0);
        assert_eq!(config.storage.checkpoint_max_size_bytes, 4 * 1024 * 1024);
        assert_eq!(config.deadlines.cancel_grace_period, Duration::from_secs(5));
    }

    #[test]
    fn test_validation_rejects_zero_workflows() {
        let mut config = Config::default();
        config.concurrency.max_concurrent_workflows = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_cooldown_above_cap() {
        let mut config = Config::default();
        config.breaker.cooldown = Duration::from_secs(600);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }
}

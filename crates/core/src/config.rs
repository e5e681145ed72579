//! Engine configuration.
//!
//! Loaded once at process start from a TOML (or JSON) file, then adjusted
//! from `CONDUCTOR_*` environment variables. Every field has a default so an
//! empty file is a valid configuration.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::result::Result;
use crate::task_type::TaskType;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// Worker pools and step parallelism.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Bounded waits on external conditions.
    #[serde(default)]
    pub wait: WaitConfig,

    /// Backup scheduling.
    #[serde(default)]
    pub backup: BackupConfig,
}

/// Worker pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Pool size for task types without an explicit entry.
    #[serde(default = "default_pool_size")]
    pub default_pool_size: usize,

    /// Per task type pool sizes, keyed by task type name.
    #[serde(default)]
    pub pool_sizes: BTreeMap<String, usize>,

    /// Maximum steps of one group running at the same time.
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_pool_size: default_pool_size(),
            pool_sizes: BTreeMap::new(),
            max_parallel_steps: default_max_parallel_steps(),
        }
    }
}

impl ExecutorConfig {
    /// Pool size for a task type, never zero.
    #[must_use]
    pub fn pool_size(&self, task_type: TaskType) -> usize {
        self.pool_sizes
            .get(task_type.as_str())
            .copied()
            .unwrap_or(self.default_pool_size)
            .max(1)
    }
}

/// Polling parameters for waits on external conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitConfig {
    /// Delay between two polls.
    #[serde(with = "duration_ms", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Overall deadline of a single wait.
    #[serde(with = "duration_ms", default = "default_wait_timeout")]
    pub timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            timeout: default_wait_timeout(),
        }
    }
}

/// Backup scheduling switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Whether scheduled backups are submitted at all.
    #[serde(default = "default_true")]
    pub scheduled_enabled: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            scheduled_enabled: true,
        }
    }
}

impl ConductorConfig {
    /// Load configuration from a file. `.json` files are parsed as JSON,
    /// everything else as TOML.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;

        if path.extension().is_some_and(|e| e == "json") {
            Ok(serde_json::from_str(&content)?)
        } else {
            Self::from_toml(&content)
        }
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(format!("failed to parse config: {e}")))
    }

    /// Apply `CONDUCTOR_*` environment overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(size) = env_parse::<usize>("CONDUCTOR_DEFAULT_POOL_SIZE") {
            self.executor.default_pool_size = size;
        }
        if let Some(steps) = env_parse::<usize>("CONDUCTOR_MAX_PARALLEL_STEPS") {
            self.executor.max_parallel_steps = steps;
        }
        if let Some(ms) = env_parse::<u64>("CONDUCTOR_WAIT_POLL_MS") {
            self.wait.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("CONDUCTOR_WAIT_TIMEOUT_MS") {
            self.wait.timeout = Duration::from_millis(ms);
        }
        self
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = self
            .executor
            .pool_sizes
            .keys()
            .find(|name| name.parse::<TaskType>().is_err())
        {
            return Err(Error::config(format!("pool size given for unknown task type '{name}'")));
        }
        if self.wait.poll_interval.is_zero() {
            return Err(Error::config("wait.poll_interval must be positive"));
        }
        if self.wait.timeout < self.wait.poll_interval {
            return Err(Error::config("wait.timeout must not be shorter than wait.poll_interval"));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

const fn default_pool_size() -> usize {
    8
}

const fn default_max_parallel_steps() -> usize {
    16
}

const fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

const fn default_wait_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}

const fn default_true() -> bool {
    true
}

/// Serialization helper for Duration as milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

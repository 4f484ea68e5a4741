//! Configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::budget::BudgetConfig;
use crate::planner::PlannerConfig;
use crate::pool::PoolConfig;
use crate::retry::RetryPolicy;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Pool size (1..=32)
    pub max_workers: usize,

    /// Per-invocation wall clock in seconds
    pub worker_timeout_secs: u64,

    /// Shutdown grace period in seconds
    pub shutdown_grace_secs: u64,

    /// Review rounds after the frontier drains
    pub review_depth: u32,

    /// Retry policy
    pub retry: RetryConfig,

    /// Circuit breaker tuning
    pub breaker: BreakerConfig,

    /// Token budget
    pub budget: BudgetConfig,

    /// Checkpoint store
    pub checkpoint: CheckpointConfig,

    /// Task store
    pub store: StoreConfig,

    /// External tool
    pub tool: ToolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: 3,
            worker_timeout_secs: 1800,
            shutdown_grace_secs: 30,
            review_depth: 3,
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            budget: BudgetConfig::default(),
            checkpoint: CheckpointConfig::default(),
            store: StoreConfig::default(),
            tool: ToolConfig::default(),
        }
    }
}

/// Retry tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 2,
            max_delay_secs: 60,
        }
    }
}

/// Circuit breaker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub open_cooldown_secs: u64,
    pub max_cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_cooldown_secs: 60,
            max_cooldown_secs: 600,
        }
    }
}

/// Checkpoint store tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CheckpointConfig {
    /// Root directory for checkpoint partitions
    pub root: PathBuf,
    /// Garbage-collect completed/failed checkpoints older than this
    pub max_age_days: u32,
    /// A running task's checkpoint older than this is not trustworthy
    pub stale_threshold_hours: u32,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".taskpilot/checkpoints"),
            max_age_days: 30,
            stale_threshold_hours: 24,
        }
    }
}

/// Task store location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StoreConfig {
    /// Directory holding tasks.json and the budget snapshot
    pub dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".taskpilot"),
        }
    }
}

/// External tool invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ToolConfig {
    /// Command to spawn per invocation
    pub command: String,

    /// Environment variable containing the API key
    pub api_key_env: String,

    /// Working directory handed to the tool
    pub workdir: PathBuf,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            workdir: PathBuf::from("."),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .taskpilot.yml
        let local_config = PathBuf::from(".taskpilot.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/taskpilot/taskpilot.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("taskpilot").join("taskpilot.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Reject out-of-range values before anything starts
    pub fn validate(&self) -> Result<()> {
        if !(1..=32).contains(&self.max_workers) {
            eyre::bail!("max-workers must be between 1 and 32, got {}", self.max_workers);
        }
        if self.worker_timeout_secs == 0 {
            eyre::bail!("worker-timeout-secs must be positive");
        }
        if self.shutdown_grace_secs == 0 {
            eyre::bail!("shutdown-grace-secs must be positive");
        }
        if self.budget.warning_threshold > 100 {
            eyre::bail!(
                "budget.warning-threshold must be between 0 and 100, got {}",
                self.budget.warning_threshold
            );
        }
        if self.retry.base_delay_secs > self.retry.max_delay_secs {
            eyre::bail!("retry.base-delay-secs must not exceed retry.max-delay-secs");
        }
        if self.breaker.failure_threshold == 0 {
            eyre::bail!("breaker.failure-threshold must be positive");
        }
        if self.breaker.open_cooldown_secs > self.breaker.max_cooldown_secs {
            eyre::bail!("breaker.open-cooldown-secs must not exceed breaker.max-cooldown-secs");
        }
        if self.tool.command.trim().is_empty() {
            eyre::bail!("tool.command must not be empty");
        }
        if self.tool.api_key_env.trim().is_empty() {
            eyre::bail!("tool.api-key-env must not be empty");
        }
        Ok(())
    }

    /// Pool view of this configuration
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_workers: self.max_workers,
            worker_timeout: Duration::from_secs(self.worker_timeout_secs),
            workdir: self.tool.workdir.clone(),
            failure_threshold: self.breaker.failure_threshold,
            open_cooldown: Duration::from_secs(self.breaker.open_cooldown_secs),
            max_cooldown: Duration::from_secs(self.breaker.max_cooldown_secs),
        }
    }

    /// Planner view of this configuration
    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            retry: self.retry_policy(),
            review_depth: self.review_depth,
            worker_timeout: Duration::from_secs(self.worker_timeout_secs),
            workdir: self.tool.workdir.clone(),
        }
    }

    /// Retry policy view of this configuration
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_secs(self.retry.base_delay_secs),
            max_delay: Duration::from_secs(self.retry.max_delay_secs),
        }
    }

    /// Stale threshold in milliseconds
    pub fn stale_threshold_ms(&self) -> i64 {
        self.checkpoint.stale_threshold_hours as i64 * 60 * 60 * 1000
    }

    /// Checkpoint maximum age in milliseconds
    pub fn checkpoint_max_age_ms(&self) -> i64 {
        self.checkpoint.max_age_days as i64 * 24 * 60 * 60 * 1000
    }
}

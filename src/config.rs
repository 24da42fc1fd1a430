//! Configuration management for ratelock.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RateLockError, Result};
use crate::ratelimit::AdjustError;

/// Main configuration for ratelock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLockConfig {
    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Adaptive control loop configuration
    #[serde(default)]
    pub control: ControlConfig,

    /// Contention driver configuration
    #[serde(default)]
    pub driver: DriverConfig,
}

/// Initial state of a rate limited lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Tokens available at construction
    #[serde(default = "default_initial_tokens")]
    pub initial_tokens: u64,

    /// Token capacity
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,

    /// Refill interval in milliseconds
    #[serde(default = "default_wait_limit_ms")]
    pub wait_limit_ms: u64,

    /// Adjustment unit in milliseconds
    #[serde(default = "default_unit_ms")]
    pub unit_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            initial_tokens: default_initial_tokens(),
            max_tokens: default_max_tokens(),
            wait_limit_ms: default_wait_limit_ms(),
            unit_ms: default_unit_ms(),
        }
    }
}

impl LimiterConfig {
    pub fn wait_limit(&self) -> Duration {
        Duration::from_millis(self.wait_limit_ms)
    }

    pub fn unit(&self) -> Duration {
        Duration::from_millis(self.unit_ms)
    }

    /// Check the limiter can be built and adjusted with these settings.
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(RateLockError::Config(
                "limiter.max_tokens must be at least 1".to_string(),
            ));
        }
        if self.initial_tokens > self.max_tokens {
            return Err(RateLockError::Config(format!(
                "limiter.initial_tokens ({}) exceeds limiter.max_tokens ({})",
                self.initial_tokens, self.max_tokens
            )));
        }
        if self.unit_ms == 0 {
            return Err(AdjustError::UnitTooSmall { unit: self.unit() }.into());
        }
        Ok(())
    }
}

fn default_initial_tokens() -> u64 {
    3
}

fn default_max_tokens() -> u64 {
    5
}

fn default_wait_limit_ms() -> u64 {
    100
}

fn default_unit_ms() -> u64 {
    1000
}

/// Adaptive control loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Whether the control loop runs at all
    #[serde(default = "default_control_enabled")]
    pub enabled: bool,

    /// How often to sample contention, in milliseconds
    #[serde(default = "default_control_interval_ms")]
    pub interval_ms: u64,

    /// Waiting callers at or above which the limiter is slowed down
    #[serde(default = "default_pressure_threshold")]
    pub pressure_threshold: usize,

    /// Ceiling the control loop never raises the wait limit past, in milliseconds
    #[serde(default = "default_max_wait_limit_ms")]
    pub max_wait_limit_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: default_control_enabled(),
            interval_ms: default_control_interval_ms(),
            pressure_threshold: default_pressure_threshold(),
            max_wait_limit_ms: default_max_wait_limit_ms(),
        }
    }
}

impl ControlConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_wait_limit(&self) -> Duration {
        Duration::from_millis(self.max_wait_limit_ms)
    }
}

fn default_control_enabled() -> bool {
    true
}

fn default_control_interval_ms() -> u64 {
    250
}

fn default_pressure_threshold() -> usize {
    2
}

fn default_max_wait_limit_ms() -> u64 {
    1000
}

/// Contention driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Number of worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Acquire/release pairs per worker
    #[serde(default = "default_iterations")]
    pub iterations: usize,

    /// Token cost used by odd-numbered workers
    #[serde(default = "default_cost")]
    pub cost: u64,

    /// Upper bound on the random time a worker holds the lock, in milliseconds
    #[serde(default)]
    pub hold_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            iterations: default_iterations(),
            cost: default_cost(),
            hold_ms: 0,
        }
    }
}

fn default_workers() -> usize {
    10
}

fn default_iterations() -> usize {
    1
}

fn default_cost() -> u64 {
    2
}

impl RateLockConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RateLockConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RateLockError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.limiter.validate()?;
        if self.control.enabled && self.control.interval_ms == 0 {
            return Err(RateLockError::Config(
                "control.interval_ms must be positive when control is enabled".to_string(),
            ));
        }
        if self.control.enabled
            && self.control.max_wait_limit_ms < self.limiter.wait_limit_ms.max(1)
        {
            return Err(RateLockError::Config(format!(
                "control.max_wait_limit_ms ({}) must be positive and at least limiter.wait_limit_ms ({})",
                self.control.max_wait_limit_ms, self.limiter.wait_limit_ms
            )));
        }
        Ok(())
    }
}

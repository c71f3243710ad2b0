/// Configuration for the resilience service
///
/// Values come from, in increasing priority: built-in defaults, an optional
/// TOML file, then `WAYPOINT_RESILIENCE__*` environment variables
/// (e.g. `WAYPOINT_RESILIENCE__RETRY__MAX_RETRIES=5`).
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "WAYPOINT_RESILIENCE";

/// File name looked up in the platform config directory
pub const CONFIG_FILE_NAME: &str = "resilience.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Default retry policy used when callers do not supply their own
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Per-attempt timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker thresholds, shared by every resource key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Time spent Open before probing
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
    /// Probes admitted in HalfOpen, and successes needed to close
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_requests: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Reports kept by the dispatcher
    pub history_capacity: usize,
    /// Log Low-severity errors
    pub development_mode: bool,
    pub retry: RetryPolicyConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Period of the deferred retry scan
    #[serde(with = "humantime_serde")]
    pub queue_scan_interval: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            development_mode: false,
            retry: RetryPolicyConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            queue_scan_interval: Duration::from_secs(1),
        }
    }
}

impl ResilienceConfig {
    /// Load from the default file location plus environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::default_path().as_deref())
    }

    /// Load from an explicit file (optional) plus environment
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            tracing::debug!(path = %path.display(), "Loading resilience configuration");
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let config: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// `resilience.toml` in the platform config directory
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "waypoint", "waypoint-resilience")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Reject values the service cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid(
                "history_capacity must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_factor < 1.0 || !self.retry.backoff_factor.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "retry.backoff_factor must be >= 1.0, got {}",
                self.retry.backoff_factor
            )));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(ConfigError::Invalid(
                "retry.initial_delay must not exceed retry.max_delay".to_string(),
            ));
        }
        if self.retry.timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "retry.timeout must be greater than zero".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker.half_open_requests == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.half_open_requests must be at least 1".to_string(),
            ));
        }
        if self.queue_scan_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "queue_scan_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

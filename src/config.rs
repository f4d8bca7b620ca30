//! Harness configuration.
//!
//! Holds platform-wide ceilings that every bundle is validated against,
//! the isolation backend to use, output locations, and concurrency knobs.
//! Values come from defaults, `HARNESS_*` environment variables, and CLI
//! flags (in increasing order of precedence).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
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

/// Which isolation mechanism provisions runtime contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// One Docker container per run (via the Docker Engine API).
    Docker,
    /// One scratch directory plus process group per run on the host.
    Local,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Docker => write!(f, "docker"),
            BackendKind::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(BackendKind::Docker),
            "local" | "process" => Ok(BackendKind::Local),
            other => Err(format!("Unknown backend: {}", other)),
        }
    }
}

/// Platform-wide ceilings. A bundle asking for more than these is invalid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformLimits {
    /// Maximum CPU cores a single run may request.
    pub max_cpus: f64,
    /// Maximum memory per run in megabytes.
    pub max_memory_mb: u64,
    /// Maximum storage per run in megabytes.
    pub max_storage_mb: u64,
    /// Maximum value for any single stage timeout.
    pub max_timeout_secs: u64,
}

impl Default for PlatformLimits {
    fn default() -> Self {
        Self {
            max_cpus: 16.0,
            max_memory_mb: 65_536,
            max_storage_mb: 204_800,
            max_timeout_secs: 4 * 60 * 60,
        }
    }
}

/// Configuration for the harness.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Directory that receives one sub-directory per run.
    pub output_dir: PathBuf,
    /// Isolation backend.
    pub backend: BackendKind,
    /// Ceilings applied by the bundle loader.
    pub limits: PlatformLimits,
    /// Maximum number of runs executing at once in a batch.
    pub parallel: usize,
    /// Capacity of the trace channel before events are dropped.
    pub trace_buffer: usize,
    /// Interval between resource samples while a context is alive.
    pub sample_interval: Duration,
    /// Network mode for contexts that do not declare one. Anything but
    /// `host` gives each container its own network namespace.
    pub network_mode: String,
    /// Apply the bundle storage ceiling to the container root filesystem.
    /// Requires a storage driver with quota support (overlay2 on xfs).
    pub enforce_storage_quota: bool,
    /// Keep contexts alive after the run (debugging only).
    pub keep_contexts: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./harness-runs"),
            backend: BackendKind::Docker,
            limits: PlatformLimits::default(),
            parallel: 1,
            trace_buffer: 1024,
            sample_interval: Duration::from_secs(5),
            network_mode: "bridge".to_string(),
            enforce_storage_quota: false,
            keep_contexts: false,
        }
    }
}

impl HarnessConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration from `HARNESS_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("HARNESS_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("HARNESS_BACKEND") {
            config.backend = val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "HARNESS_BACKEND".to_string(),
                message,
            })?;
        }
        if let Ok(val) = std::env::var("HARNESS_PARALLEL") {
            config.parallel = parse_env_value(&val, "HARNESS_PARALLEL")?;
        }
        if let Ok(val) = std::env::var("HARNESS_TRACE_BUFFER") {
            config.trace_buffer = parse_env_value(&val, "HARNESS_TRACE_BUFFER")?;
        }
        if let Ok(val) = std::env::var("HARNESS_SAMPLE_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "HARNESS_SAMPLE_INTERVAL_MS")?;
            config.sample_interval = Duration::from_millis(ms);
        }
        if let Ok(val) = std::env::var("HARNESS_NETWORK_MODE") {
            config.network_mode = val;
        }
        if let Ok(val) = std::env::var("HARNESS_ENFORCE_STORAGE_QUOTA") {
            config.enforce_storage_quota = parse_env_bool(&val, "HARNESS_ENFORCE_STORAGE_QUOTA")?;
        }
        if let Ok(val) = std::env::var("HARNESS_MAX_CPUS") {
            config.limits.max_cpus = parse_env_value(&val, "HARNESS_MAX_CPUS")?;
        }
        if let Ok(val) = std::env::var("HARNESS_MAX_MEMORY_MB") {
            config.limits.max_memory_mb = parse_env_value(&val, "HARNESS_MAX_MEMORY_MB")?;
        }
        if let Ok(val) = std::env::var("HARNESS_MAX_STORAGE_MB") {
            config.limits.max_storage_mb = parse_env_value(&val, "HARNESS_MAX_STORAGE_MB")?;
        }
        if let Ok(val) = std::env::var("HARNESS_MAX_TIMEOUT_SECS") {
            config.limits.max_timeout_secs = parse_env_value(&val, "HARNESS_MAX_TIMEOUT_SECS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallel == 0 {
            return Err(ConfigError::ValidationFailed(
                "parallel must be at least 1".to_string(),
            ));
        }
        if self.trace_buffer == 0 {
            return Err(ConfigError::ValidationFailed(
                "trace_buffer must be at least 1".to_string(),
            ));
        }
        if self.sample_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "sample_interval must be positive".to_string(),
            ));
        }
        if !(self.limits.max_cpus.is_finite() && self.limits.max_cpus > 0.0) {
            return Err(ConfigError::ValidationFailed(
                "max_cpus must be a positive number".to_string(),
            ));
        }
        if self.limits.max_memory_mb == 0
            || self.limits.max_storage_mb == 0
            || self.limits.max_timeout_secs == 0
        {
            return Err(ConfigError::ValidationFailed(
                "platform ceilings must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_limits(mut self, limits: PlatformLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_trace_buffer(mut self, capacity: usize) -> Self {
        self.trace_buffer = capacity;
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = mode.into();
        self
    }

    pub fn with_keep_contexts(mut self, keep: bool) -> Self {
        self.keep_contexts = keep;
        self
    }
}

fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("cannot parse '{}'", value),
    })
}

fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{}'", value),
        }),
    }
}

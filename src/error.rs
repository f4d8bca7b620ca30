//! Error types for harness operations.
//!
//! Defines error types for every stage of a run:
//! - Bundle loading and validation
//! - Docker container management
//! - Environment builds
//! - Service readiness
//! - Reward persistence
//! - Run orchestration

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single problem found while validating a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Dotted path of the offending field (e.g. `timeouts.build_sec`).
    pub field: String,
    /// What is wrong with it.
    pub reason: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur while loading a task bundle.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("Invalid bundle '{bundle}' ({} violation(s)): {}", .violations.len(), join_violations(.violations))]
    Invalid {
        bundle: String,
        violations: Vec<Violation>,
    },

    #[error("Bundle not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BundleError {
    /// Returns every violation carried by this error.
    pub fn violations(&self) -> &[Violation] {
        match self {
            BundleError::Invalid { violations, .. } => violations,
            _ => &[],
        }
    }
}

/// Errors that can occur during Docker operations.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Docker build failed: {0}")]
    BuildFailed(String),

    #[error("Docker run failed: {0}")]
    RunFailed(String),

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },

    #[error("Failed to copy files to container: {0}")]
    CopyFailed(String),

    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by an isolation backend while running commands or moving files.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Environment '{0}' already torn down")]
    TornDown(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal outcome of a failed build. Cloneable so that every caller
/// waiting on a shared build observes the same error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("Build failed: {diagnostic}")]
    Failed { diagnostic: String },

    #[error("Build timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Failed to start environment: {0}")]
    StartFailed(String),
}

/// Errors from the readiness prober.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadinessError {
    #[error("Readiness deadline of {}s elapsed; not ready: {}", .deadline.as_secs(), .pending.join(", "))]
    Timeout {
        deadline: Duration,
        pending: Vec<String>,
    },
}

/// Errors from reward persistence.
#[derive(Debug, Error)]
pub enum RewardError {
    #[error("Reward for run '{0}' already persisted")]
    AlreadyPersisted(String),

    #[error("Failed to persist reward: {0}")]
    Persist(String),

    #[error("Invalid run id '{0}': use letters, digits, '.', '_' or '-', starting with a letter or digit")]
    InvalidRunId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by the harness to its callers. Stage failures are not
/// errors: they become terminal statuses with a persisted reward.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error("Invalid state transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },

    #[error("Bundle '{0}' has no reference solution")]
    MissingSolution(String),

    #[error("Backend unavailable: {0}")]
    Backend(String),

    #[error(transparent)]
    Reward(#[from] RewardError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

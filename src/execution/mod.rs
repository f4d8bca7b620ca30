//! Isolation backends.
//!
//! A [`Backend`] builds environments and creates one live [`Environment`]
//! (the run's runtime context) per run. Two backends ship with the crate:
//!
//! - [`DockerBackend`]: one container per run through the Docker Engine API.
//! - [`LocalBackend`]: one scratch directory, service port and set of
//!   pinned process groups per run.
//!
//! # Lifecycle
//!
//! ```text
//! build (shared, per bundle identity) → create (per run) → exec* → teardown
//! ```

pub mod container;
pub mod docker_client;
pub mod local;
pub mod ports;
pub mod resources;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bundle::{BuildKey, TaskBundle};
use crate::error::{BuildError, EnvironmentError};
use crate::trace::TraceHandle;

pub use container::DockerBackend;
pub use docker_client::DockerClient;
pub use local::LocalBackend;
pub use ports::{expand_port, PortLease, PORT_VAR};
pub use resources::ExecutionLimits;

/// Options for a single command execution.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Hard deadline; the command is killed when it elapses.
    pub timeout: Duration,
    /// Working directory inside the context; defaults to the bundle workdir.
    pub workdir: Option<String>,
    /// Extra environment variables (`KEY=VALUE`).
    pub env: Vec<String>,
}

impl ExecOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            workdir: None,
            env: Vec::new(),
        }
    }

    pub fn with_workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push(format!("{key}={value}"));
        self
    }
}

/// Result of executing a command in a context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecResult {
    /// Exit code of the command (`-1` when killed or unknown).
    pub exit_code: i64,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// The command was killed because its deadline elapsed.
    pub timed_out: bool,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// True for the names a context uses to address itself.
pub fn is_loopback(host: &str) -> bool {
    matches!(
        host.trim_start_matches('[').trim_end_matches(']'),
        "localhost" | "127.0.0.1" | "0.0.0.0" | "::1"
    )
}

/// A point-in-time resource reading of a context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: Option<f64>,
    pub memory_bytes: Option<u64>,
}

/// Output of a successful build, shared by every run of the same identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltEnvironment {
    pub key: BuildKey,
    pub artifact: BuildArtifact,
    pub duration_ms: u64,
}

/// What a build produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildArtifact {
    /// A Docker image reference.
    Image(String),
    /// A prepared directory that each run copies.
    Directory(PathBuf),
}

/// One live, isolated runtime context. Exclusively owned by the run that
/// created it; `teardown` releases everything it holds and is idempotent.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Backend-specific identifier (container id, scratch directory).
    fn id(&self) -> &str;

    /// Runs `command` through `bash -c`.
    async fn exec(
        &self,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecResult, EnvironmentError>;

    /// Copies a host directory to `target` inside the context.
    async fn upload_dir(&self, host_dir: &Path, target: &str) -> Result<(), EnvironmentError>;

    /// Path under which commands running in the context see `path`.
    fn resolve_path(&self, path: &str) -> String {
        path.to_string()
    }

    /// Port leased for the context's service, exported as `FORGE_PORT`.
    fn service_port(&self) -> Option<u16> {
        None
    }

    /// Address the harness dials to reach `host` as seen from inside the
    /// context.
    fn dial_host(&self, host: &str) -> String {
        host.to_string()
    }

    /// Reads a file inside the context; `Ok(None)` when it does not exist.
    async fn read_file(&self, path: &str) -> Result<Option<String>, EnvironmentError>;

    /// Best-effort resource reading.
    async fn sample_resources(&self) -> Option<ResourceSample>;

    /// Stops every process and releases storage held by the context.
    async fn teardown(&self) -> Result<(), EnvironmentError>;
}

/// An isolation mechanism.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Builds the environment for `bundle`. Dropping the returned future
    /// must cancel the underlying build tool.
    async fn build(
        &self,
        bundle: &TaskBundle,
        trace: &TraceHandle,
    ) -> Result<BuiltEnvironment, BuildError>;

    /// Releases partial artifacts of a failed or cancelled build.
    async fn release_build(&self, key: &BuildKey);

    /// Creates and starts a fresh context for one run.
    async fn create(
        &self,
        bundle: &TaskBundle,
        built: &BuiltEnvironment,
        run_id: &str,
    ) -> Result<Arc<dyn Environment>, BuildError>;
}

/// Truncates a string to at most `max` bytes on a char boundary.
pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}... [truncated]", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_options_builder() {
        let opts = ExecOptions::new(Duration::from_secs(5))
            .with_workdir("/app")
            .with_env("FOO", "bar");
        assert_eq!(opts.workdir.as_deref(), Some("/app"));
        assert_eq!(opts.env, vec!["FOO=bar".to_string()]);
    }

    #[test]
    fn test_exec_result_success() {
        let ok = ExecResult::default();
        assert!(ok.success());
        let timed_out = ExecResult {
            timed_out: true,
            ..Default::default()
        };
        assert!(!timed_out.success());
    }

    #[test]
    fn test_is_loopback() {
        assert!(is_loopback("127.0.0.1"));
        assert!(is_loopback("localhost"));
        assert!(is_loopback("[::1]"));
        assert!(!is_loopback("db"));
        assert!(!is_loopback("10.0.0.2"));
    }

    #[test]
    fn test_truncate_unicode() {
        assert_eq!(truncate("hello", 10), "hello");
        let result = truncate("héllo wörld", 2);
        assert!(result.starts_with('h'));
        assert!(result.ends_with("... [truncated]"));
    }
}

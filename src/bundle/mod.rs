//! Task bundle descriptors.
//!
//! A bundle directory holds `task.yaml` plus its build context, reference
//! solution and verification procedure. [`load_bundle`] turns it into an
//! immutable [`TaskBundle`]; nothing past the loader sees untyped YAML.
//!
//! ```text
//! <bundle>/
//!   task.yaml
//!   environment/   build context
//!   solution/      reference fix overlay
//!   tests/         verification procedure
//! ```

pub mod loader;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::readiness::ReadinessCheck;
use crate::reward::RewardMode;

pub use loader::{discover_bundles, load_bundle, parse_bundle, BUNDLE_FILE};

/// Opaque pass-through fields the harness does not interpret.
pub type Extra = BTreeMap<String, serde_yaml::Value>;

/// A validated task bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskBundle {
    /// Task name, unique within a dataset.
    pub name: String,
    /// Optional author-assigned version string.
    pub version: Option<String>,
    /// Bundle directory on the host.
    pub root: PathBuf,
    pub metadata: TaskMetadata,
    pub resources: ResourceLimits,
    pub timeouts: Timeouts,
    pub environment: EnvironmentSpec,
    pub readiness: ReadinessSpec,
    /// Reference solution, when the bundle ships one.
    pub solution: Option<SolutionSpec>,
    pub verifier: VerifierSpec,
    /// SHA-256 over the build inputs; two bundles with the same name and
    /// digest share one build.
    pub digest: String,
    /// Unknown top-level fields.
    pub extra: Extra,
}

impl TaskBundle {
    /// Identity used to de-duplicate concurrent builds.
    pub fn build_key(&self) -> BuildKey {
        BuildKey {
            name: self.name.clone(),
            digest: self.digest.clone(),
        }
    }
}

/// Identity of a build: task name plus build-input digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildKey {
    pub name: String,
    pub digest: String,
}

impl BuildKey {
    /// Short form used for image tags and container labels.
    pub fn short(&self) -> String {
        let digest: String = self.digest.chars().take(12).collect();
        format!("{}-{}", self.name.to_lowercase(), digest)
    }
}

impl fmt::Display for BuildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.digest.chars().take(12).collect::<String>())
    }
}

/// Free-form descriptive tags.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskMetadata {
    pub category: Option<String>,
    pub difficulty: Option<String>,
    pub tags: Vec<String>,
    pub extra: Extra,
}

/// Resource ceilings for one runtime context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpus: f64,
    pub memory_mb: u64,
    pub storage_mb: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: Extra,
}

/// Per-stage time budgets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub build: Duration,
    pub agent: Duration,
    pub verifier: Duration,
    pub extra: Extra,
}

/// How the runtime context is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildSource {
    /// Build an image from a Dockerfile (path relative to the context).
    Dockerfile(PathBuf),
    /// Use a prebuilt image.
    Image(String),
    /// Run a shell command inside a copy of the context.
    Command(String),
}

impl BuildSource {
    pub fn kind(&self) -> &'static str {
        match self {
            BuildSource::Dockerfile(_) => "dockerfile",
            BuildSource::Image(_) => "image",
            BuildSource::Command(_) => "build_command",
        }
    }
}

/// Build instructions. The harness only interprets exit status and duration.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentSpec {
    pub source: BuildSource,
    /// Absolute path of the build context on the host.
    pub context: PathBuf,
    /// Working directory inside the context.
    pub workdir: String,
    /// Long-running service started once the context exists.
    pub start: Option<String>,
    /// Network mode override.
    pub network: Option<String>,
    pub extra: Extra,
}

/// Declared readiness checks and the global deadline bounding them.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessSpec {
    pub deadline: Duration,
    pub checks: Vec<ReadinessCheck>,
    pub extra: Extra,
}

impl ReadinessSpec {
    pub fn new(deadline: Duration, checks: Vec<ReadinessCheck>) -> Self {
        Self {
            deadline,
            checks,
            extra: Extra::new(),
        }
    }
}

impl Default for ReadinessSpec {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Vec::new())
    }
}

/// Reference fix shipped with the bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolutionSpec {
    /// Host directory uploaded to `/solution`.
    pub dir: PathBuf,
    /// Script inside `dir` that applies the fix.
    pub entrypoint: String,
    pub extra: Extra,
}

/// How the verification procedure is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifierMode {
    /// Every check carries its own command; run in declaration order.
    Commands,
    /// One entry point reports per-check results through `results_file`.
    Script { entrypoint: String },
}

/// One declared sub-check of the verification procedure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckSpec {
    pub id: String,
    pub weight: f64,
    pub command: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: Extra,
}

/// Verification procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifierSpec {
    /// Host directory uploaded to `/tests`.
    pub dir: Option<PathBuf>,
    pub mode: VerifierMode,
    /// Path inside the context where script-mode verifiers append results.
    pub results_file: String,
    pub reward_mode: RewardMode,
    pub checks: Vec<CheckSpec>,
    pub extra: Extra,
}

impl VerifierSpec {
    /// Sum of declared weights.
    pub fn total_weight(&self) -> f64 {
        self.checks.iter().map(|c| c.weight).sum()
    }
}

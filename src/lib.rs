//! forge-harness: provisions, probes, verifies and scores evaluation tasks.
//!
//! A task bundle declares how to build an isolated environment, when that
//! environment is ready, and how to verify it. The [`run::Harness`] walks
//! each bundle through that lifecycle and persists exactly one reward per
//! run, together with a trace of everything that happened.

// Core modules
pub mod bundle;
pub mod cli;
pub mod config;
pub mod error;
pub mod execution;
pub mod metrics;
pub mod provision;
pub mod readiness;
pub mod reward;
pub mod run;
pub mod solution;
pub mod trace;
pub mod verifier;

// Re-export commonly used types
pub use bundle::{load_bundle, BuildKey, TaskBundle};
pub use config::{BackendKind, HarnessConfig, PlatformLimits};
pub use error::{
    BuildError, BundleError, DockerError, EnvironmentError, HarnessError, ReadinessError,
    RewardError,
};
pub use reward::{RewardMode, RewardRecord};
pub use run::{BatchSummary, FailureKind, Harness, RunRequest, RunState, TerminalStatus};
pub use solution::MutationMode;
pub use verifier::{CheckStatus, VerificationResult, VerificationStatus};

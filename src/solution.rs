//! Mutation step between readiness and verification.
//!
//! Either the reference solution is overlaid, an agent command runs, or
//! nothing happens because the environment was already modified out of
//! band. The step is bounded by the bundle's agent timeout; its outcome is
//! recorded but never decides the reward.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bundle::TaskBundle;
use crate::execution::{Environment, ExecOptions, ExecResult};
use crate::trace::{EventKind, OutputStream, Stage, TraceHandle};

/// Where the reference solution is uploaded inside the context.
pub const SOLUTION_DIR: &str = "/solution";

/// What modifies the environment before verification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MutationMode {
    /// Leave the environment as provisioned.
    #[default]
    None,
    /// Upload and run the bundle's reference solution.
    ReferenceSolution,
    /// Run an agent command in the working directory.
    Agent { command: String },
}

impl fmt::Display for MutationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationMode::None => write!(f, "none"),
            MutationMode::ReferenceSolution => write!(f, "reference_solution"),
            MutationMode::Agent { .. } => write!(f, "agent"),
        }
    }
}

/// Outcome of the mutation step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationReport {
    pub exit_code: Option<i64>,
    pub timed_out: bool,
    pub duration_ms: u64,
    /// Set when the step did not complete cleanly.
    pub diagnostic: Option<String>,
}

/// Applies a [`MutationMode`] to a ready context.
#[derive(Debug, Default, Clone)]
pub struct SolutionApplicator;

impl SolutionApplicator {
    pub fn new() -> Self {
        Self
    }

    pub async fn apply(
        &self,
        env: &dyn Environment,
        bundle: &TaskBundle,
        mode: &MutationMode,
        trace: &TraceHandle,
    ) -> MutationReport {
        let timeout = bundle.timeouts.agent;
        let (label, command, options) = match mode {
            MutationMode::None => return MutationReport::default(),
            MutationMode::ReferenceSolution => {
                let Some(solution) = &bundle.solution else {
                    return failed(trace, "bundle has no reference solution".to_string());
                };
                if let Err(e) = env.upload_dir(&solution.dir, SOLUTION_DIR).await {
                    return failed(trace, format!("failed to upload solution: {e}"));
                }
                let options = ExecOptions::new(timeout)
                    .with_env("FORGE_SOLUTION_DIR", &env.resolve_path(SOLUTION_DIR))
                    .with_env("FORGE_ENTRYPOINT", &solution.entrypoint);
                (
                    format!("bash {SOLUTION_DIR}/{}", solution.entrypoint),
                    "bash \"$FORGE_SOLUTION_DIR/$FORGE_ENTRYPOINT\"".to_string(),
                    options,
                )
            }
            MutationMode::Agent { command } => (
                command.clone(),
                command.clone(),
                ExecOptions::new(timeout).with_env("FORGE_TASK", &bundle.name),
            ),
        };

        info!(task = %bundle.name, mode = %mode, "Applying mutation");
        let result = match env.exec(&command, &options).await {
            Ok(result) => result,
            Err(e) => return failed(trace, format!("{mode} could not start: {e}")),
        };
        record(trace, &label, &result);

        let diagnostic = if result.timed_out {
            Some(format!("{mode} exceeded agent timeout of {}s", timeout.as_secs()))
        } else if result.exit_code != 0 {
            Some(format!("{mode} exited with code {}", result.exit_code))
        } else {
            None
        };
        if let Some(message) = &diagnostic {
            warn!(task = %bundle.name, "{message}; continuing to verification");
            trace.diagnostic(Stage::Mutation, message.clone());
        }

        MutationReport {
            exit_code: (!result.timed_out).then_some(result.exit_code),
            timed_out: result.timed_out,
            duration_ms: result.duration_ms,
            diagnostic,
        }
    }
}

fn failed(trace: &TraceHandle, message: String) -> MutationReport {
    warn!("{message}");
    trace.diagnostic(Stage::Mutation, message.clone());
    MutationReport {
        diagnostic: Some(message),
        ..Default::default()
    }
}

fn record(trace: &TraceHandle, command: &str, result: &ExecResult) {
    trace.record(
        Stage::Mutation,
        EventKind::Command {
            command: command.to_string(),
            exit_code: (!result.timed_out).then_some(result.exit_code),
            duration_ms: result.duration_ms,
            timed_out: result.timed_out,
        },
    );
    for (stream, content) in [
        (OutputStream::Stdout, &result.stdout),
        (OutputStream::Stderr, &result.stderr),
    ] {
        if !content.is_empty() {
            trace.record(
                Stage::Mutation,
                EventKind::Output {
                    stream,
                    content: content.clone(),
                },
            );
        }
    }
}

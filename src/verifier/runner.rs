//! Runs a bundle's verification procedure inside a ready context.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{
    merge_results, CheckOutcome, CheckStatus, VerificationResult, VerificationStatus,
    DEFAULT_CHECK_WEIGHT, ENTRYPOINT_CHECK,
};
use crate::bundle::{TaskBundle, VerifierMode};
use crate::execution::{truncate, Environment, ExecOptions, ExecResult};
use crate::trace::{EventKind, OutputStream, Stage, TraceHandle};

/// Where the verification procedure is uploaded inside the context.
pub const TESTS_DIR: &str = "/tests";
/// Deadline for the setup commands issued before the procedure starts.
const SETUP_TIMEOUT: Duration = Duration::from_secs(60);
/// Maximum length of a failure message attached to an outcome.
const MAX_MESSAGE: usize = 512;

/// Executes verification procedures.
///
/// Checks run sequentially in declaration order so that identical context
/// state yields an identical result.
#[derive(Debug, Default, Clone)]
pub struct VerifierRunner;

impl VerifierRunner {
    pub fn new() -> Self {
        Self
    }

    /// Runs the procedure under the bundle's verifier timeout. Never fails:
    /// a procedure that cannot start yields a `crashed` result.
    pub async fn run(
        &self,
        env: &dyn Environment,
        bundle: &TaskBundle,
        trace: &TraceHandle,
    ) -> VerificationResult {
        let started = Instant::now();
        let verifier = &bundle.verifier;

        if let Some(dir) = &verifier.dir {
            if let Err(e) = env.upload_dir(dir, TESTS_DIR).await {
                let message = format!("failed to upload verifier files: {e}");
                warn!(task = %bundle.name, error = %e, "Verifier upload failed");
                trace.diagnostic(Stage::Verification, message.clone());
                return VerificationResult::crashed(&verifier.checks, message)
                    .with_duration(started.elapsed().as_millis() as u64);
            }
        }

        let result = match &verifier.mode {
            VerifierMode::Commands => self.run_commands(env, bundle, trace).await,
            VerifierMode::Script { entrypoint } => {
                self.run_script(env, bundle, entrypoint, trace).await
            }
        };

        info!(
            task = %bundle.name,
            status = %result.status,
            passed = result.passed_count(),
            total = result.outcomes.len(),
            "Verification finished"
        );
        result.with_duration(started.elapsed().as_millis() as u64)
    }

    async fn run_commands(
        &self,
        env: &dyn Environment,
        bundle: &TaskBundle,
        trace: &TraceHandle,
    ) -> VerificationResult {
        let checks = &bundle.verifier.checks;
        let deadline = Instant::now() + bundle.timeouts.verifier;
        let mut outcomes: Vec<CheckOutcome> = Vec::with_capacity(checks.len());
        let mut timed_out = false;
        let mut errors = 0usize;

        for spec in checks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if timed_out || remaining.is_zero() {
                timed_out = true;
                outcomes.push(CheckOutcome::not_run(spec));
                continue;
            }
            let Some(command) = spec.command.as_deref() else {
                outcomes.push(CheckOutcome::not_run(spec));
                continue;
            };

            let options = ExecOptions::new(remaining)
                .with_env("FORGE_TESTS_DIR", &env.resolve_path(TESTS_DIR))
                .with_env("FORGE_CHECK_ID", &spec.id);
            match env.exec(command, &options).await {
                Ok(result) => {
                    record_exec(trace, command, &result);
                    let status = if result.success() {
                        CheckStatus::Passed
                    } else {
                        CheckStatus::Failed
                    };
                    let message = if result.timed_out {
                        timed_out = true;
                        Some(format!(
                            "verifier deadline of {}s elapsed",
                            bundle.timeouts.verifier.as_secs()
                        ))
                    } else if status == CheckStatus::Failed {
                        Some(failure_message(&result))
                    } else {
                        None
                    };
                    debug!(check = %spec.id, ?status, "Check finished");
                    outcomes.push(CheckOutcome {
                        id: spec.id.clone(),
                        status,
                        weight: spec.weight,
                        message,
                    });
                }
                Err(e) => {
                    errors += 1;
                    trace.diagnostic(
                        Stage::Verification,
                        format!("check '{}' could not run: {e}", spec.id),
                    );
                    outcomes.push(CheckOutcome {
                        id: spec.id.clone(),
                        status: CheckStatus::Failed,
                        weight: spec.weight,
                        message: Some(e.to_string()),
                    });
                }
            }
        }

        let status = if !checks.is_empty() && errors == checks.len() {
            VerificationStatus::Crashed
        } else if timed_out {
            VerificationStatus::TimedOut
        } else {
            VerificationResult::completed_status(&outcomes)
        };
        VerificationResult::new(outcomes, status)
    }

    async fn run_script(
        &self,
        env: &dyn Environment,
        bundle: &TaskBundle,
        entrypoint: &str,
        trace: &TraceHandle,
    ) -> VerificationResult {
        let verifier = &bundle.verifier;
        let results_file = env.resolve_path(&verifier.results_file);

        let prepare = ExecOptions::new(SETUP_TIMEOUT).with_env("FORGE_RESULTS_FILE", &results_file);
        let prepared = env
            .exec(
                "mkdir -p \"$(dirname \"$FORGE_RESULTS_FILE\")\" && rm -f \"$FORGE_RESULTS_FILE\"",
                &prepare,
            )
            .await;
        match prepared {
            Ok(result) if result.success() => {}
            Ok(result) => {
                let message = format!("cannot prepare results file: {}", failure_message(&result));
                trace.diagnostic(Stage::Verification, message.clone());
                return VerificationResult::crashed(&verifier.checks, message);
            }
            Err(e) => {
                let message = format!("cannot prepare results file: {e}");
                trace.diagnostic(Stage::Verification, message.clone());
                return VerificationResult::crashed(&verifier.checks, message);
            }
        }

        let command = "bash \"$FORGE_TESTS_DIR/$FORGE_ENTRYPOINT\"";
        let options = ExecOptions::new(bundle.timeouts.verifier)
            .with_env("FORGE_TESTS_DIR", &env.resolve_path(TESTS_DIR))
            .with_env("FORGE_ENTRYPOINT", entrypoint)
            .with_env("FORGE_RESULTS_FILE", &results_file);
        let exec = match env.exec(command, &options).await {
            Ok(exec) => exec,
            Err(e) => {
                let message = format!("verifier entrypoint could not start: {e}");
                trace.diagnostic(Stage::Verification, message.clone());
                return VerificationResult::crashed(&verifier.checks, message);
            }
        };
        record_exec(trace, &format!("bash {TESTS_DIR}/{entrypoint}"), &exec);

        // Read even after a timeout: results reported so far are partial credit.
        let report = match env.read_file(&verifier.results_file).await {
            Ok(report) => report,
            Err(e) => {
                trace.diagnostic(
                    Stage::Verification,
                    format!("cannot read results file {}: {e}", verifier.results_file),
                );
                None
            }
        };

        let outcomes = match report {
            Some(content) => {
                let (outcomes, malformed) = merge_results(&verifier.checks, &content);
                if malformed > 0 {
                    trace.diagnostic(
                        Stage::Verification,
                        format!("{malformed} malformed line(s) in {}", verifier.results_file),
                    );
                }
                outcomes
            }
            None if exec.timed_out => verifier
                .checks
                .iter()
                .map(CheckOutcome::not_run)
                .collect(),
            None => vec![CheckOutcome {
                id: ENTRYPOINT_CHECK.to_string(),
                status: if exec.success() {
                    CheckStatus::Passed
                } else {
                    CheckStatus::Failed
                },
                weight: DEFAULT_CHECK_WEIGHT,
                message: (!exec.success()).then(|| failure_message(&exec)),
            }],
        };

        let status = if exec.timed_out {
            VerificationStatus::TimedOut
        } else if exec.success() {
            VerificationResult::completed_status(&outcomes)
        } else {
            VerificationStatus::Failed
        };
        VerificationResult::new(outcomes, status)
    }
}

fn record_exec(trace: &TraceHandle, command: &str, result: &ExecResult) {
    trace.record(
        Stage::Verification,
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
                Stage::Verification,
                EventKind::Output {
                    stream,
                    content: content.clone(),
                },
            );
        }
    }
}

fn failure_message(result: &ExecResult) -> String {
    let output = if result.stderr.trim().is_empty() {
        result.stdout.trim()
    } else {
        result.stderr.trim()
    };
    if output.is_empty() {
        format!("exit code {}", result.exit_code)
    } else {
        format!(
            "exit code {}: {}",
            result.exit_code,
            truncate(output, MAX_MESSAGE)
        )
    }
}

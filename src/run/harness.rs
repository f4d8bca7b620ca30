//! Run orchestration.
//!
//! [`Harness::run`] walks one bundle through build, readiness, mutation and
//! verification, and always ends by persisting exactly one reward record.
//! Stage failures become terminal statuses; only problems the caller can
//! act on (missing solution, unwritable output directory) are errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{status_for_abort, FailureKind, RunState, TerminalStatus};
use crate::bundle::TaskBundle;
use crate::config::HarnessConfig;
use crate::error::{BuildError, HarnessError, RewardError};
use crate::execution::{Backend, Environment};
use crate::metrics;
use crate::provision::{BuildRegistry, Provisioner};
use crate::readiness::ReadinessProber;
use crate::reward::{self, RewardRecord, RewardSink, RunJournal};
use crate::solution::{MutationMode, SolutionApplicator};
use crate::trace::{ArtifactLogger, EventKind, Stage, TraceHandle};
use crate::verifier::{VerificationResult, VerificationStatus, VerifierRunner};

/// Parameters of a single run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Stable identifier; generated when absent. Re-running with the id of
    /// a scored run returns the persisted record.
    pub run_id: Option<String>,
    pub mutation: MutationMode,
    /// Flips to `true` to cancel the run.
    pub cancel: Option<watch::Receiver<bool>>,
}

impl RunRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_mutation(mut self, mutation: MutationMode) -> Self {
        self.mutation = mutation;
        self
    }

    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Aggregate of a batch of runs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errors: usize,
    pub mean_reward: f64,
    pub records: Vec<RewardRecord>,
    /// `(task, message)` for runs that ended in a harness error.
    pub failures: Vec<(String, String)>,
}

/// Orchestrates runs against one backend.
///
/// Cloning is cheap; clones share the build registry, so identical bundles
/// submitted through any clone are built once.
#[derive(Clone)]
pub struct Harness {
    provisioner: Provisioner,
    config: HarnessConfig,
    prober: ReadinessProber,
    verifier: VerifierRunner,
    applicator: SolutionApplicator,
}

impl Harness {
    pub fn new(backend: Arc<dyn Backend>, config: HarnessConfig) -> Self {
        Self {
            provisioner: Provisioner::new(backend, Arc::new(BuildRegistry::new())),
            config,
            prober: ReadinessProber::new(),
            verifier: VerifierRunner::new(),
            applicator: SolutionApplicator::new(),
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    /// Executes one run to completion and returns its persisted record.
    pub async fn run(
        &self,
        bundle: &TaskBundle,
        request: RunRequest,
    ) -> Result<RewardRecord, HarnessError> {
        if request.mutation == MutationMode::ReferenceSolution && bundle.solution.is_none() {
            return Err(HarnessError::MissingSolution(bundle.name.clone()));
        }

        let run_id = request
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let sink = RewardSink::new(&self.config.output_dir, &run_id)?;
        sink.prepare()?;

        if let Some(record) = sink.load()? {
            info!(run_id = %run_id, status = %record.status, "Run already scored");
            return Ok(record);
        }
        if let Some(journal) = sink.read_journal()? {
            return self.recover_interrupted(bundle, &sink, journal);
        }

        let _active = metrics::run_started();
        let logger = ArtifactLogger::spawn(&run_id, sink.trace_path(), self.config.trace_buffer);
        let trace = logger.handle();
        let mut progress = RunProgress::new(&sink, &run_id, bundle, trace.clone());
        progress.journal();

        info!(
            run_id = %run_id,
            task = %bundle.name,
            mutation = %request.mutation,
            "Run started"
        );

        let mut cancel = CancelSignal(request.cancel.clone());
        let scoring = self
            .drive(bundle, &request.mutation, &mut progress, &mut cancel)
            .await;
        let scoring = match scoring {
            Ok(scoring) => scoring,
            Err(e) => {
                logger.finish().await;
                return Err(e);
            }
        };

        progress.advance(RunState::Scored)?;
        let reward = scoring
            .verification
            .as_ref()
            .map(|v| reward::calculate(v, bundle.verifier.reward_mode))
            .unwrap_or(0.0);
        trace.record(
            Stage::Scoring,
            EventKind::Diagnostic {
                message: format!("status={} reward={reward}", scoring.status),
            },
        );

        let record = RewardRecord {
            run_id: run_id.clone(),
            task: bundle.name.clone(),
            status: scoring.status,
            failure: scoring.failure,
            reward,
            reward_mode: bundle.verifier.reward_mode,
            verification: scoring.verification,
            diagnostic: scoring.diagnostic,
            started_at: progress.started_at,
            completed_at: Utc::now(),
        };
        let record = match sink.persist(&record) {
            Ok(()) => record,
            Err(RewardError::AlreadyPersisted(_)) => {
                warn!(run_id = %run_id, "Another attempt persisted this run first");
                sink.load()?.unwrap_or(record)
            }
            Err(e) => {
                logger.finish().await;
                return Err(e.into());
            }
        };
        progress.journal();

        metrics::record_run(&record.status.to_string(), record.reward);
        let summary = logger.finish().await;
        if summary.events_dropped > 0 || summary.write_errors > 0 {
            warn!(
                run_id = %run_id,
                dropped = summary.events_dropped,
                write_errors = summary.write_errors,
                "Trace incomplete"
            );
        }

        info!(
            run_id = %run_id,
            task = %bundle.name,
            status = %record.status,
            reward = record.reward,
            "Run finished"
        );
        Ok(record)
    }

    /// Runs every bundle with at most `config.parallel` runs in flight.
    ///
    /// With a `run_id` in `template`, each run gets `<run_id>-<task>`.
    pub async fn run_many(&self, bundles: &[TaskBundle], template: &RunRequest) -> BatchSummary {
        let parallel = self.config.parallel.max(1);
        info!(tasks = bundles.len(), parallel, "Starting batch");

        let results: Vec<(String, Result<RewardRecord, HarnessError>)> = stream::iter(bundles)
            .map(|bundle| {
                let mut request = template.clone();
                request.run_id = template
                    .run_id
                    .as_ref()
                    .map(|prefix| format!("{prefix}-{}", bundle.name));
                async move { (bundle.name.clone(), self.run(bundle, request).await) }
            })
            .buffer_unordered(parallel)
            .collect()
            .await;

        let mut summary = BatchSummary {
            total: results.len(),
            ..Default::default()
        };
        for (task, result) in results {
            match result {
                Ok(record) => {
                    if record.status == TerminalStatus::Succeeded {
                        summary.succeeded += 1;
                    } else {
                        summary.failed += 1;
                    }
                    summary.records.push(record);
                }
                Err(e) => {
                    warn!(task = %task, error = %e, "Run did not complete");
                    summary.errors += 1;
                    summary.failures.push((task, e.to_string()));
                }
            }
        }
        if !summary.records.is_empty() {
            summary.mean_reward = summary.records.iter().map(|r| r.reward).sum::<f64>()
                / summary.records.len() as f64;
        }
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            errors = summary.errors,
            "Batch complete"
        );
        summary
    }

    async fn drive(
        &self,
        bundle: &TaskBundle,
        mutation: &MutationMode,
        progress: &mut RunProgress<'_>,
        cancel: &mut CancelSignal,
    ) -> Result<Scoring, HarnessError> {
        let trace = progress.trace.clone();

        progress.advance(RunState::Building)?;
        let built = tokio::select! {
            built = self.provisioner.build(bundle, &trace) => built,
            _ = cancel.cancelled() => return progress.abort(None, "cancelled during build").await,
        };
        let built = match built {
            Ok(built) => built,
            Err(e) => {
                let failure = match &e {
                    BuildError::Timeout(_) => FailureKind::BuildTimeout,
                    _ => FailureKind::BuildFailure,
                };
                progress.advance(RunState::BuildFailed)?;
                return Ok(Scoring::failed(
                    TerminalStatus::ProvisioningFailed,
                    failure,
                    e.to_string(),
                ));
            }
        };

        // Not raced against cancellation: a half-created context would leak.
        let env = match self.provisioner.create(bundle, &built, &progress.run_id).await {
            Ok(env) => env,
            Err(e) => {
                trace.diagnostic(Stage::Provision, e.to_string());
                progress.advance(RunState::BuildFailed)?;
                return Ok(Scoring::failed(
                    TerminalStatus::ProvisioningFailed,
                    FailureKind::BuildFailure,
                    e.to_string(),
                ));
            }
        };
        let mut guard = EnvironmentGuard::new(
            env,
            self.config.keep_contexts,
            trace.clone(),
            self.config.sample_interval,
        );
        progress.advance(RunState::Built)?;
        if cancel.is_cancelled() {
            return progress.abort(Some(&mut guard), "cancelled after build").await;
        }

        let started = Instant::now();
        let readiness = tokio::select! {
            ready = self.prober.wait_ready(guard.env(), &bundle.readiness, &trace) => ready,
            _ = cancel.cancelled() => {
                return progress.abort(Some(&mut guard), "cancelled during readiness").await
            }
        };
        metrics::record_stage_duration("readiness", started.elapsed().as_secs_f64());
        match readiness {
            Ok(report) => {
                debug!(run_id = %progress.run_id, elapsed_ms = report.elapsed_ms, "Context ready");
            }
            Err(e) => {
                trace.diagnostic(Stage::Readiness, e.to_string());
                progress.advance(RunState::ReadinessFailed)?;
                guard.release().await;
                return Ok(Scoring::failed(
                    TerminalStatus::ReadinessTimeout,
                    FailureKind::ReadinessTimeout,
                    e.to_string(),
                ));
            }
        }
        progress.advance(RunState::Ready)?;

        let started = Instant::now();
        let report = tokio::select! {
            report = self.applicator.apply(guard.env(), bundle, mutation, &trace) => report,
            _ = cancel.cancelled() => {
                return progress.abort(Some(&mut guard), "cancelled during mutation").await
            }
        };
        metrics::record_stage_duration("mutation", started.elapsed().as_secs_f64());

        let started = Instant::now();
        let verification = tokio::select! {
            result = self.verifier.run(guard.env(), bundle, &trace) => result,
            _ = cancel.cancelled() => {
                return progress.abort(Some(&mut guard), "cancelled during verification").await
            }
        };
        metrics::record_stage_duration("verification", started.elapsed().as_secs_f64());
        progress.advance(RunState::Verified)?;
        guard.release().await;

        Ok(Scoring::verified(verification, report.diagnostic))
    }

    /// Scores a run whose previous attempt died before persisting a reward.
    fn recover_interrupted(
        &self,
        bundle: &TaskBundle,
        sink: &RewardSink,
        journal: RunJournal,
    ) -> Result<RewardRecord, HarnessError> {
        let status = status_for_abort(journal.state);
        warn!(
            run_id = %journal.run_id,
            state = %journal.state,
            "Previous attempt was interrupted, scoring as {status}"
        );
        let record = RewardRecord {
            run_id: journal.run_id.clone(),
            task: bundle.name.clone(),
            status,
            failure: Some(FailureKind::Interrupted),
            reward: 0.0,
            reward_mode: bundle.verifier.reward_mode,
            verification: None,
            diagnostic: Some(format!("previous attempt interrupted in state {}", journal.state)),
            started_at: journal.started_at,
            completed_at: Utc::now(),
        };
        match sink.persist(&record) {
            Ok(()) => {}
            Err(RewardError::AlreadyPersisted(_)) => {
                return Ok(sink.load()?.unwrap_or(record));
            }
            Err(e) => return Err(e.into()),
        }
        metrics::record_run(&record.status.to_string(), 0.0);
        Ok(record)
    }
}

/// What a run's stages decided, before the reward is computed.
struct Scoring {
    status: TerminalStatus,
    failure: Option<FailureKind>,
    verification: Option<VerificationResult>,
    diagnostic: Option<String>,
}

impl Scoring {
    fn failed(status: TerminalStatus, failure: FailureKind, diagnostic: String) -> Self {
        Self {
            status,
            failure: Some(failure),
            verification: None,
            diagnostic: Some(diagnostic),
        }
    }

    fn verified(result: VerificationResult, mutation_diagnostic: Option<String>) -> Self {
        let (status, failure) = match result.status {
            VerificationStatus::Passed => (TerminalStatus::Succeeded, None),
            VerificationStatus::Failed => (TerminalStatus::VerificationFailed, None),
            VerificationStatus::TimedOut => (
                TerminalStatus::VerificationFailed,
                Some(FailureKind::VerifierTimeout),
            ),
            VerificationStatus::Crashed => (
                TerminalStatus::VerificationFailed,
                Some(FailureKind::VerifierCrash),
            ),
        };
        Self {
            status,
            failure,
            verification: Some(result),
            diagnostic: mutation_diagnostic,
        }
    }
}

/// State, journal and trace bookkeeping for one run.
struct RunProgress<'a> {
    sink: &'a RewardSink,
    run_id: String,
    task: String,
    state: RunState,
    started_at: DateTime<Utc>,
    trace: TraceHandle,
}

impl<'a> RunProgress<'a> {
    fn new(sink: &'a RewardSink, run_id: &str, bundle: &TaskBundle, trace: TraceHandle) -> Self {
        Self {
            sink,
            run_id: run_id.to_string(),
            task: bundle.name.clone(),
            state: RunState::Unbuilt,
            started_at: Utc::now(),
            trace,
        }
    }

    fn advance(&mut self, next: RunState) -> Result<(), HarnessError> {
        let from = self.state;
        self.state.advance(next)?;
        self.trace.record(
            Stage::Run,
            EventKind::StageTransition {
                from: from.to_string(),
                to: next.to_string(),
            },
        );
        debug!(run_id = %self.run_id, from = %from, to = %next, "State transition");
        self.journal();
        Ok(())
    }

    /// Journal writes are best effort; a missing journal only weakens
    /// crash detection.
    fn journal(&self) {
        let journal = RunJournal {
            run_id: self.run_id.clone(),
            task: self.task.clone(),
            state: self.state,
            started_at: self.started_at,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.sink.record_state(&journal) {
            warn!(run_id = %self.run_id, error = %e, "Failed to update run journal");
        }
    }

    async fn abort(
        &mut self,
        guard: Option<&mut EnvironmentGuard>,
        reason: &str,
    ) -> Result<Scoring, HarnessError> {
        let status = status_for_abort(self.state);
        info!(run_id = %self.run_id, state = %self.state, "Run {reason}");
        self.trace.diagnostic(Stage::Run, reason);
        self.advance(RunState::Cancelled)?;
        if let Some(guard) = guard {
            guard.release().await;
        }
        Ok(Scoring::failed(status, FailureKind::Cancelled, reason.to_string()))
    }
}

/// Cancellation flag of a run.
struct CancelSignal(Option<watch::Receiver<bool>>);

impl CancelSignal {
    fn is_cancelled(&self) -> bool {
        self.0.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once the flag is set; never resolves without a sender.
    async fn cancelled(&mut self) {
        if let Some(rx) = self.0.as_mut() {
            if rx.wait_for(|cancelled| *cancelled).await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

/// Owns a live context. Released explicitly at the end of the run; if the
/// run future is dropped first, teardown is spawned from `Drop`.
struct EnvironmentGuard {
    env: Arc<dyn Environment>,
    sampler: Option<JoinHandle<()>>,
    armed: bool,
    keep: bool,
    trace: TraceHandle,
}

impl EnvironmentGuard {
    fn new(env: Arc<dyn Environment>, keep: bool, trace: TraceHandle, interval: Duration) -> Self {
        let sampler = (!interval.is_zero()).then(|| {
            let env = Arc::clone(&env);
            let trace = trace.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if let Some(sample) = env.sample_resources().await {
                        trace.record(
                            Stage::Run,
                            EventKind::ResourceSample {
                                cpu_percent: sample.cpu_percent,
                                memory_bytes: sample.memory_bytes,
                            },
                        );
                    }
                }
            })
        });
        Self {
            env,
            sampler,
            armed: true,
            keep,
            trace,
        }
    }

    fn env(&self) -> &dyn Environment {
        self.env.as_ref()
    }

    async fn release(&mut self) {
        if let Some(sampler) = self.sampler.take() {
            sampler.abort();
        }
        if !std::mem::replace(&mut self.armed, false) {
            return;
        }
        if self.keep {
            info!(context = %self.env.id(), "Keeping context alive");
            self.trace
                .diagnostic(Stage::Teardown, format!("context {} kept", self.env.id()));
            return;
        }
        match self.env.teardown().await {
            Ok(()) => self
                .trace
                .diagnostic(Stage::Teardown, format!("context {} released", self.env.id())),
            Err(e) => {
                warn!(context = %self.env.id(), error = %e, "Teardown failed");
                self.trace
                    .diagnostic(Stage::Teardown, format!("teardown failed: {e}"));
            }
        }
    }
}

impl Drop for EnvironmentGuard {
    fn drop(&mut self) {
        if let Some(sampler) = self.sampler.take() {
            sampler.abort();
        }
        if !self.armed || self.keep {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let env = Arc::clone(&self.env);
            handle.spawn(async move {
                if let Err(e) = env.teardown().await {
                    warn!(context = %env.id(), error = %e, "Deferred teardown failed");
                }
            });
        }
    }
}

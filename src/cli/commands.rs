//! CLI command definitions for forge-harness.
//!
//! Validates task bundles, runs them against a backend, and inspects the
//! traces runs leave behind.

use crate::bundle::{discover_bundles, load_bundle, TaskBundle};
use crate::config::{BackendKind, HarnessConfig};
use crate::execution::{Backend, DockerBackend, DockerClient, LocalBackend};
use crate::metrics;
use crate::reward::{validate_run_id, RewardRecord};
use crate::run::{Harness, RunRequest};
use crate::solution::MutationMode;
use crate::trace::{EventKind, ExecutionTrace, Stage, TRACE_FILE};
use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Sub-directory of the output directory holding local-backend builds.
const LOCAL_BUILD_CACHE: &str = ".builds";

/// Evaluation harness for containerized task bundles.
#[derive(Parser)]
#[command(name = "forge-harness")]
#[command(about = "Build, run and grade evaluation task bundles")]
#[command(version)]
#[command(
    long_about = "forge-harness provisions an isolated environment per task bundle, waits for it to become ready, applies a solution or agent, runs the verifier and persists a reward.\n\nExample usage:\n  forge-harness run ./tasks/fix-health --solution\n  forge-harness batch -i ./tasks --parallel 4 --json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Isolation backend (docker or local).
    #[arg(long, env = "HARNESS_BACKEND", global = true)]
    pub backend: Option<BackendKind>,

    /// Directory receiving one sub-directory per run.
    #[arg(short = 'o', long, env = "HARNESS_OUTPUT_DIR", global = true)]
    pub output: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Validate bundles without building anything.
    Validate(ValidateArgs),

    /// Run a single bundle and persist its reward.
    Run(RunArgs),

    /// Run every bundle found in a directory.
    Batch(BatchArgs),

    /// Summarize the trace of a finished run.
    Trace(TraceArgs),
}

/// Arguments for `forge-harness validate`.
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Bundle directories or descriptor files.
    #[arg(required = true)]
    pub bundles: Vec<PathBuf>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// How the environment is modified before verification.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct MutationArgs {
    /// Apply the bundle's reference solution.
    #[arg(long, conflicts_with = "agent_cmd")]
    pub solution: bool,

    /// Command run inside the context as the agent.
    #[arg(long)]
    pub agent_cmd: Option<String>,
}

impl MutationArgs {
    fn mode(&self) -> MutationMode {
        match (&self.agent_cmd, self.solution) {
            (Some(command), _) => MutationMode::Agent {
                command: command.clone(),
            },
            (None, true) => MutationMode::ReferenceSolution,
            (None, false) => MutationMode::None,
        }
    }
}

/// Arguments for `forge-harness run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Bundle directory or descriptor file.
    pub bundle: PathBuf,

    #[command(flatten)]
    pub mutation: MutationArgs,

    /// Stable run id; re-running a scored id returns its record.
    #[arg(long, value_parser = parse_run_id)]
    pub run_id: Option<String>,

    /// Keep the context alive after the run.
    #[arg(long)]
    pub keep_context: bool,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    pub metrics: bool,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `forge-harness batch`.
#[derive(Parser, Debug)]
pub struct BatchArgs {
    /// Directory containing bundle directories.
    #[arg(short = 'i', long)]
    pub input: PathBuf,

    #[command(flatten)]
    pub mutation: MutationArgs,

    /// Maximum runs in flight.
    #[arg(short = 'p', long, env = "HARNESS_PARALLEL")]
    pub parallel: Option<usize>,

    /// Prefix for run ids (`<prefix>-<task>`).
    #[arg(long, value_parser = parse_run_id)]
    pub run_prefix: Option<String>,

    /// Print Prometheus metrics after the batch.
    #[arg(long)]
    pub metrics: bool,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `forge-harness trace`.
#[derive(Parser, Debug)]
pub struct TraceArgs {
    /// Run directory (or trace file).
    pub run: PathBuf,

    /// Print every event instead of a summary.
    #[arg(long)]
    pub events: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and
/// `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = HarnessConfig::from_env()?;
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if let Some(output) = cli.output {
        config.output_dir = output;
    }

    match cli.command {
        Commands::Validate(args) => run_validate_command(args, &config),
        Commands::Run(args) => run_run_command(args, config).await,
        Commands::Batch(args) => run_batch_command(args, config).await,
        Commands::Trace(args) => run_trace_command(args),
    }
}

#[derive(Debug, Serialize)]
struct ValidateEntry {
    path: String,
    task: Option<String>,
    valid: bool,
    violations: Vec<String>,
}

fn run_validate_command(args: ValidateArgs, config: &HarnessConfig) -> anyhow::Result<()> {
    let mut entries = Vec::new();
    for path in &args.bundles {
        let entry = match load_bundle(path, &config.limits) {
            Ok(bundle) => ValidateEntry {
                path: path.display().to_string(),
                task: Some(bundle.name),
                valid: true,
                violations: Vec::new(),
            },
            Err(e) => {
                let mut violations: Vec<String> =
                    e.violations().iter().map(|v| v.to_string()).collect();
                if violations.is_empty() {
                    violations.push(e.to_string());
                }
                ValidateEntry {
                    path: path.display().to_string(),
                    task: None,
                    valid: false,
                    violations,
                }
            }
        };
        entries.push(entry);
    }

    let invalid = entries.iter().filter(|e| !e.valid).count();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for entry in &entries {
            if entry.valid {
                println!(
                    "OK       {} ({})",
                    entry.path,
                    entry.task.as_deref().unwrap_or_default()
                );
            } else {
                println!("INVALID  {}", entry.path);
                for violation in &entry.violations {
                    println!("         - {violation}");
                }
            }
        }
    }

    if invalid > 0 {
        anyhow::bail!("{invalid} of {} bundle(s) invalid", entries.len());
    }
    Ok(())
}

async fn run_run_command(args: RunArgs, mut config: HarnessConfig) -> anyhow::Result<()> {
    config.keep_contexts = args.keep_context;
    if args.metrics {
        metrics::init_metrics()?;
    }

    let bundle = load_bundle(&args.bundle, &config.limits)?;
    let harness = Harness::new(build_backend(&config)?, config);

    let mut request = RunRequest::new()
        .with_mutation(args.mutation.mode())
        .with_cancel(cancel_on_ctrl_c());
    if let Some(run_id) = args.run_id {
        request = request.with_run_id(run_id);
    }

    let record = harness.run(&bundle, request).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print_record(&record, harness.config().output_dir.as_path());
    }
    if args.metrics {
        print!("{}", metrics::export_metrics());
    }
    Ok(())
}

async fn run_batch_command(args: BatchArgs, mut config: HarnessConfig) -> anyhow::Result<()> {
    if let Some(parallel) = args.parallel {
        config.parallel = parallel.max(1);
    }
    if args.metrics {
        metrics::init_metrics()?;
    }

    let mut bundles: Vec<TaskBundle> = Vec::new();
    for path in discover_bundles(&args.input)? {
        match load_bundle(&path, &config.limits) {
            Ok(bundle) => bundles.push(bundle),
            Err(e) => warn!("Skipping {}: {}", path.display(), e),
        }
    }
    if bundles.is_empty() {
        anyhow::bail!("No valid bundles found in {}", args.input.display());
    }
    info!(
        "Running {} bundle(s) from {} with parallelism {}",
        bundles.len(),
        args.input.display(),
        config.parallel
    );

    let harness = Harness::new(build_backend(&config)?, config);
    let mut template = RunRequest::new()
        .with_mutation(args.mutation.mode())
        .with_cancel(cancel_on_ctrl_c());
    template.run_id = args.run_prefix;

    let summary = harness.run_many(&bundles, &template).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("\n=== Harness Results ===");
        println!("Total runs:     {}", summary.total);
        println!("Succeeded:      {}", summary.succeeded);
        println!("Failed:         {}", summary.failed);
        println!("Errors:         {}", summary.errors);
        println!("Mean reward:    {:.3}", summary.mean_reward);
        println!();
        for record in &summary.records {
            println!(
                "  {:<40} {:<22} reward={:.3}",
                record.task, record.status, record.reward
            );
        }
        for (task, message) in &summary.failures {
            println!("  {task:<40} error: {message}");
        }
    }
    if args.metrics {
        print!("{}", metrics::export_metrics());
    }
    Ok(())
}

fn run_trace_command(args: TraceArgs) -> anyhow::Result<()> {
    let path = if args.run.is_dir() {
        args.run.join(TRACE_FILE)
    } else {
        args.run.clone()
    };
    let trace = ExecutionTrace::load(&path)
        .with_context(|| format!("Failed to read trace {}", path.display()))?;

    if args.events {
        for event in &trace.events {
            println!("{}", serde_json::to_string(event)?);
        }
        return Ok(());
    }

    println!("Trace:          {}", path.display());
    println!("Events:         {}", trace.events.len());
    if trace.malformed_lines > 0 {
        println!("Malformed:      {}", trace.malformed_lines);
    }
    println!("Transitions:");
    for (from, to) in trace.transitions() {
        println!("  {from} -> {to}");
    }
    for stage in [
        Stage::Provision,
        Stage::Readiness,
        Stage::Mutation,
        Stage::Verification,
        Stage::Teardown,
    ] {
        let commands = trace
            .stage(stage)
            .filter(|e| matches!(e.kind, EventKind::Command { .. }))
            .count();
        let diagnostics: Vec<&str> = trace
            .stage(stage)
            .filter_map(|e| match &e.kind {
                EventKind::Diagnostic { message } => Some(message.as_str()),
                _ => None,
            })
            .collect();
        if commands == 0 && diagnostics.is_empty() {
            continue;
        }
        println!("{stage}: {commands} command(s)");
        for message in diagnostics {
            println!("  ! {message}");
        }
    }
    Ok(())
}

fn build_backend(config: &HarnessConfig) -> anyhow::Result<Arc<dyn Backend>> {
    match config.backend {
        BackendKind::Docker => {
            let client = DockerClient::new()
                .context("Docker backend is unavailable; install Docker or use --backend local")?;
            Ok(Arc::new(
                DockerBackend::new(client, config.network_mode.clone())
                    .with_storage_quota(config.enforce_storage_quota),
            ))
        }
        BackendKind::Local => Ok(Arc::new(LocalBackend::new(
            config.output_dir.join(LOCAL_BUILD_CACHE),
        ))),
    }
}

/// Cancellation flag set on the first Ctrl-C.
fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling runs");
            let _ = tx.send(true);
        }
    });
    rx
}

fn parse_run_id(value: &str) -> Result<String, String> {
    validate_run_id(value)
        .map(|()| value.to_string())
        .map_err(|e| e.to_string())
}

fn print_record(record: &RewardRecord, output_dir: &Path) {
    println!("\n=== Run {} ===", record.run_id);
    println!("Task:           {}", record.task);
    println!("Status:         {}", record.status);
    if let Some(failure) = record.failure {
        println!("Failure:        {failure}");
    }
    println!("Reward:         {:.3} ({})", record.reward, record.reward_mode);
    if let Some(verification) = &record.verification {
        println!(
            "Checks:         {}/{} passed ({})",
            verification.passed_count(),
            verification.outcomes.len(),
            verification.status
        );
        for outcome in &verification.outcomes {
            println!("  {:?}  {}", outcome.status, outcome.id);
        }
    }
    if let Some(diagnostic) = &record.diagnostic {
        println!("Diagnostic:     {diagnostic}");
    }
    println!(
        "Artifacts:      {}",
        output_dir.join(&record.run_id).display()
    );
}

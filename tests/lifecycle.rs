//! End-to-end run lifecycle on the local process backend.

#![cfg(unix)]

mod common;

use std::fs;
use std::time::Duration;

use chrono::Utc;
use common::{command_bundle, http_service_bundle, Workspace, FETCH_SCRIPT, HTTP_SERVICE};
use forge_harness::bundle::load_bundle;
use forge_harness::config::PlatformLimits;
use forge_harness::error::HarnessError;
use forge_harness::reward::{RewardSink, RunJournal, REWARD_FILE, RUN_JOURNAL_FILE};
use forge_harness::run::{FailureKind, RunRequest, RunState, TerminalStatus};
use forge_harness::solution::MutationMode;
use forge_harness::trace::{EventKind, ExecutionTrace, Stage, TRACE_FILE};
use forge_harness::verifier::{CheckStatus, VerificationStatus};
use tokio::sync::watch;

#[tokio::test]
async fn test_passing_run_scores_one() {
    let ws = Workspace::new();
    let backend = ws.backend();
    let harness = ws.harness(&backend);
    let yaml = command_bundle(
        "build-artifact",
        "echo built > artifact.txt",
        &[("artifact_exists", "test -f artifact.txt"), ("content", "grep -q built artifact.txt")],
    );
    let bundle = ws.bundle("build-artifact", &yaml, &[]);

    let record = harness
        .run(&bundle, RunRequest::new().with_run_id("pass-1"))
        .await
        .unwrap();

    assert_eq!(record.status, TerminalStatus::Succeeded);
    assert_eq!(record.reward, 1.0);
    assert_eq!(record.failure, None);
    let verification = record.verification.as_ref().unwrap();
    assert_eq!(verification.status, VerificationStatus::Passed);
    assert_eq!(verification.passed_count(), 2);
    assert_eq!(backend.builds(), 1);
    assert_eq!(backend.live(), 0);

    let run_dir = ws.output_dir().join("pass-1");
    assert!(run_dir.join(REWARD_FILE).is_file());
    let trace = ExecutionTrace::load(&run_dir.join(TRACE_FILE)).unwrap();
    assert!(trace.is_ordered());
    let transitions: Vec<String> = trace.transitions().into_iter().map(|(_, to)| to).collect();
    assert_eq!(
        transitions,
        vec!["building", "built", "ready", "verified", "scored"]
    );
    assert!(trace.stage(Stage::Verification).count() >= 2);
}

#[tokio::test]
async fn test_unready_service_times_out_and_releases_context() {
    let ws = Workspace::new();
    let backend = ws.backend();
    let harness = ws.harness(&backend);
    let mut yaml = command_bundle("never-ready", "true", &[("ok", "true")]);
    yaml.push_str(
        r#"readiness:
  deadline_sec: 1
  checks:
    - name: service
      command: "test -f /nonexistent/ready"
      interval_ms: 100
"#,
    );
    let bundle = ws.bundle("never-ready", &yaml, &[]);

    let record = harness.run(&bundle, RunRequest::new()).await.unwrap();

    assert_eq!(record.status, TerminalStatus::ReadinessTimeout);
    assert_eq!(record.failure, Some(FailureKind::ReadinessTimeout));
    assert_eq!(record.reward, 0.0);
    assert!(record.verification.is_none());
    assert!(record.diagnostic.as_deref().unwrap().contains("service"));
    assert_eq!(backend.live(), 0);
}

#[tokio::test]
async fn test_build_failure_keeps_tool_diagnostic() {
    let ws = Workspace::new();
    let backend = ws.backend();
    let harness = ws.harness(&backend);
    let yaml = command_bundle("broken-build", "echo missing-dependency >&2; exit 3", &[("ok", "true")]);
    let bundle = ws.bundle("broken-build", &yaml, &[]);

    let record = harness.run(&bundle, RunRequest::new()).await.unwrap();

    assert_eq!(record.status, TerminalStatus::ProvisioningFailed);
    assert_eq!(record.failure, Some(FailureKind::BuildFailure));
    assert_eq!(record.reward, 0.0);
    assert!(record
        .diagnostic
        .as_deref()
        .unwrap()
        .contains("missing-dependency"));
    assert_eq!(backend.live(), 0);
}

#[tokio::test]
async fn test_build_timeout() {
    let ws = Workspace::new();
    let backend = ws.backend();
    let harness = ws.harness(&backend);
    let yaml = command_bundle("slow-build", "sleep 30", &[("ok", "true")])
        .replace("build_sec: 30", "build_sec: 1");
    let bundle = ws.bundle("slow-build", &yaml, &[]);

    let started = std::time::Instant::now();
    let record = harness.run(&bundle, RunRequest::new()).await.unwrap();

    assert_eq!(record.status, TerminalStatus::ProvisioningFailed);
    assert_eq!(record.failure, Some(FailureKind::BuildTimeout));
    assert!(started.elapsed() < Duration::from_secs(15));
}

#[tokio::test]
async fn test_partial_reward_on_verifier_timeout() {
    let ws = Workspace::new();
    let backend = ws.backend();
    let harness = ws.harness(&backend);
    let yaml = command_bundle(
        "partial-credit",
        "true",
        &[
            ("a", "true"),
            ("b", "true"),
            ("c", "true"),
            ("d", "sleep 30"),
            ("e", "true"),
        ],
    )
    .replace("verifier_sec: 30", "verifier_sec: 2")
    .replace("verifier:\n", "verifier:\n  reward_mode: partial\n");
    let bundle = ws.bundle("partial-credit", &yaml, &[]);

    let record = harness.run(&bundle, RunRequest::new()).await.unwrap();

    assert_eq!(record.status, TerminalStatus::VerificationFailed);
    assert_eq!(record.failure, Some(FailureKind::VerifierTimeout));
    assert!((record.reward - 0.6).abs() < 1e-9);
    let verification = record.verification.unwrap();
    assert_eq!(verification.status, VerificationStatus::TimedOut);
    assert_eq!(verification.count(CheckStatus::Passed), 3);
    assert_eq!(verification.outcomes[3].status, CheckStatus::Failed);
    assert_eq!(verification.outcomes[4].status, CheckStatus::NotRun);
}

#[tokio::test]
async fn test_concurrent_runs_share_one_build() {
    let ws = Workspace::new();
    let backend = std::sync::Arc::new(
        common::CountingBackend::new(&ws.dir.path().join("builds"))
            .with_build_delay(Duration::from_millis(300)),
    );
    let harness = ws.harness(&backend);
    let yaml = command_bundle("shared", "echo built > artifact.txt", &[("ok", "test -f artifact.txt")]);
    let bundle = ws.bundle("shared", &yaml, &[]);

    let runs = (0..4).map(|i| {
        harness.run(&bundle, RunRequest::new().with_run_id(format!("shared-{i}")))
    });
    let records = futures::future::join_all(runs).await;

    for record in records {
        assert_eq!(record.unwrap().status, TerminalStatus::Succeeded);
    }
    assert_eq!(backend.builds(), 1);
    assert_eq!(harness.provisioner().registry().builds_started(), 1);
    assert_eq!(backend.live(), 0);
}

#[tokio::test]
async fn test_reward_persisted_exactly_once() {
    let ws = Workspace::new();
    let backend = ws.backend();
    let harness = ws.harness(&backend);
    let yaml = command_bundle("once", "true", &[("fails", "false")]);
    let bundle = ws.bundle("once", &yaml, &[]);

    let first = harness
        .run(&bundle, RunRequest::new().with_run_id("once-1"))
        .await
        .unwrap();
    let second = harness
        .run(&bundle, RunRequest::new().with_run_id("once-1"))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(first.status, TerminalStatus::VerificationFailed);
    assert_eq!(first.reward, 0.0);
    assert_eq!(backend.builds(), 1);

    let entries: Vec<_> = fs::read_dir(ws.output_dir().join("once-1"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|name| name.starts_with("reward"))
        .collect();
    assert_eq!(entries, vec![REWARD_FILE.to_string()]);
}

#[tokio::test]
async fn test_invalid_bundle_never_builds() {
    let ws = Workspace::new();
    let backend = ws.backend();
    let yaml = command_bundle("invalid", "true", &[("ok", "true")])
        .replace("cpus: 1", "cpus: 512")
        .replace("agent_sec: 30", "agent_sec: 0");
    let root = ws.write_bundle("invalid", &yaml, &[]);

    let err = load_bundle(&root, &PlatformLimits::default()).unwrap_err();
    let fields: Vec<&str> = err.violations().iter().map(|v| v.field.as_str()).collect();
    assert!(fields.contains(&"resources.cpus"));
    assert!(fields.contains(&"timeouts.agent_sec"));
    assert_eq!(backend.builds(), 0);
}

#[tokio::test]
async fn test_interrupted_run_scores_zero() {
    let ws = Workspace::new();
    let backend = ws.backend();
    let harness = ws.harness(&backend);
    let yaml = command_bundle("interrupted", "true", &[("ok", "true")]);
    let bundle = ws.bundle("interrupted", &yaml, &[]);

    let sink = RewardSink::new(&ws.output_dir(), "crashed-1").unwrap();
    sink.prepare().unwrap();
    sink.record_state(&RunJournal {
        run_id: "crashed-1".to_string(),
        task: "interrupted".to_string(),
        state: RunState::Ready,
        started_at: Utc::now(),
        updated_at: Utc::now(),
    })
    .unwrap();
    assert!(sink.dir().join(RUN_JOURNAL_FILE).is_file());

    let record = harness
        .run(&bundle, RunRequest::new().with_run_id("crashed-1"))
        .await
        .unwrap();

    assert_eq!(record.status, TerminalStatus::VerificationFailed);
    assert_eq!(record.failure, Some(FailureKind::Interrupted));
    assert_eq!(record.reward, 0.0);
    assert_eq!(backend.builds(), 0);
    assert_eq!(sink.load().unwrap(), Some(record));
}

#[tokio::test]
async fn test_cancellation_scores_zero_and_releases_context() {
    let ws = Workspace::new();
    let backend = ws.backend();
    let harness = ws.harness(&backend);
    let mut yaml = command_bundle("cancel-me", "true", &[("ok", "true")]);
    yaml.push_str(
        r#"readiness:
  deadline_sec: 60
  checks:
    - name: never
      command: "false"
"#,
    );
    let bundle = ws.bundle("cancel-me", &yaml, &[]);

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = tx.send(true);
    });

    let started = std::time::Instant::now();
    let record = harness
        .run(&bundle, RunRequest::new().with_cancel(rx))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(record.status, TerminalStatus::ProvisioningFailed);
    assert_eq!(record.failure, Some(FailureKind::Cancelled));
    assert_eq!(record.reward, 0.0);
    assert_eq!(backend.live(), 0);
}

#[tokio::test]
async fn test_reference_solution_fixes_task() {
    let ws = Workspace::new();
    let backend = ws.backend();
    let harness = ws.harness(&backend);
    let yaml = command_bundle("needs-fix", "true", &[("fixed", "grep -q ok fixed.txt")]);
    let bundle = ws.bundle(
        "needs-fix",
        &yaml,
        &[("solution/solve.sh", "echo ok > fixed.txt\n")],
    );

    let unsolved = harness.run(&bundle, RunRequest::new()).await.unwrap();
    assert_eq!(unsolved.status, TerminalStatus::VerificationFailed);
    assert_eq!(unsolved.reward, 0.0);

    let solved = harness
        .run(
            &bundle,
            RunRequest::new().with_mutation(MutationMode::ReferenceSolution),
        )
        .await
        .unwrap();
    assert_eq!(solved.status, TerminalStatus::Succeeded);
    assert_eq!(solved.reward, 1.0);
    assert_eq!(backend.builds(), 1);
}

#[tokio::test]
async fn test_failing_agent_still_verified() {
    let ws = Workspace::new();
    let backend = ws.backend();
    let harness = ws.harness(&backend);
    let yaml = command_bundle("agent-task", "true", &[("touched", "test -f agent.txt")]);
    let bundle = ws.bundle("agent-task", &yaml, &[]);

    let record = harness
        .run(
            &bundle,
            RunRequest::new().with_mutation(MutationMode::Agent {
                command: "touch agent.txt; exit 7".to_string(),
            }),
        )
        .await
        .unwrap();

    assert_eq!(record.status, TerminalStatus::Succeeded);
    assert!(record.diagnostic.as_deref().unwrap().contains("code 7"));
}

#[tokio::test]
async fn test_missing_solution_is_an_error() {
    let ws = Workspace::new();
    let backend = ws.backend();
    let harness = ws.harness(&backend);
    let yaml = command_bundle("no-solution", "true", &[("ok", "true")]);
    let bundle = ws.bundle("no-solution", &yaml, &[]);

    let err = harness
        .run(
            &bundle,
            RunRequest::new().with_mutation(MutationMode::ReferenceSolution),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::MissingSolution(_)));
    assert_eq!(backend.builds(), 0);
}

#[tokio::test]
async fn test_script_verifier_reports_per_check_results() {
    let ws = Workspace::new();
    let backend = ws.backend();
    let harness = ws.harness(&backend);
    let yaml = r#"name: script-task
resources: { cpus: 1, memory_mb: 512, storage_mb: 1024 }
timeouts: { build_sec: 30, agent_sec: 30, verifier_sec: 30 }
environment:
  build_command: "true"
verifier:
  reward_mode: partial
  checks:
    - id: first
    - id: second
      weight: 3
"#;
    let script = r#"#!/bin/bash
echo '{"id": "first", "passed": true}' >> "$FORGE_RESULTS_FILE"
echo '{"id": "second", "passed": false, "message": "wrong answer"}' >> "$FORGE_RESULTS_FILE"
"#;
    let bundle = ws.bundle("script-task", yaml, &[("tests/test.sh", script)]);

    let record = harness.run(&bundle, RunRequest::new()).await.unwrap();

    assert_eq!(record.status, TerminalStatus::VerificationFailed);
    assert!((record.reward - 0.25).abs() < 1e-9);
    let verification = record.verification.unwrap();
    assert_eq!(verification.outcomes.len(), 2);
    assert_eq!(verification.outcomes[1].message.as_deref(), Some("wrong answer"));
}

#[tokio::test]
async fn test_batch_runs_every_bundle() {
    let ws = Workspace::new();
    let backend = ws.backend();
    let harness = forge_harness::run::Harness::new(backend.clone(), ws.config().with_parallel(2));
    let bundles = vec![
        ws.bundle("batch-a", &command_bundle("batch-a", "true", &[("ok", "true")]), &[]),
        ws.bundle("batch-b", &command_bundle("batch-b", "true", &[("ko", "false")]), &[]),
        ws.bundle("batch-c", &command_bundle("batch-c", "exit 1", &[("ok", "true")]), &[]),
    ];

    let summary = harness
        .run_many(&bundles, &RunRequest::new().with_run_id("nightly"))
        .await;

    assert_eq!(summary.total, 3);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.errors, 0);
    assert!((summary.mean_reward - 1.0 / 3.0).abs() < 1e-9);
    assert!(ws.output_dir().join("nightly-batch-a").join(REWARD_FILE).is_file());
    assert_eq!(backend.builds(), 3);
}

#[tokio::test]
async fn test_http_readiness_gates_weighted_checks() {
    let ws = Workspace::new();
    let backend = ws.backend();
    let harness = ws.harness(&backend);
    let yaml = http_service_bundle(
        "http-health",
        "echo ok > health",
        Some(HTTP_SERVICE),
        &[
            ("health_body", "python3 fetch.py health ok"),
            ("health_file", "test -f health"),
        ],
    );
    let bundle = ws.bundle("http-health", &yaml, &[("environment/fetch.py", FETCH_SCRIPT)]);

    let record = harness
        .run(&bundle, RunRequest::new().with_run_id("http-1"))
        .await
        .unwrap();

    assert_eq!(record.status, TerminalStatus::Succeeded);
    assert_eq!(record.reward, 1.0);
    assert_eq!(record.verification.unwrap().passed_count(), 2);
    assert_eq!(backend.live(), 0);

    let trace = ExecutionTrace::load(&ws.output_dir().join("http-1").join(TRACE_FILE)).unwrap();
    assert!(trace.stage(Stage::Readiness).any(|e| matches!(
        &e.kind,
        EventKind::ReadinessProbe { check, ready: true, .. } if check == "health"
    )));
    if cfg!(target_os = "linux") {
        let memory: Vec<u64> = trace
            .events
            .iter()
            .filter_map(|e| match e.kind {
                EventKind::ResourceSample { memory_bytes, .. } => memory_bytes,
                _ => None,
            })
            .collect();
        assert!(!memory.is_empty());
        assert!(memory.iter().any(|bytes| *bytes > 0));
    }
}

#[tokio::test]
async fn test_http_readiness_on_unbound_port_times_out() {
    let ws = Workspace::new();
    let backend = ws.backend();
    let harness = ws.harness(&backend);
    let yaml = http_service_bundle("http-unbound", "true", None, &[("ok", "true")])
        .replace("  deadline_sec: 10\n", "  deadline_sec: 1\n");
    let bundle = ws.bundle("http-unbound", &yaml, &[]);

    let record = harness.run(&bundle, RunRequest::new()).await.unwrap();

    assert_eq!(record.status, TerminalStatus::ReadinessTimeout);
    assert_eq!(record.reward, 0.0);
    assert!(record.verification.is_none());
    assert!(record.diagnostic.as_deref().unwrap().contains("health"));
    assert_eq!(backend.live(), 0);
}

#[tokio::test]
async fn test_concurrent_services_get_their_own_ports() {
    let ws = Workspace::new();
    let backend = ws.backend();
    let harness = ws.harness(&backend);
    let start = format!("echo \"$FORGE_ROOT\" > marker && {HTTP_SERVICE}");
    let yaml = http_service_bundle(
        "http-pair",
        "echo ok > health",
        Some(&start),
        &[("own_service", "python3 fetch.py marker \"$FORGE_ROOT\"")],
    );
    let bundle = ws.bundle("http-pair", &yaml, &[("environment/fetch.py", FETCH_SCRIPT)]);

    let (a, b) = tokio::join!(
        harness.run(&bundle, RunRequest::new().with_run_id("pair-a")),
        harness.run(&bundle, RunRequest::new().with_run_id("pair-b")),
    );

    for record in [a.unwrap(), b.unwrap()] {
        assert_eq!(record.status, TerminalStatus::Succeeded, "{}", record.run_id);
        assert_eq!(record.reward, 1.0);
    }
    assert_eq!(backend.builds(), 1);
    assert_eq!(backend.live(), 0);
}

#[tokio::test]
async fn test_run_id_cannot_escape_output_dir() {
    let ws = Workspace::new();
    let backend = ws.backend();
    let harness = ws.harness(&backend);
    let bundle = ws.bundle(
        "escape",
        &command_bundle("escape", "true", &[("ok", "true")]),
        &[],
    );

    let err = harness
        .run(&bundle, RunRequest::new().with_run_id("../escape"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        HarnessError::Reward(forge_harness::error::RewardError::InvalidRunId(_))
    ));
    assert!(!ws.dir.path().join("escape").exists());
    assert_eq!(backend.builds(), 0);
}

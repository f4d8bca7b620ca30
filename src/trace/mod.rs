//! Execution traces.
//!
//! A trace is an append-only JSON-lines file of timestamped events scoped
//! to one run. Events are produced through a [`TraceHandle`] and written by
//! a background task (see [`logger`]); nothing in the harness ever reads a
//! trace back to make a grading decision.

pub mod logger;

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use logger::{ArtifactLogger, TraceHandle, TraceSummary};

/// File name of the trace inside a run directory.
pub const TRACE_FILE: &str = "trace.jsonl";

/// Run stage an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Run,
    Provision,
    Readiness,
    Mutation,
    Verification,
    Scoring,
    Teardown,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Run => "run",
            Stage::Provision => "provision",
            Stage::Readiness => "readiness",
            Stage::Mutation => "mutation",
            Stage::Verification => "verification",
            Stage::Scoring => "scoring",
            Stage::Teardown => "teardown",
        };
        write!(f, "{s}")
    }
}

/// Output stream of a captured command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Payload of a trace event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    StageTransition {
        from: String,
        to: String,
    },
    Command {
        command: String,
        exit_code: Option<i64>,
        duration_ms: u64,
        timed_out: bool,
    },
    Output {
        stream: OutputStream,
        content: String,
    },
    ResourceSample {
        cpu_percent: Option<f64>,
        memory_bytes: Option<u64>,
    },
    ReadinessProbe {
        check: String,
        attempt: u32,
        ready: bool,
        detail: Option<String>,
    },
    Diagnostic {
        message: String,
    },
}

/// One line of the trace file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Monotonic sequence number within the run, starting at 0.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub stage: Stage,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// A trace read back from disk for offline inspection.
#[derive(Debug, Clone, Default)]
pub struct ExecutionTrace {
    pub events: Vec<TraceEvent>,
    /// Lines that could not be parsed (truncated final line after a crash).
    pub malformed_lines: usize,
}

impl ExecutionTrace {
    /// Loads a trace file, tolerating a torn last line.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut trace = ExecutionTrace::default();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<TraceEvent>(line) {
                Ok(event) => trace.events.push(event),
                Err(_) => trace.malformed_lines += 1,
            }
        }
        Ok(trace)
    }

    /// Returns the events of one stage, in order.
    pub fn stage(&self, stage: Stage) -> impl Iterator<Item = &TraceEvent> {
        self.events.iter().filter(move |e| e.stage == stage)
    }

    /// Returns true if sequence numbers strictly increase.
    pub fn is_ordered(&self) -> bool {
        self.events.windows(2).all(|w| w[0].seq < w[1].seq)
    }

    /// Returns the list of state transitions as `(from, to)` pairs.
    pub fn transitions(&self) -> Vec<(String, String)> {
        self.events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::StageTransition { from, to } => Some((from.clone(), to.clone())),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_event_serialization_is_flat() {
        let event = TraceEvent {
            seq: 3,
            timestamp: Utc::now(),
            run_id: "run-1".to_string(),
            stage: Stage::Verification,
            kind: EventKind::Command {
                command: "pytest".to_string(),
                exit_code: Some(1),
                duration_ms: 42,
                timed_out: false,
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"command\""));
        assert!(json.contains("\"stage\":\"verification\""));
        let back: TraceEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_load_tolerates_torn_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(TRACE_FILE);
        let good = TraceEvent {
            seq: 0,
            timestamp: Utc::now(),
            run_id: "r".to_string(),
            stage: Stage::Run,
            kind: EventKind::Diagnostic {
                message: "hello".to_string(),
            },
        };
        let content = format!("{}\n{{\"seq\":1,\"time", serde_json::to_string(&good).unwrap());
        fs::write(&path, content).unwrap();

        let trace = ExecutionTrace::load(&path).unwrap();
        assert_eq!(trace.events.len(), 1);
        assert_eq!(trace.malformed_lines, 1);
        assert!(trace.is_ordered());
    }
}

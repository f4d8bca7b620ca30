//! Verification results.
//!
//! A [`VerificationResult`] is produced exactly once per run by
//! [`runner::VerifierRunner`] and never mutated afterwards.

pub mod runner;

use serde::{Deserialize, Serialize};

use crate::bundle::CheckSpec;

pub use runner::VerifierRunner;

/// Weight of a check the bundle did not declare.
pub const DEFAULT_CHECK_WEIGHT: f64 = 1.0;
/// Outcome id used when a script reports nothing but its exit status.
pub const ENTRYPOINT_CHECK: &str = "entrypoint";

/// Outcome of one sub-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Failed,
    /// The procedure ended (deadline) before this check ran.
    NotRun,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub id: String,
    pub status: CheckStatus,
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CheckOutcome {
    pub fn not_run(spec: &CheckSpec) -> Self {
        Self {
            id: spec.id.clone(),
            status: CheckStatus::NotRun,
            weight: spec.weight,
            message: None,
        }
    }
}

/// Overall status of the verification procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Completed and every check passed.
    Passed,
    /// Completed with at least one failing check.
    Failed,
    /// The verifier deadline elapsed; outcomes are partial.
    TimedOut,
    /// The procedure could not be started.
    Crashed,
}

impl std::fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VerificationStatus::Passed => "passed",
            VerificationStatus::Failed => "failed",
            VerificationStatus::TimedOut => "timed_out",
            VerificationStatus::Crashed => "crashed",
        };
        write!(f, "{s}")
    }
}

/// Ordered check outcomes plus the overall status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub outcomes: Vec<CheckOutcome>,
    pub status: VerificationStatus,
    pub total_weight: f64,
    #[serde(default)]
    pub duration_ms: u64,
}

impl VerificationResult {
    pub fn new(outcomes: Vec<CheckOutcome>, status: VerificationStatus) -> Self {
        let total_weight = outcomes.iter().map(|o| o.weight).sum();
        Self {
            outcomes,
            status,
            total_weight,
            duration_ms: 0,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Result for a procedure that never started.
    pub fn crashed(declared: &[CheckSpec], message: impl Into<String>) -> Self {
        let message = message.into();
        let outcomes = if declared.is_empty() {
            vec![CheckOutcome {
                id: ENTRYPOINT_CHECK.to_string(),
                status: CheckStatus::NotRun,
                weight: DEFAULT_CHECK_WEIGHT,
                message: Some(message),
            }]
        } else {
            declared
                .iter()
                .map(|spec| CheckOutcome {
                    message: Some(message.clone()),
                    ..CheckOutcome::not_run(spec)
                })
                .collect()
        };
        Self::new(outcomes, VerificationStatus::Crashed)
    }

    pub fn passed_count(&self) -> usize {
        self.count(CheckStatus::Passed)
    }

    pub fn count(&self, status: CheckStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Status for a procedure that ran to completion.
    pub fn completed_status(outcomes: &[CheckOutcome]) -> VerificationStatus {
        if !outcomes.is_empty() && outcomes.iter().all(|o| o.status == CheckStatus::Passed) {
            VerificationStatus::Passed
        } else {
            VerificationStatus::Failed
        }
    }
}

/// One line a script-mode verifier appends to its results file.
#[derive(Debug, Clone, Deserialize)]
struct ResultLine {
    id: String,
    passed: bool,
    #[serde(default)]
    weight: Option<f64>,
    #[serde(default)]
    message: Option<String>,
}

/// Merges a results file with the declared checks.
///
/// Declared checks come first, in declaration order, with their declared
/// weights; declared checks absent from the file are `not_run`. Undeclared
/// ids follow in order of first appearance. When an id is reported twice
/// the last line wins. Returns the outcomes and the number of lines that
/// could not be parsed.
pub fn merge_results(declared: &[CheckSpec], content: &str) -> (Vec<CheckOutcome>, usize) {
    let mut reported: Vec<ResultLine> = Vec::new();
    let mut malformed = 0;

    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match serde_json::from_str::<ResultLine>(line) {
            Ok(parsed) => match reported.iter_mut().find(|r| r.id == parsed.id) {
                Some(existing) => *existing = parsed,
                None => reported.push(parsed),
            },
            Err(_) => malformed += 1,
        }
    }

    let status_of = |line: &ResultLine| {
        if line.passed {
            CheckStatus::Passed
        } else {
            CheckStatus::Failed
        }
    };

    let mut outcomes: Vec<CheckOutcome> = declared
        .iter()
        .map(|spec| match reported.iter().find(|r| r.id == spec.id) {
            Some(line) => CheckOutcome {
                id: spec.id.clone(),
                status: status_of(line),
                weight: spec.weight,
                message: line.message.clone(),
            },
            None => CheckOutcome::not_run(spec),
        })
        .collect();

    for line in &reported {
        if declared.iter().any(|spec| spec.id == line.id) {
            continue;
        }
        let weight = line
            .weight
            .filter(|w| w.is_finite() && *w >= 0.0)
            .unwrap_or(DEFAULT_CHECK_WEIGHT);
        outcomes.push(CheckOutcome {
            id: line.id.clone(),
            status: status_of(line),
            weight,
            message: line.message.clone(),
        });
    }

    (outcomes, malformed)
}

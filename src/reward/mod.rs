//! Reward derivation.
//!
//! [`calculate`] is a pure function of a [`VerificationResult`] and the
//! bundle's declared [`RewardMode`]; persisting the scalar is the job of
//! [`sink::RewardSink`].

pub mod sink;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::verifier::{CheckStatus, VerificationResult, VerificationStatus};

pub use sink::{
    validate_run_id, RewardRecord, RewardSink, RunJournal, REWARD_FILE, RUN_JOURNAL_FILE,
};

/// How a verification result maps to a scalar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardMode {
    /// 1.0 when every check passed, otherwise 0.0.
    #[default]
    Binary,
    /// Weighted share of passing checks.
    Partial,
}

impl fmt::Display for RewardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewardMode::Binary => write!(f, "binary"),
            RewardMode::Partial => write!(f, "partial"),
        }
    }
}

impl FromStr for RewardMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binary" => Ok(RewardMode::Binary),
            "partial" => Ok(RewardMode::Partial),
            other => Err(format!("unknown reward mode '{other}' (expected binary or partial)")),
        }
    }
}

/// Maps a verification result to a reward in `[0.0, 1.0]`.
///
/// - A verifier that could not be started yields 0.0.
/// - `Binary`: 1.0 iff the procedure completed and every check passed.
/// - `Partial`: passed weight over total weight, where checks that never
///   ran still count towards the total. With zero total weight the result
///   falls back to the binary rule.
pub fn calculate(result: &VerificationResult, mode: RewardMode) -> f64 {
    let passed = result.status == VerificationStatus::Passed;
    let binary = if passed { 1.0 } else { 0.0 };

    match (result.status, mode) {
        (VerificationStatus::Crashed, _) => 0.0,
        (_, RewardMode::Binary) => binary,
        (_, RewardMode::Partial) => {
            let total: f64 = result.outcomes.iter().map(|o| o.weight).sum();
            if total <= 0.0 || !total.is_finite() {
                return binary;
            }
            let earned: f64 = result
                .outcomes
                .iter()
                .filter(|o| o.status == CheckStatus::Passed)
                .map(|o| o.weight)
                .sum();
            (earned / total).clamp(0.0, 1.0)
        }
    }
}

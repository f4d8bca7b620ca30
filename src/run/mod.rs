//! Per-run state machine and orchestration.
//!
//! ```text
//! unbuilt → building → built → ready → verified → scored
//!              ↓          ↓
//!        build_failed  readiness_failed ──→ scored
//! ```
//!
//! Any non-terminal state may also move to `cancelled`. Every failure
//! state still ends in `scored`: a run is done only once its reward is
//! persisted.

pub mod harness;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::HarnessError;

pub use harness::{BatchSummary, Harness, RunRequest};

/// Lifecycle position of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Unbuilt,
    Building,
    Built,
    Ready,
    Verified,
    Scored,
    BuildFailed,
    ReadinessFailed,
    Cancelled,
}

impl RunState {
    /// Returns true if `next` is a legal successor of `self`.
    pub fn can_advance(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Unbuilt, Building)
                | (Building, Built)
                | (Building, BuildFailed)
                | (Built, Ready)
                | (Built, ReadinessFailed)
                | (Ready, Verified)
                | (Verified, Scored)
                | (BuildFailed, Scored)
                | (ReadinessFailed, Scored)
                | (Cancelled, Scored)
                | (Unbuilt | Building | Built | Ready, Cancelled)
        )
    }

    /// Moves to `next`, rejecting illegal transitions.
    pub fn advance(&mut self, next: RunState) -> Result<(), HarnessError> {
        if !self.can_advance(next) {
            return Err(HarnessError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }

    pub fn is_terminal(self) -> bool {
        self == RunState::Scored
    }

    /// True once the context has passed readiness.
    pub fn reached_ready(self) -> bool {
        matches!(self, RunState::Ready | RunState::Verified | RunState::Scored)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Unbuilt => "unbuilt",
            RunState::Building => "building",
            RunState::Built => "built",
            RunState::Ready => "ready",
            RunState::Verified => "verified",
            RunState::Scored => "scored",
            RunState::BuildFailed => "build_failed",
            RunState::ReadinessFailed => "readiness_failed",
            RunState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Externally observable end state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Succeeded,
    VerificationFailed,
    ProvisioningFailed,
    ReadinessTimeout,
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminalStatus::Succeeded => "succeeded",
            TerminalStatus::VerificationFailed => "verification_failed",
            TerminalStatus::ProvisioningFailed => "provisioning_failed",
            TerminalStatus::ReadinessTimeout => "readiness_timeout",
        };
        write!(f, "{s}")
    }
}

/// Finer-grained reason attached to a non-successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    BuildFailure,
    BuildTimeout,
    ReadinessTimeout,
    VerifierTimeout,
    VerifierCrash,
    Cancelled,
    /// A previous attempt died before persisting its reward.
    Interrupted,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::BuildFailure => "build_failure",
            FailureKind::BuildTimeout => "build_timeout",
            FailureKind::ReadinessTimeout => "readiness_timeout",
            FailureKind::VerifierTimeout => "verifier_timeout",
            FailureKind::VerifierCrash => "verifier_crash",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Interrupted => "interrupted",
        };
        write!(f, "{s}")
    }
}

/// Status assigned when a run stops at `state` without a verification result.
pub fn status_for_abort(state: RunState) -> TerminalStatus {
    if state.reached_ready() {
        TerminalStatus::VerificationFailed
    } else {
        TerminalStatus::ProvisioningFailed
    }
}

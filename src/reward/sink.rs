//! Durable, write-once reward persistence.
//!
//! Each run owns `<output>/<run_id>/`. The reward record is written to
//! `reward.json` through a temp file renamed with `persist_noclobber`, so a
//! reader sees either nothing or the complete record, and a second write
//! for the same run fails instead of overwriting. `run.json` journals the
//! last state the run reached so a crashed attempt can be detected.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::RewardMode;
use crate::error::RewardError;
use crate::run::{FailureKind, RunState, TerminalStatus};
use crate::trace::TRACE_FILE;
use crate::verifier::VerificationResult;

/// Reward record file name inside a run directory.
pub const REWARD_FILE: &str = "reward.json";
/// Run journal file name inside a run directory.
pub const RUN_JOURNAL_FILE: &str = "run.json";
/// Longest accepted run id; it becomes a single path component.
const MAX_RUN_ID_LEN: usize = 255;

/// Everything a caller learns about a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardRecord {
    pub run_id: String,
    pub task: String,
    pub status: TerminalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Scalar in `[0.0, 1.0]`.
    pub reward: f64,
    pub reward_mode: RewardMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Last state a run reached, rewritten on every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunJournal {
    pub run_id: String,
    pub task: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A run's output directory.
#[derive(Debug, Clone)]
pub struct RewardSink {
    run_id: String,
    dir: PathBuf,
}

/// Checks that `run_id` names a single directory under the output root:
/// a letter or digit, then letters, digits, `.`, `_` or `-`.
pub fn validate_run_id(run_id: &str) -> Result<(), RewardError> {
    let mut chars = run_id.chars();
    let valid = run_id.len() <= MAX_RUN_ID_LEN
        && chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(RewardError::InvalidRunId(run_id.to_string()))
    }
}

impl RewardSink {
    /// # Errors
    ///
    /// `RewardError::InvalidRunId` if `run_id` could escape `output_dir`.
    pub fn new(output_dir: &Path, run_id: impl Into<String>) -> Result<Self, RewardError> {
        let run_id = run_id.into();
        validate_run_id(&run_id)?;
        Ok(Self {
            dir: output_dir.join(&run_id),
            run_id,
        })
    }

    /// Creates the run directory.
    pub fn prepare(&self) -> Result<(), RewardError> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn reward_path(&self) -> PathBuf {
        self.dir.join(REWARD_FILE)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.dir.join(RUN_JOURNAL_FILE)
    }

    pub fn trace_path(&self) -> PathBuf {
        self.dir.join(TRACE_FILE)
    }

    /// Returns the persisted record, if any.
    pub fn load(&self) -> Result<Option<RewardRecord>, RewardError> {
        read_json(&self.reward_path())
    }

    /// Returns the journal left by a previous attempt, if any.
    pub fn read_journal(&self) -> Result<Option<RunJournal>, RewardError> {
        read_json(&self.journal_path())
    }

    /// Writes the reward record exactly once.
    ///
    /// # Errors
    ///
    /// `RewardError::AlreadyPersisted` if a record already exists.
    pub fn persist(&self, record: &RewardRecord) -> Result<(), RewardError> {
        if !(0.0..=1.0).contains(&record.reward) {
            return Err(RewardError::Persist(format!(
                "reward {} outside [0, 1]",
                record.reward
            )));
        }
        let tmp = self.write_temp(record)?;
        match tmp.persist_noclobber(self.reward_path()) {
            Ok(_) => {
                info!(
                    run_id = %self.run_id,
                    status = %record.status,
                    reward = record.reward,
                    "Reward persisted"
                );
                Ok(())
            }
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(RewardError::AlreadyPersisted(self.run_id.clone()))
            }
            Err(e) => Err(RewardError::Persist(e.error.to_string())),
        }
    }

    /// Atomically replaces the journal.
    pub fn record_state(&self, journal: &RunJournal) -> Result<(), RewardError> {
        let tmp = self.write_temp(journal)?;
        tmp.persist(self.journal_path())
            .map_err(|e| RewardError::Persist(e.error.to_string()))?;
        debug!(run_id = %self.run_id, state = %journal.state, "Journal updated");
        Ok(())
    }

    fn write_temp<T: Serialize>(&self, value: &T) -> Result<NamedTempFile, RewardError> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(&mut tmp, value)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, RewardError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

//! Recording helpers used throughout the harness.
//!
//! Every helper is a no-op until [`init_metrics`](super::init_metrics) has
//! been called, so library users that never export metrics pay nothing.

use super::prometheus::{ACTIVE_RUNS, BUILDS_TOTAL, REWARD, RUNS_TOTAL, STAGE_DURATION};

/// Records a finished run and its reward.
pub fn record_run(status: &str, reward: f64) {
    if let Some(runs) = RUNS_TOTAL.get() {
        runs.with_label_values(&[status]).inc();
    }
    if let Some(hist) = REWARD.get() {
        hist.observe(reward);
    }
}

/// Records how long a stage took.
pub fn record_stage_duration(stage: &str, seconds: f64) {
    if let Some(hist) = STAGE_DURATION.get() {
        hist.with_label_values(&[stage]).observe(seconds);
    }
}

/// Records an executed build.
pub fn record_build(outcome: &str) {
    if let Some(builds) = BUILDS_TOTAL.get() {
        builds.with_label_values(&[outcome]).inc();
    }
}

/// Tracks in-flight runs. The returned guard decrements on drop, so a run
/// future that is dropped midway is still accounted for.
pub fn run_started() -> ActiveRunGuard {
    if let Some(gauge) = ACTIVE_RUNS.get() {
        gauge.inc();
    }
    ActiveRunGuard { _private: () }
}

/// Decrements the active-runs gauge when dropped.
#[derive(Debug)]
pub struct ActiveRunGuard {
    _private: (),
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        if let Some(gauge) = ACTIVE_RUNS.get() {
            gauge.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_recording_helpers() {
        let _ = init_metrics();
        record_run("readiness_timeout", 0.0);
        record_stage_duration("readiness", 1.5);
        record_build("timeout");
        {
            let _guard = run_started();
        }

        let text = export_metrics();
        assert!(text.contains("status=\"readiness_timeout\""));
        assert!(text.contains("stage=\"readiness\""));
        assert!(text.contains("outcome=\"timeout\""));
        assert!(text.contains("forge_harness_reward"));
    }
}

//! Metrics module for Prometheus-based monitoring.
//!
//! Counts finished runs by terminal status, executed builds by outcome,
//! stage durations and the reward distribution.
//!
//! # Example
//!
//! ```ignore
//! use forge_harness::metrics::{init_metrics, export_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! // ... run tasks ...
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use self::collectors::{
    record_build, record_run, record_stage_duration, run_started, ActiveRunGuard,
};
pub use self::prometheus::{
    export_metrics, init_metrics, ACTIVE_RUNS, BUILDS_TOTAL, REGISTRY, REWARD, RUNS_TOTAL,
    STAGE_DURATION,
};

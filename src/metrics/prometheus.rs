//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by forge-harness and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all forge-harness metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Finished runs, labeled by terminal status.
pub static RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage duration in seconds, labeled by stage.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Builds actually executed, labeled by outcome (success, failure, timeout).
pub static BUILDS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Distribution of persisted rewards.
pub static REWARD: OnceLock<Histogram> = OnceLock::new();

/// Runs currently in flight.
pub static ACTIVE_RUNS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording helpers are no-ops until this has run.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let runs_total = CounterVec::new(
        Opts::new("forge_harness_runs_total", "Total number of finished runs"),
        &["status"],
    )?;

    let stage_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "forge_harness_stage_duration_seconds",
            "Run stage duration in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 3600.0]),
        &["stage"],
    )?;

    let builds_total = CounterVec::new(
        Opts::new("forge_harness_builds_total", "Total number of executed builds"),
        &["outcome"],
    )?;

    let reward = Histogram::with_opts(
        prometheus::HistogramOpts::new("forge_harness_reward", "Distribution of persisted rewards")
            .buckets(vec![0.0, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]),
    )?;

    let active_runs = Gauge::new("forge_harness_active_runs", "Number of runs in flight")?;

    registry.register(Box::new(runs_total.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(builds_total.clone()))?;
    registry.register(Box::new(reward.clone()))?;
    registry.register(Box::new(active_runs.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = RUNS_TOTAL.set(runs_total);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = BUILDS_TOTAL.set(builds_total);
    let _ = REWARD.set(reward);
    let _ = ACTIVE_RUNS.set(active_runs);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();
        if let Some(runs) = RUNS_TOTAL.get() {
            runs.with_label_values(&["succeeded"]).inc();
        }
        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("forge_harness_runs_total"));
    }
}

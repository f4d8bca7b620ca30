//! Resource limits for runtime contexts.
//!
//! Converts a bundle's declared [`ResourceLimits`] into the units the
//! Docker Engine API expects.

use serde::{Deserialize, Serialize};

use crate::bundle::ResourceLimits;

/// Process ceiling applied to every context.
const DEFAULT_MAX_PROCESSES: u64 = 1024;

/// Execution resource limits for a container.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Memory limit in megabytes.
    pub memory_mb: u64,
    /// CPU cores available (e.g., 0.5, 1.0, 2.0).
    pub cpu_cores: f64,
    /// Root filesystem size limit in megabytes.
    pub storage_mb: u64,
    /// Maximum number of processes allowed.
    pub max_processes: u64,
}

impl From<&ResourceLimits> for ExecutionLimits {
    fn from(limits: &ResourceLimits) -> Self {
        Self {
            memory_mb: limits.memory_mb,
            cpu_cores: limits.cpus,
            storage_mb: limits.storage_mb,
            max_processes: DEFAULT_MAX_PROCESSES,
        }
    }
}

impl ExecutionLimits {
    /// Returns memory limit in bytes.
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb * 1024 * 1024) as i64
    }

    /// Returns CPU period in microseconds (fixed at 100ms).
    pub fn cpu_period(&self) -> i64 {
        100_000
    }

    /// Returns CPU quota based on cores allocated.
    ///
    /// Formula: quota = period * cores
    /// e.g., 1.0 core = 100000 quota (100% of one CPU)
    pub fn cpu_quota(&self) -> i64 {
        (self.cpu_period() as f64 * self.cpu_cores) as i64
    }

    /// Storage limit in the `storage_opt` size format.
    pub fn storage_size(&self) -> String {
        format!("{}M", self.storage_mb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(cpus: f64, memory_mb: u64, storage_mb: u64) -> ExecutionLimits {
        ExecutionLimits::from(&ResourceLimits {
            cpus,
            memory_mb,
            storage_mb,
            extra: Default::default(),
        })
    }

    #[test]
    fn test_memory_bytes_conversion() {
        assert_eq!(limits(1.0, 512, 1024).memory_bytes(), 512 * 1024 * 1024);
    }

    #[test]
    fn test_cpu_quota_calculation() {
        let l = limits(2.0, 512, 1024);
        assert_eq!(l.cpu_period(), 100_000);
        assert_eq!(l.cpu_quota(), 200_000);
        assert_eq!(limits(0.5, 512, 1024).cpu_quota(), 50_000);
    }

    #[test]
    fn test_storage_size() {
        assert_eq!(limits(1.0, 512, 10240).storage_size(), "10240M");
        assert_eq!(limits(1.0, 512, 10240).max_processes, DEFAULT_MAX_PROCESSES);
    }
}

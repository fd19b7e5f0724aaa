//! Health snapshot types
//!
//! Collected by the agent, passed through the broker verbatim. The broker
//! never interprets these values; threshold policy lives with whatever
//! consumes the control surface.

use serde::{Deserialize, Serialize};

/// A health snapshot, condensed or full
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MetricsReport {
    /// Condensed snapshot
    Summary(MetricsSummary),
    /// Full per-core/per-mount/per-interface detail
    Full(MetricsFull),
}

/// Condensed health snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSummary {
    /// System load average (1 minute)
    pub load_avg_1m: f64,
    /// Memory usage percentage (0-100)
    pub memory_percent: f32,
    /// Disk usage percentage of the root mount (0-100)
    pub disk_percent: f32,
    /// System uptime in seconds
    pub uptime_secs: u64,
}

/// Full health snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsFull {
    /// Condensed values, always present
    pub summary: MetricsSummary,
    /// Per-core CPU usage percentages
    pub cpus: Vec<CpuMetrics>,
    /// Per-mount disk usage
    pub mounts: Vec<MountMetrics>,
    /// Per-interface network counters
    pub interfaces: Vec<InterfaceMetrics>,
    /// Total memory in bytes
    pub memory_total: u64,
    /// Used memory in bytes
    pub memory_used: u64,
}

/// Usage of a single CPU core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuMetrics {
    /// Core name (e.g. "cpu0")
    pub name: String,
    /// Usage percentage (0-100)
    pub usage_percent: f32,
}

/// Usage of a single mount point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountMetrics {
    /// Mount point path
    pub mount_point: String,
    /// Total space in bytes
    pub total: u64,
    /// Available space in bytes
    pub available: u64,
}

/// Counters for a single network interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceMetrics {
    /// Interface name
    pub name: String,
    /// Total bytes received
    pub rx_bytes: u64,
    /// Total bytes transmitted
    pub tx_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_serde_roundtrip() {
        let report = MetricsReport::Summary(MetricsSummary {
            load_avg_1m: 0.42,
            memory_percent: 61.5,
            disk_percent: 80.0,
            uptime_secs: 86400,
        });

        let bytes = bincode::serialize(&report).unwrap();
        let decoded: MetricsReport = bincode::deserialize(&bytes).unwrap();

        match decoded {
            MetricsReport::Summary(s) => {
                assert_eq!(s.uptime_secs, 86400);
                assert!((s.load_avg_1m - 0.42).abs() < f64::EPSILON);
            }
            _ => panic!("Wrong variant"),
        }
    }
}

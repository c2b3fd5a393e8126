//! Telemetry and metrics collection

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};

use crate::models::deployment::{DeploymentStatus, DeviceStatus};

/// Rollout counters injected into the orchestrator and the executor
pub trait RolloutMetrics: Send + Sync {
    fn batch_dispatched(&self, devices: usize);
    fn report_received(&self, status: DeviceStatus);
    fn report_ignored(&self);
    fn deployment_finished(&self, status: DeploymentStatus);
    fn bytes_downloaded(&self, bytes: u64);
    fn update_finished(&self, status: DeviceStatus);
    fn rollback_performed(&self);
}

/// Metrics sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl RolloutMetrics for NoopMetrics {
    fn batch_dispatched(&self, _devices: usize) {}
    fn report_received(&self, _status: DeviceStatus) {}
    fn report_ignored(&self) {}
    fn deployment_finished(&self, _status: DeploymentStatus) {}
    fn bytes_downloaded(&self, _bytes: u64) {}
    fn update_finished(&self, _status: DeviceStatus) {}
    fn rollback_performed(&self) {}
}

/// In-process counters
#[derive(Debug, Default)]
pub struct AtomicRolloutMetrics {
    batches_dispatched: AtomicU64,
    devices_dispatched: AtomicU64,
    reports_received: AtomicU64,
    reports_ignored: AtomicU64,
    deployments_completed: AtomicU64,
    deployments_rolled_back: AtomicU64,
    deployments_other: AtomicU64,
    bytes_downloaded: AtomicU64,
    updates_installed: AtomicU64,
    updates_failed: AtomicU64,
    rollbacks: AtomicU64,
}

/// Point-in-time copy of [`AtomicRolloutMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub batches_dispatched: u64,
    pub devices_dispatched: u64,
    pub reports_received: u64,
    pub reports_ignored: u64,
    pub deployments_completed: u64,
    pub deployments_rolled_back: u64,
    pub deployments_other: u64,
    pub bytes_downloaded: u64,
    pub updates_installed: u64,
    pub updates_failed: u64,
    pub rollbacks: u64,
}

impl AtomicRolloutMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            devices_dispatched: self.devices_dispatched.load(Ordering::Relaxed),
            reports_received: self.reports_received.load(Ordering::Relaxed),
            reports_ignored: self.reports_ignored.load(Ordering::Relaxed),
            deployments_completed: self.deployments_completed.load(Ordering::Relaxed),
            deployments_rolled_back: self.deployments_rolled_back.load(Ordering::Relaxed),
            deployments_other: self.deployments_other.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            updates_installed: self.updates_installed.load(Ordering::Relaxed),
            updates_failed: self.updates_failed.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }
}

impl RolloutMetrics for AtomicRolloutMetrics {
    fn batch_dispatched(&self, devices: usize) {
        self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
        self.devices_dispatched
            .fetch_add(devices as u64, Ordering::Relaxed);
    }

    fn report_received(&self, _status: DeviceStatus) {
        self.reports_received.fetch_add(1, Ordering::Relaxed);
    }

    fn report_ignored(&self) {
        self.reports_ignored.fetch_add(1, Ordering::Relaxed);
    }

    fn deployment_finished(&self, status: DeploymentStatus) {
        let counter = match status {
            DeploymentStatus::Completed => &self.deployments_completed,
            DeploymentStatus::RolledBack => &self.deployments_rolled_back,
            _ => &self.deployments_other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn bytes_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    fn update_finished(&self, status: DeviceStatus) {
        match status {
            DeviceStatus::Installed => self.updates_installed.fetch_add(1, Ordering::Relaxed),
            _ => self.updates_failed.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn rollback_performed(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }
}

/// System metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetrics {
    /// CPU usage percentage (0-100)
    pub cpu_usage: f32,

    /// Memory usage in bytes
    pub memory_used: u64,

    /// Total memory in bytes
    pub memory_total: u64,

    /// Memory usage percentage
    pub memory_percent: f32,

    /// Disk usage in bytes
    pub disk_used: u64,

    /// Total disk space in bytes
    pub disk_total: u64,

    /// Disk usage percentage
    pub disk_percent: f32,

    /// System uptime in seconds
    pub uptime_secs: u64,

    /// Hostname
    pub hostname: String,
}

/// Collect system metrics.
///
/// Blocking; call through `spawn_blocking` from async code.
pub fn collect_system_metrics() -> SystemMetrics {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu_usage();

    let disks = Disks::new_with_refreshed_list();
    let (disk_used, disk_total) = disks.iter().fold((0u64, 0u64), |(used, total), disk| {
        (
            used + disk.total_space().saturating_sub(disk.available_space()),
            total + disk.total_space(),
        )
    });

    let memory_used = sys.used_memory();
    let memory_total = sys.total_memory();

    SystemMetrics {
        cpu_usage: sys.global_cpu_usage(),
        memory_used,
        memory_total,
        memory_percent: percent(memory_used, memory_total),
        disk_used,
        disk_total,
        disk_percent: percent(disk_used, disk_total),
        uptime_secs: System::uptime(),
        hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
    }
}

fn percent(used: u64, total: u64) -> f32 {
    if total > 0 {
        (used as f32 / total as f32) * 100.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_metrics_snapshot() {
        let metrics = AtomicRolloutMetrics::new();
        metrics.batch_dispatched(3);
        metrics.batch_dispatched(2);
        metrics.report_received(DeviceStatus::Installed);
        metrics.report_ignored();
        metrics.deployment_finished(DeploymentStatus::RolledBack);
        metrics.update_finished(DeviceStatus::Failed);
        metrics.bytes_downloaded(512);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.batches_dispatched, 2);
        assert_eq!(snapshot.devices_dispatched, 5);
        assert_eq!(snapshot.reports_received, 1);
        assert_eq!(snapshot.reports_ignored, 1);
        assert_eq!(snapshot.deployments_rolled_back, 1);
        assert_eq!(snapshot.updates_failed, 1);
        assert_eq!(snapshot.bytes_downloaded, 512);
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(50, 200), 25.0);
    }
}

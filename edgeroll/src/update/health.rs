//! Post-install health checks
//!
//! Checks run concurrently, each under its own timeout. A failing or timed
//! out critical check fails the pass; non-critical failures are recorded.

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::FleetError;
use crate::telemetry::{collect_system_metrics, SystemMetrics};

type CheckFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A named, timeout-bound check
#[derive(Clone)]
pub struct HealthCheck {
    pub name: String,
    pub critical: bool,
    pub timeout: Duration,
    check: CheckFn,
}

impl HealthCheck {
    pub fn new<F, Fut>(name: &str, critical: bool, timeout: Duration, check: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            critical,
            timeout,
            check: Arc::new(move || check().boxed()),
        }
    }
}

impl std::fmt::Debug for HealthCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheck")
            .field("name", &self.name)
            .field("critical", &self.critical)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Outcome of one check
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub critical: bool,
    pub passed: bool,
    pub message: Option<String>,
    pub duration_ms: u64,
}

/// Outcome of a full pass, in registration order
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub checks: Vec<CheckResult>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// First failed critical check in registration order
    pub fn first_critical_failure(&self) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.critical && !c.passed)
    }
}

/// Limits of the built-in checks
#[derive(Debug, Clone)]
pub struct DefaultCheckOptions {
    /// Fail `disk_space` above this usage percentage
    pub max_disk_percent: f32,

    /// Fail `memory_usage` above this usage percentage
    pub max_memory_percent: f32,

    pub timeout: Duration,
}

impl Default for DefaultCheckOptions {
    fn default() -> Self {
        Self {
            max_disk_percent: 95.0,
            max_memory_percent: 90.0,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Registry of health checks
#[derive(Debug, Default)]
pub struct HealthChecker {
    checks: RwLock<Vec<HealthCheck>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checker with `disk_space` (critical) and `memory_usage` registered
    pub fn with_default_checks(options: DefaultCheckOptions) -> Self {
        let checker = Self::new();

        let max_disk = options.max_disk_percent;
        checker.register(HealthCheck::new("disk_space", true, options.timeout, move || async move {
            let metrics = system_metrics().await?;
            if metrics.disk_percent > max_disk {
                anyhow::bail!("disk {:.1}% used, limit {:.1}%", metrics.disk_percent, max_disk);
            }
            Ok(())
        }));

        let max_memory = options.max_memory_percent;
        checker.register(HealthCheck::new("memory_usage", false, options.timeout, move || async move {
            let metrics = system_metrics().await?;
            if metrics.memory_percent > max_memory {
                anyhow::bail!(
                    "memory {:.1}% used, limit {:.1}%",
                    metrics.memory_percent,
                    max_memory
                );
            }
            Ok(())
        }));

        checker
    }

    pub fn register(&self, check: HealthCheck) {
        debug!(check = %check.name, critical = check.critical, "Health check registered");
        self.checks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(check);
    }

    pub fn len(&self) -> usize {
        self.checks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every check and collect the results
    pub async fn run_checks(&self) -> HealthReport {
        let checks = self
            .checks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let results = join_all(checks.iter().map(run_check)).await;
        let healthy = results.iter().all(|r| r.passed || !r.critical);
        HealthReport {
            healthy,
            checks: results,
            checked_at: Utc::now(),
        }
    }

    /// Run every check, failing on the first critical failure
    pub async fn check_health(&self) -> Result<HealthReport, FleetError> {
        let report = self.run_checks().await;
        for failed in report.checks.iter().filter(|c| !c.passed && !c.critical) {
            warn!(check = %failed.name, "Non-critical health check failed: {}", failed.message.as_deref().unwrap_or(""));
        }
        if let Some(failed) = report.first_critical_failure() {
            return Err(FleetError::HealthCheckFailure(format!(
                "{}: {}",
                failed.name,
                failed.message.as_deref().unwrap_or("failed")
            )));
        }
        Ok(report)
    }
}

async fn run_check(check: &HealthCheck) -> CheckResult {
    let started = Instant::now();
    let outcome = tokio::time::timeout(check.timeout, (check.check)()).await;
    let (passed, message) = match outcome {
        Ok(Ok(())) => (true, None),
        Ok(Err(e)) => (false, Some(e.to_string())),
        Err(_) => (false, Some(format!("timed out after {:?}", check.timeout))),
    };
    CheckResult {
        name: check.name.clone(),
        critical: check.critical,
        passed,
        message,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

async fn system_metrics() -> anyhow::Result<SystemMetrics> {
    Ok(tokio::task::spawn_blocking(collect_system_metrics).await?)
}

//! Rollout strategy definitions

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::FleetError;

/// How a deployment is rolled out across its target devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Strategy {
    /// Dispatch every device at once
    Immediate,

    /// Dispatch in fixed-size batches
    Rolling(RollingConfig),

    /// Validate on a small subset before the full rollout
    Canary(CanaryConfig),
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Rolling(RollingConfig::default())
    }
}

impl Strategy {
    /// Short name used in logs and campaign records
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Immediate => "immediate",
            Strategy::Rolling(_) => "rolling",
            Strategy::Canary(_) => "canary",
        }
    }

    /// Validate the strategy bounds
    pub fn validate(&self) -> Result<(), FleetError> {
        match self {
            Strategy::Immediate => Ok(()),
            Strategy::Rolling(cfg) => {
                if cfg.batch_size == 0 {
                    return Err(FleetError::InvalidInput(
                        "rolling batch_size must be at least 1".to_string(),
                    ));
                }
                if cfg.max_failure_percentage > 100 {
                    return Err(FleetError::InvalidInput(
                        "rolling max_failure_percentage must be within 0..=100".to_string(),
                    ));
                }
                Ok(())
            }
            Strategy::Canary(cfg) => {
                if cfg.canary_percentage == 0 || cfg.canary_percentage > 100 {
                    return Err(FleetError::InvalidInput(
                        "canary_percentage must be within 1..=100".to_string(),
                    ));
                }
                if cfg.success_threshold > 100 {
                    return Err(FleetError::InvalidInput(
                        "canary success_threshold must be within 0..=100".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Failed-device percentage above which the rollout is aborted
    pub fn abort_threshold(&self, default_threshold: u32) -> u32 {
        match self {
            Strategy::Immediate => default_threshold,
            Strategy::Rolling(cfg) => cfg.max_failure_percentage,
            Strategy::Canary(cfg) => 100u32.saturating_sub(cfg.success_threshold),
        }
    }
}

/// Configuration for rolling updates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingConfig {
    /// Number of devices dispatched per batch
    pub batch_size: u32,

    /// Upper bound on devices updating at once (0 = no extra bound)
    #[serde(default)]
    pub max_unavailable: u32,

    /// Stragglers of the previous batch tolerated while the next one starts
    #[serde(default)]
    pub max_surge: u32,

    /// Abort once more than this percentage of target devices failed
    #[serde(default = "default_max_failure_percentage")]
    pub max_failure_percentage: u32,
}

fn default_max_failure_percentage() -> u32 {
    25
}

impl Default for RollingConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            max_unavailable: 1,
            max_surge: 0,
            max_failure_percentage: default_max_failure_percentage(),
        }
    }
}

impl RollingConfig {
    /// Devices released per batch once `max_unavailable` is applied
    pub fn effective_batch_size(&self) -> usize {
        let batch = self.batch_size.max(1);
        let capped = if self.max_unavailable > 0 {
            batch.min(self.max_unavailable)
        } else {
            batch
        };
        capped as usize
    }

    /// Ceiling on devices in flight at any moment
    pub fn max_in_flight(&self) -> usize {
        (self.batch_size.max(1) + self.max_surge) as usize
    }
}

/// Configuration for canary rollouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanaryConfig {
    /// Percentage of target devices in the canary batch (1-100)
    pub canary_percentage: u32,

    /// How long the settled canary batch is observed, in milliseconds
    #[serde(default = "default_validation_duration_ms")]
    pub validation_duration_ms: u64,

    /// Dispatch the remaining devices without operator confirmation
    #[serde(default = "default_true")]
    pub auto_promote: bool,

    /// Minimum canary success rate (percentage) required to promote
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_validation_duration_ms() -> u64 {
    5 * 60 * 1000
}

fn default_true() -> bool {
    true
}

fn default_success_threshold() -> u32 {
    90
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            canary_percentage: 10,
            validation_duration_ms: default_validation_duration_ms(),
            auto_promote: true,
            success_threshold: default_success_threshold(),
        }
    }
}

impl CanaryConfig {
    /// Observation window after the canary batch settles
    pub fn validation_duration(&self) -> Duration {
        Duration::from_millis(self.validation_duration_ms)
    }

    /// Size of the canary batch for `total` target devices
    pub fn canary_count(&self, total: usize) -> usize {
        if total == 0 {
            return 0;
        }
        let count = (total * self.canary_percentage as usize).div_ceil(100);
        count.clamp(1, total)
    }
}

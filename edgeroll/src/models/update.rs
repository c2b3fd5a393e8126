//! Device-side update models

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::deployment::DeviceStatus;

/// Kind of update unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    #[default]
    Application,
    Firmware,
    Config,
    System,
}

/// Scheduling priority of an update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

/// A single update executed by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub id: String,
    pub version: String,
    #[serde(default, rename = "type")]
    pub update_type: UpdateType,
    #[serde(default)]
    pub priority: Priority,
    pub url: String,
    pub checksum: String,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default = "default_true")]
    pub rollback_enabled: bool,
    #[serde(default)]
    pub pre_script: Option<String>,
    #[serde(default)]
    pub post_script: Option<String>,

    /// Free-form metadata; `artifact_name` names the installed file
    #[serde(default)]
    pub manifest: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl Update {
    /// File name of the artifact inside the active set
    pub fn artifact_name(&self) -> String {
        self.manifest
            .get("artifact_name")
            .cloned()
            .unwrap_or_else(|| "artifact".to_string())
    }
}

/// Campaign and deployment a device report belongs to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportTarget {
    pub campaign_id: String,
    #[serde(default)]
    pub deployment_id: Option<String>,
}

/// Status transition pushed from a device to the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub device_id: String,
    pub campaign_id: String,
    #[serde(default)]
    pub deployment_id: Option<String>,
    pub status: DeviceStatus,
    pub progress: u8,
    #[serde(default)]
    pub error_message: Option<String>,
    pub reported_at: DateTime<Utc>,
}

/// Executor state persisted across restarts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateState {
    pub update_id: String,
    pub version: String,
    pub status: DeviceStatus,
    pub progress: u8,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub rollback_count: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Version active on the device after this update settled
    pub current_version: String,

    /// Backup holding the set that `current_version` replaced
    #[serde(default)]
    pub restore_point: Option<String>,
}

/// Work handed to a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub target: ReportTarget,
    pub work: AssignedWork,
}

/// What the device has to do for an assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AssignedWork {
    Apply { update: Update },

    /// Revert the install of `version`; a device not running it has
    /// nothing to undo
    Rollback {
        reason: String,
        #[serde(default)]
        version: String,
    },
}

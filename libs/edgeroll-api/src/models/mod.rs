//! API models
//!
//! Enum-valued fields travel as their lowercase / snake_case wire names so
//! consumers do not need the engine crate to decode them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    #[serde(default)]
    pub checks: Vec<CheckResultResponse>,
}

/// Outcome of one health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResultResponse {
    pub name: String,
    pub critical: bool,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Update executor state of a device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateStatusResponse {
    pub device_id: String,
    pub current_version: Option<String>,
    pub update_id: Option<String>,
    pub version: Option<String>,
    pub status: Option<String>,
    pub progress: u8,
    pub error: Option<String>,
    pub rollback_count: u32,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Backup held on a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupResponse {
    pub id: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
}

/// Backups, newest first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupListResponse {
    pub backups: Vec<BackupResponse>,
    pub total: usize,
}

/// Deployment summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentResponse {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub description: String,
    pub status: String,
    pub strategy: String,
    pub artifact_type: String,
    pub artifact_version: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub rolled_back_count: u32,
    pub failure_reason: Option<String>,
}

/// Deployment list response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentListResponse {
    pub deployments: Vec<DeploymentResponse>,
    pub total: usize,
}

/// Aggregate rollout progress of a deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentStatusResponse {
    pub deployment_id: String,
    pub status: String,
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub installed: usize,
    pub failed: usize,
    pub rolled_back: usize,
    pub percentage: u32,
    pub rolled_back_count: u32,
    pub failure_reason: Option<String>,
    pub awaiting_promotion: bool,
}

/// Rollback request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackDeploymentRequest {
    pub reason: String,
    #[serde(default)]
    pub force: bool,
}

/// Update campaign summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignResponse {
    pub id: String,
    pub name: String,
    pub binary_id: String,
    pub target_version: String,
    pub kind: String,
    pub strategy: String,
    pub status: String,
    pub total_devices: u32,
    pub updated_devices: u32,
    pub failed_devices: u32,
    pub deployment_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CampaignResponse {
    /// Devices may keep working on the campaign
    pub fn is_active(&self) -> bool {
        !matches!(self.status.as_str(), "paused" | "cancelled")
    }
}

/// Status transition pushed by a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportStatusRequest {
    pub device_id: String,
    pub campaign_id: String,
    #[serde(default)]
    pub deployment_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub error_message: Option<String>,
    pub reported_at: DateTime<Utc>,
}

/// Per-device row of a campaign
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceUpdateStatusResponse {
    pub campaign_id: String,
    pub device_id: String,
    pub status: String,
    pub error_message: Option<String>,
    pub last_updated: DateTime<Utc>,
}

//! Update campaign models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::deployment::{ArtifactRef, DeviceStatus};
use crate::rollout::fsm::{device_transition_allowed, rollback_transition_allowed};

/// Campaign lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Created,
    InProgress,
    Paused,
    Completed,
    Cancelled,
}

impl CampaignStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Created => "created",
            CampaignStatus::InProgress => "in_progress",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Cancelled => "cancelled",
        }
    }
}

/// Rollout strategy of a campaign
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStrategy {
    #[default]
    Immediate,
    Rolling,
    Canary,
}

impl CampaignStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStrategy::Immediate => "immediate",
            CampaignStrategy::Rolling => "rolling",
            CampaignStrategy::Canary => "canary",
        }
    }
}

/// What devices of a campaign are asked to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignKind {
    #[default]
    Update,
    Rollback,
}

impl CampaignKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignKind::Update => "update",
            CampaignKind::Rollback => "rollback",
        }
    }
}

/// Binary-centric rollout record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCampaign {
    pub id: String,
    pub name: String,
    pub binary_id: String,
    pub target_version: String,
    pub target_platforms: Vec<String>,
    pub target_architectures: Vec<String>,
    pub strategy: CampaignStrategy,
    pub kind: CampaignKind,
    pub status: CampaignStatus,
    pub total_devices: u32,
    pub updated_devices: u32,
    pub failed_devices: u32,

    /// Set when the campaign is one batch of a deployment
    pub deployment_id: Option<String>,

    /// Artifact the devices install; none for rollback campaigns
    pub artifact: Option<ArtifactRef>,

    /// Reason handed to devices of a rollback campaign
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UpdateCampaign {
    /// Every device reported a final outcome
    pub fn is_settled(&self) -> bool {
        self.updated_devices + self.failed_devices >= self.total_devices
    }
}

/// Per-device row of a campaign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceUpdate {
    pub campaign_id: String,
    pub device_id: String,
    pub status: DeviceStatus,
    pub error_message: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// Request to create a campaign
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewCampaign {
    pub name: String,
    pub binary_id: String,
    pub target_version: String,
    #[serde(default)]
    pub target_platforms: Vec<String>,
    #[serde(default)]
    pub target_architectures: Vec<String>,
    #[serde(default)]
    pub strategy: CampaignStrategy,
    #[serde(default)]
    pub kind: CampaignKind,

    /// Explicit targets; skips platform resolution when set
    #[serde(default)]
    pub device_ids: Option<Vec<String>>,
    #[serde(default)]
    pub deployment_id: Option<String>,
    #[serde(default)]
    pub artifact: Option<ArtifactRef>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Progress snapshot of a campaign
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignProgress {
    pub campaign_id: String,
    pub status: CampaignStatus,
    pub total_devices: u32,
    pub updated_devices: u32,
    pub failed_devices: u32,
    pub devices: Vec<DeviceUpdate>,
}

/// Apply one device report to a campaign and its device row.
///
/// Counters move only on the first entry into a final status, and the
/// completion rule is evaluated in the same step. Returns false when the
/// report does not advance the row.
pub fn apply_report(
    campaign: &mut UpdateCampaign,
    row: &mut DeviceUpdate,
    status: DeviceStatus,
    error_message: Option<String>,
    now: DateTime<Utc>,
) -> bool {
    let allowed = match campaign.kind {
        CampaignKind::Update => device_transition_allowed(row.status, status),
        CampaignKind::Rollback => rollback_transition_allowed(row.status, status),
    };
    if !allowed {
        return false;
    }

    let previous = row.status;
    row.status = status;
    row.error_message = error_message;
    row.last_updated = now;

    match (campaign.kind, status) {
        (CampaignKind::Update, DeviceStatus::Installed) => campaign.updated_devices += 1,
        (CampaignKind::Update, DeviceStatus::RolledBack) if previous == DeviceStatus::Installed => {
            campaign.updated_devices = campaign.updated_devices.saturating_sub(1);
            campaign.failed_devices += 1;
        }
        (CampaignKind::Update, DeviceStatus::RolledBack) if previous != DeviceStatus::Failed => {
            campaign.failed_devices += 1;
        }
        (CampaignKind::Rollback, DeviceStatus::RolledBack) => campaign.updated_devices += 1,
        (_, DeviceStatus::Failed) => campaign.failed_devices += 1,
        _ => {}
    }

    if !campaign.status.is_terminal() && campaign.is_settled() {
        campaign.status = CampaignStatus::Completed;
    }
    campaign.updated_at = now;
    true
}

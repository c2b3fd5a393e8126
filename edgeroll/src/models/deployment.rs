//! Deployment models

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::FleetError;
use crate::models::strategy::Strategy;
use crate::utils::normalize_checksum;

/// Kind of artifact being rolled out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    Binary,
    Script,
    Container,
    Config,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::Binary => "binary",
            ArtifactType::Script => "script",
            ArtifactType::Container => "container",
            ArtifactType::Config => "config",
        }
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ArtifactType {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "binary" => Ok(ArtifactType::Binary),
            "script" => Ok(ArtifactType::Script),
            "container" => Ok(ArtifactType::Container),
            "config" => Ok(ArtifactType::Config),
            _ => Err(FleetError::InvalidInput(format!("unknown artifact type: {}", s))),
        }
    }
}

/// Reference to the artifact a deployment installs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// File name inside a device's active set
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub artifact_type: ArtifactType,
    pub version: String,

    /// Download locator (URL)
    pub locator: String,

    /// `sha256:<hex>` or bare hex digest
    pub checksum: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl ArtifactRef {
    /// Name the artifact is installed under; falls back to the last path
    /// segment of the locator
    pub fn file_name(&self) -> String {
        let name = self.name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
        let path = self.locator.split(['?', '#']).next().unwrap_or_default();
        path.trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

/// Reject artifact names that would land outside the active set
pub fn validate_artifact_name(name: &str) -> Result<(), FleetError> {
    if name.is_empty() || name == "." || name.contains(['/', '\\']) || name.contains("..") {
        return Err(FleetError::InvalidInput(format!("invalid artifact name: {:?}", name)));
    }
    Ok(())
}

/// Rule resolving the target devices of a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Selector {
    Devices { ids: Vec<String> },
    Groups { ids: Vec<String> },
    Labels { match_labels: BTreeMap<String, String> },
}

impl Selector {
    pub fn is_empty(&self) -> bool {
        match self {
            Selector::Devices { ids } | Selector::Groups { ids } => ids.is_empty(),
            Selector::Labels { match_labels } => match_labels.is_empty(),
        }
    }
}

/// Deployment lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    RolledBack,
    Cancelled,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Completed
                | DeploymentStatus::Failed
                | DeploymentStatus::RolledBack
                | DeploymentStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "PENDING",
            DeploymentStatus::Running => "RUNNING",
            DeploymentStatus::Paused => "PAUSED",
            DeploymentStatus::Completed => "COMPLETED",
            DeploymentStatus::Failed => "FAILED",
            DeploymentStatus::RolledBack => "ROLLED_BACK",
            DeploymentStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-device update status.
///
/// Moves forward: pending, downloading, downloaded, installing, then
/// installed or failed. rolled_back follows installing, installed or failed,
/// and an interrupted apply returns to pending. See
/// [`crate::rollout::fsm::device_transition_allowed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Pending,
    Downloading,
    Downloaded,
    Installing,
    Installed,
    Failed,
    RolledBack,
}

impl DeviceStatus {
    pub const ALL: [DeviceStatus; 7] = [
        DeviceStatus::Pending,
        DeviceStatus::Downloading,
        DeviceStatus::Downloaded,
        DeviceStatus::Installing,
        DeviceStatus::Installed,
        DeviceStatus::Failed,
        DeviceStatus::RolledBack,
    ];

    /// Position in the forward ordering
    pub fn rank(&self) -> u8 {
        match self {
            DeviceStatus::Pending => 0,
            DeviceStatus::Downloading => 1,
            DeviceStatus::Downloaded => 2,
            DeviceStatus::Installing => 3,
            DeviceStatus::Installed | DeviceStatus::Failed => 4,
            DeviceStatus::RolledBack => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeviceStatus::Installed | DeviceStatus::Failed | DeviceStatus::RolledBack
        )
    }

    /// Counted against the failure threshold
    pub fn is_failure(&self) -> bool {
        matches!(self, DeviceStatus::Failed | DeviceStatus::RolledBack)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Pending => "pending",
            DeviceStatus::Downloading => "downloading",
            DeviceStatus::Downloaded => "downloaded",
            DeviceStatus::Installing => "installing",
            DeviceStatus::Installed => "installed",
            DeviceStatus::Failed => "failed",
            DeviceStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeviceStatus {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.to_lowercase())
            .ok_or_else(|| FleetError::InvalidInput(format!("unknown device status: {}", s)))
    }
}

/// A rollout of one artifact to a selected device set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub description: String,
    pub artifact: ArtifactRef,
    pub selector: Selector,
    pub strategy: Strategy,
    pub status: DeploymentStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Devices reverted by the last rollback
    #[serde(default)]
    pub rolled_back_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Overrides the strategy's failed-device percentage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_threshold: Option<u32>,
}

impl Deployment {
    /// Failed-device percentage above which the rollout aborts
    pub fn abort_threshold(&self, default_threshold: u32) -> u32 {
        self.abort_threshold
            .unwrap_or_else(|| self.strategy.abort_threshold(default_threshold))
    }
}

/// Request to create a deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDeployment {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub description: String,
    pub artifact: ArtifactRef,
    pub selector: Selector,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub abort_threshold: Option<u32>,
}

impl NewDeployment {
    /// Validate the request before anything is stored
    pub fn validate(&self) -> Result<(), FleetError> {
        if self.name.trim().is_empty() {
            return Err(FleetError::InvalidInput("deployment name is required".to_string()));
        }
        if self.selector.is_empty() {
            return Err(FleetError::InvalidInput("selector matches nothing".to_string()));
        }
        if self.artifact.version.trim().is_empty() {
            return Err(FleetError::InvalidInput("artifact version is required".to_string()));
        }
        if self.artifact.locator.trim().is_empty() {
            return Err(FleetError::InvalidInput("artifact locator is required".to_string()));
        }
        normalize_checksum(&self.artifact.checksum)?;
        validate_artifact_name(&self.artifact.file_name())?;
        if let Some(threshold) = self.abort_threshold {
            if threshold > 100 {
                return Err(FleetError::InvalidInput(
                    "abort_threshold must be within 0..=100".to_string(),
                ));
            }
        }
        self.strategy.validate()
    }
}

/// Where a device stands in a rollback its deployment handed over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackState {
    /// Handed to the device, no answer yet
    Requested,
    Confirmed,
    Failed,
}

/// Rollout state of one device within one deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDeployment {
    pub deployment_id: String,
    pub device_id: String,
    pub status: DeviceStatus,
    pub progress: u8,
    #[serde(default)]
    pub message: String,

    /// Set when the device is handed to an update campaign
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackState>,
}

impl DeviceDeployment {
    pub fn new(deployment_id: &str, device_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            device_id: device_id.to_string(),
            status: DeviceStatus::Pending,
            progress: 0,
            message: String::new(),
            started_at: None,
            updated_at: now,
            rollback: None,
        }
    }

    /// Handed a rollback that the device has not answered yet
    pub fn awaiting_rollback(&self) -> bool {
        self.rollback == Some(RollbackState::Requested)
    }

    /// Handed to a campaign
    pub fn is_dispatched(&self) -> bool {
        self.started_at.is_some() || self.status != DeviceStatus::Pending
    }

    /// Dispatched and not yet terminal
    pub fn is_in_flight(&self) -> bool {
        self.is_dispatched() && !self.status.is_terminal()
    }
}

/// Aggregate per-device counts of a deployment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentProgress {
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub installed: usize,
    pub failed: usize,
    pub rolled_back: usize,

    /// Terminal devices over total, rounded down
    pub percentage: u32,
}

impl DeploymentProgress {
    pub fn from_devices(devices: &[DeviceDeployment]) -> Self {
        let mut progress = DeploymentProgress {
            total: devices.len(),
            ..Default::default()
        };
        for device in devices {
            match device.status {
                DeviceStatus::Installed => progress.installed += 1,
                DeviceStatus::Failed => progress.failed += 1,
                DeviceStatus::RolledBack => progress.rolled_back += 1,
                _ if device.is_in_flight() => progress.in_flight += 1,
                _ => progress.pending += 1,
            }
        }
        let settled = progress.installed + progress.failed + progress.rolled_back;
        progress.percentage = crate::utils::floor_percent(settled, progress.total);
        progress
    }
}

/// Aggregate view returned by the orchestrator status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentStatusReport {
    pub deployment_id: String,
    pub status: DeploymentStatus,
    pub progress: DeploymentProgress,
    pub rolled_back_count: u32,
    pub failure_reason: Option<String>,
    pub awaiting_promotion: bool,
}

/// Filter for listing deployments
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    pub namespace: Option<String>,
    pub status: Option<DeploymentStatus>,
}

impl DeploymentFilter {
    pub fn matches(&self, deployment: &Deployment) -> bool {
        self.namespace
            .as_deref()
            .is_none_or(|ns| ns == deployment.namespace)
            && self.status.is_none_or(|status| status == deployment.status)
    }
}

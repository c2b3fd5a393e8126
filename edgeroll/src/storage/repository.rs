//! Repository contracts for deployment and campaign records
//!
//! Every status mutation names the statuses the row must currently be in.
//! When the precondition does not hold the update is a no-op and `None` is
//! returned, so duplicate and out-of-order writes are absorbed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::FleetError;
use crate::models::campaign::{CampaignStatus, DeviceUpdate, UpdateCampaign};
use crate::models::deployment::{
    Deployment, DeploymentFilter, DeploymentStatus, DeviceDeployment, DeviceStatus, RollbackState,
};

/// Fields written together with a deployment status change
#[derive(Debug, Clone)]
pub struct DeploymentChange {
    pub status: DeploymentStatus,
    pub failure_reason: Option<String>,
}

impl DeploymentChange {
    pub fn to(status: DeploymentStatus) -> Self {
        Self {
            status,
            failure_reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }
}

/// Fields written together with a device row status change
#[derive(Debug, Clone)]
pub struct DeviceChange {
    pub status: DeviceStatus,
    pub progress: Option<u8>,
    pub message: Option<String>,

    /// Written only when the row has no start time yet
    pub started_at: Option<DateTime<Utc>>,

    /// `Some(None)` clears the rollback marker
    pub rollback: Option<Option<RollbackState>>,
}

impl DeviceChange {
    pub fn to(status: DeviceStatus) -> Self {
        Self {
            status,
            progress: None,
            message: None,
            started_at: None,
            rollback: None,
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn started(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn with_rollback(mut self, rollback: RollbackState) -> Self {
        self.rollback = Some(Some(rollback));
        self
    }

    pub fn clear_rollback(mut self) -> Self {
        self.rollback = Some(None);
        self
    }
}

/// A device's answer to a rollback handed to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    Confirmed,
    Failed(String),
}

/// Deployment and device-row persistence
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn insert_deployment(&self, deployment: &Deployment) -> Result<(), FleetError>;

    async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>, FleetError>;

    /// Newest first
    async fn list_deployments(
        &self,
        filter: &DeploymentFilter,
    ) -> Result<Vec<Deployment>, FleetError>;

    /// Apply `change` if the deployment is currently `expected`
    async fn transition_deployment(
        &self,
        id: &str,
        expected: DeploymentStatus,
        change: DeploymentChange,
    ) -> Result<Option<Deployment>, FleetError>;

    /// Insert one pending row per device. Fails with `InvalidState` if the
    /// deployment already has rows.
    async fn insert_device_deployments(
        &self,
        deployment_id: &str,
        device_ids: &[String],
    ) -> Result<usize, FleetError>;

    async fn list_device_deployments(
        &self,
        deployment_id: &str,
    ) -> Result<Vec<DeviceDeployment>, FleetError>;

    async fn get_device_deployment(
        &self,
        deployment_id: &str,
        device_id: &str,
    ) -> Result<Option<DeviceDeployment>, FleetError>;

    /// Remember that `campaign_id` carries a batch of the deployment
    async fn attach_campaign(&self, deployment_id: &str, campaign_id: &str)
        -> Result<(), FleetError>;

    /// Campaigns of a deployment, oldest first
    async fn deployment_campaigns(&self, deployment_id: &str) -> Result<Vec<String>, FleetError>;

    /// Apply `change` if the row's status is one of `expected`.
    ///
    /// Fails with `NotFound` when the row does not exist.
    async fn update_device_deployment(
        &self,
        deployment_id: &str,
        device_id: &str,
        expected: &[DeviceStatus],
        change: DeviceChange,
    ) -> Result<Option<DeviceDeployment>, FleetError>;

    /// Record the answer of a device whose row awaits a rollback.
    ///
    /// A confirmation moves the row to `rolled_back`, a failure to `failed`
    /// and appends to the deployment's failure reason. The deployment's
    /// `rolled_back_count` is recounted from confirmed rows in the same step.
    /// Returns `None` when the row awaits no rollback.
    async fn record_rollback_outcome(
        &self,
        deployment_id: &str,
        device_id: &str,
        outcome: RollbackOutcome,
    ) -> Result<Option<(Deployment, DeviceDeployment)>, FleetError>;
}

/// Campaign persistence
#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Insert a campaign with one pending row per device
    async fn insert_campaign(
        &self,
        campaign: &UpdateCampaign,
        device_ids: &[String],
    ) -> Result<(), FleetError>;

    async fn get_campaign(&self, id: &str) -> Result<Option<UpdateCampaign>, FleetError>;

    /// Oldest first
    async fn list_campaigns(&self) -> Result<Vec<UpdateCampaign>, FleetError>;

    /// Set the status if it is currently one of `expected`
    async fn set_campaign_status(
        &self,
        id: &str,
        expected: &[CampaignStatus],
        status: CampaignStatus,
    ) -> Result<Option<UpdateCampaign>, FleetError>;

    async fn get_device_update(
        &self,
        campaign_id: &str,
        device_id: &str,
    ) -> Result<Option<DeviceUpdate>, FleetError>;

    async fn list_device_updates(&self, campaign_id: &str) -> Result<Vec<DeviceUpdate>, FleetError>;

    /// Apply a device report and the campaign counters atomically.
    ///
    /// Returns the campaign after the report and whether the row changed.
    async fn record_device_update(
        &self,
        campaign_id: &str,
        device_id: &str,
        status: DeviceStatus,
        error_message: Option<String>,
    ) -> Result<(UpdateCampaign, bool), FleetError>;
}

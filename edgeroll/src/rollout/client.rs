//! Dispatch contract between the orchestrator and the update transport

use async_trait::async_trait;

use crate::errors::FleetError;
use crate::models::campaign::CampaignProgress;
use crate::models::deployment::Deployment;

/// Hands batches of devices to whatever delivers updates to them
#[async_trait]
pub trait UpdateClient: Send + Sync {
    /// Create a campaign installing the deployment's artifact on `device_ids`
    async fn create_campaign(
        &self,
        deployment: &Deployment,
        device_ids: &[String],
    ) -> Result<String, FleetError>;

    async fn get_campaign_status(&self, campaign_id: &str) -> Result<CampaignProgress, FleetError>;

    async fn pause_campaign(&self, campaign_id: &str) -> Result<(), FleetError>;

    async fn resume_campaign(&self, campaign_id: &str) -> Result<(), FleetError>;

    async fn cancel_campaign(&self, campaign_id: &str) -> Result<(), FleetError>;

    /// Ask `device_ids` to restore their previous version.
    ///
    /// Returns the devices the rollback was handed to.
    async fn rollback_devices(
        &self,
        deployment: &Deployment,
        device_ids: &[String],
        reason: &str,
    ) -> Result<Vec<String>, FleetError>;
}

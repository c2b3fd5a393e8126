//! In-process [`UpdateClient`] backed by the campaign service

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::campaign::service::CampaignService;
use crate::errors::FleetError;
use crate::models::campaign::{CampaignKind, CampaignProgress, CampaignStrategy, NewCampaign};
use crate::models::deployment::Deployment;
use crate::rollout::client::UpdateClient;

/// Turns each deployment batch into an immediate campaign over explicit ids
pub struct CampaignUpdateClient {
    service: Arc<CampaignService>,
}

impl CampaignUpdateClient {
    pub fn new(service: Arc<CampaignService>) -> Self {
        Self { service }
    }

    /// True when the campaign already finished and can no longer change status
    async fn settled(&self, campaign_id: &str) -> Result<bool, FleetError> {
        let campaign = self.service.get_campaign(campaign_id).await?;
        if campaign.status.is_terminal() {
            debug!(campaign = %campaign_id, status = ?campaign.status, "Campaign already finished");
            return Ok(true);
        }
        Ok(false)
    }

    fn batch_request(deployment: &Deployment, device_ids: &[String], kind: CampaignKind) -> NewCampaign {
        NewCampaign {
            name: format!("{}/{}", deployment.namespace, deployment.name),
            binary_id: deployment.artifact.file_name(),
            target_version: deployment.artifact.version.clone(),
            strategy: CampaignStrategy::Immediate,
            kind,
            device_ids: Some(device_ids.to_vec()),
            deployment_id: Some(deployment.id.clone()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl UpdateClient for CampaignUpdateClient {
    async fn create_campaign(
        &self,
        deployment: &Deployment,
        device_ids: &[String],
    ) -> Result<String, FleetError> {
        let request = NewCampaign {
            artifact: Some(deployment.artifact.clone()),
            ..Self::batch_request(deployment, device_ids, CampaignKind::Update)
        };
        let campaign = self.service.create_update_campaign(request).await?;
        Ok(campaign.id)
    }

    async fn get_campaign_status(&self, campaign_id: &str) -> Result<CampaignProgress, FleetError> {
        self.service.campaign_progress(campaign_id).await
    }

    async fn pause_campaign(&self, campaign_id: &str) -> Result<(), FleetError> {
        if !self.settled(campaign_id).await? {
            self.service.pause_campaign(campaign_id).await?;
        }
        Ok(())
    }

    async fn resume_campaign(&self, campaign_id: &str) -> Result<(), FleetError> {
        if !self.settled(campaign_id).await? {
            self.service.resume_campaign(campaign_id).await?;
        }
        Ok(())
    }

    async fn cancel_campaign(&self, campaign_id: &str) -> Result<(), FleetError> {
        if !self.settled(campaign_id).await? {
            self.service.cancel_campaign(campaign_id).await?;
        }
        Ok(())
    }

    async fn rollback_devices(
        &self,
        deployment: &Deployment,
        device_ids: &[String],
        reason: &str,
    ) -> Result<Vec<String>, FleetError> {
        let request = NewCampaign {
            name: format!("{}/{} rollback", deployment.namespace, deployment.name),
            reason: Some(reason.to_string()),
            ..Self::batch_request(deployment, device_ids, CampaignKind::Rollback)
        };
        self.service.create_update_campaign(request).await?;
        Ok(device_ids.to_vec())
    }
}

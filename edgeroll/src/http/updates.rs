//! Work assignments polled from the control plane

use async_trait::async_trait;
use edgeroll_api::CampaignResponse;

use crate::errors::FleetError;
use crate::http::client::HttpClient;
use crate::models::update::Assignment;
use crate::update::source::UpdateSource;

/// [`UpdateSource`] backed by the control plane API
pub struct HttpUpdateSource {
    client: HttpClient,
}

impl HttpUpdateSource {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

pub fn assignment_path(device_id: &str) -> String {
    format!("/api/v1/devices/{}/assignment", device_id)
}

pub fn campaign_path(campaign_id: &str) -> String {
    format!("/api/v1/campaigns/{}", campaign_id)
}

#[async_trait]
impl UpdateSource for HttpUpdateSource {
    async fn next_assignment(&self, device_id: &str) -> Result<Option<Assignment>, FleetError> {
        self.client.get_optional(&assignment_path(device_id)).await
    }

    async fn assignment_active(&self, campaign_id: &str) -> Result<bool, FleetError> {
        let campaign: Option<CampaignResponse> =
            self.client.get_optional(&campaign_path(campaign_id)).await?;
        Ok(campaign.map(|c| c.is_active()).unwrap_or(false))
    }
}

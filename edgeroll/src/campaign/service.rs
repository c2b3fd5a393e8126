//! Binary-centric update campaigns
//!
//! A campaign targets devices by platform and architecture, or an explicit
//! id list when it carries one batch of a deployment. Device reports update
//! the per-device rows and the campaign counters in one store call.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::campaign::artifacts::ArtifactStore;
use crate::errors::FleetError;
use crate::models::campaign::{
    CampaignKind, CampaignProgress, CampaignStatus, CampaignStrategy, DeviceUpdate, NewCampaign,
    UpdateCampaign,
};
use crate::models::deployment::{validate_artifact_name, ArtifactRef, ArtifactType, DeviceStatus};
use crate::models::update::{
    AssignedWork, Assignment, ReportTarget, StatusReport, Update, UpdateType,
};
use crate::rollout::directory::DeviceDirectory;
use crate::storage::repository::CampaignStore;
use crate::update::source::UpdateSource;
use crate::utils::{generate_uuid, normalize_checksum};

pub struct CampaignService {
    store: Arc<dyn CampaignStore>,
    directory: Arc<dyn DeviceDirectory>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
}

impl CampaignService {
    pub fn new(store: Arc<dyn CampaignStore>, directory: Arc<dyn DeviceDirectory>) -> Self {
        Self {
            store,
            directory,
            artifacts: None,
        }
    }

    /// Resolve binary versions through `artifacts` when a request names no artifact
    pub fn with_artifact_store(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Create a campaign with one pending row per target device.
    ///
    /// A campaign without targets is completed right away.
    pub async fn create_update_campaign(
        &self,
        request: NewCampaign,
    ) -> Result<UpdateCampaign, FleetError> {
        if request.name.trim().is_empty() {
            return Err(FleetError::InvalidInput("campaign name is required".to_string()));
        }
        if request.target_version.trim().is_empty() {
            return Err(FleetError::InvalidInput("target version is required".to_string()));
        }

        let artifact = match request.kind {
            CampaignKind::Update => Some(self.resolve_artifact(&request).await?),
            CampaignKind::Rollback => None,
        };

        let mut device_ids = match &request.device_ids {
            Some(ids) => ids.clone(),
            None => {
                self.directory
                    .devices_for_platforms(&request.target_platforms, &request.target_architectures)
                    .await?
            }
        };
        device_ids.sort();
        device_ids.dedup();

        let status = if device_ids.is_empty() {
            CampaignStatus::Completed
        } else if request.strategy == CampaignStrategy::Immediate {
            CampaignStatus::InProgress
        } else {
            CampaignStatus::Created
        };

        let now = Utc::now();
        let campaign = UpdateCampaign {
            id: generate_uuid(),
            name: request.name,
            binary_id: request.binary_id,
            target_version: request.target_version,
            target_platforms: request.target_platforms,
            target_architectures: request.target_architectures,
            strategy: request.strategy,
            kind: request.kind,
            status,
            total_devices: device_ids.len() as u32,
            updated_devices: 0,
            failed_devices: 0,
            deployment_id: request.deployment_id,
            artifact,
            reason: request.reason,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_campaign(&campaign, &device_ids).await?;

        info!(
            campaign = %campaign.id,
            kind = ?campaign.kind,
            devices = campaign.total_devices,
            status = ?campaign.status,
            "Campaign created"
        );
        Ok(campaign)
    }

    async fn resolve_artifact(&self, request: &NewCampaign) -> Result<ArtifactRef, FleetError> {
        if let Some(artifact) = &request.artifact {
            normalize_checksum(&artifact.checksum)?;
            let mut artifact = artifact.clone();
            if artifact.name.trim().is_empty() {
                artifact.name = request.binary_id.clone();
            }
            validate_artifact_name(&artifact.file_name())?;
            return Ok(artifact);
        }

        let store = self.artifacts.as_ref().ok_or_else(|| {
            FleetError::InvalidInput(format!(
                "campaign for binary {} names no artifact and no artifact store is configured",
                request.binary_id
            ))
        })?;
        validate_artifact_name(&request.binary_id)?;
        let location = store
            .get_artifact(&request.binary_id, &request.target_version)
            .await?;
        normalize_checksum(&location.checksum)?;

        Ok(ArtifactRef {
            name: request.binary_id.clone(),
            artifact_type: ArtifactType::Binary,
            version: request.target_version.clone(),
            locator: location.locator,
            checksum: location.checksum,
            signature: location.signature,
        })
    }

    /// Apply a device report. Returns the campaign and whether the row moved.
    pub async fn report_update_status(
        &self,
        report: &StatusReport,
    ) -> Result<(UpdateCampaign, bool), FleetError> {
        let (campaign, applied) = self
            .store
            .record_device_update(
                &report.campaign_id,
                &report.device_id,
                report.status,
                report.error_message.clone(),
            )
            .await?;

        if applied {
            debug!(
                campaign = %campaign.id,
                device = %report.device_id,
                status = %report.status,
                "Campaign report applied"
            );
            if campaign.status == CampaignStatus::Completed && campaign.is_settled() {
                info!(
                    campaign = %campaign.id,
                    updated = campaign.updated_devices,
                    failed = campaign.failed_devices,
                    "Campaign settled"
                );
            }
        }
        Ok((campaign, applied))
    }

    pub async fn get_campaign(&self, id: &str) -> Result<UpdateCampaign, FleetError> {
        self.store
            .get_campaign(id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("campaign {}", id)))
    }

    pub async fn list_campaigns(&self) -> Result<Vec<UpdateCampaign>, FleetError> {
        self.store.list_campaigns().await
    }

    pub async fn get_device_update_status(
        &self,
        campaign_id: &str,
        device_id: &str,
    ) -> Result<DeviceUpdate, FleetError> {
        self.store
            .get_device_update(campaign_id, device_id)
            .await?
            .ok_or_else(|| {
                FleetError::NotFound(format!("device {} in campaign {}", device_id, campaign_id))
            })
    }

    pub async fn campaign_progress(&self, id: &str) -> Result<CampaignProgress, FleetError> {
        let campaign = self.get_campaign(id).await?;
        let devices = self.store.list_device_updates(id).await?;
        Ok(CampaignProgress {
            campaign_id: campaign.id,
            status: campaign.status,
            total_devices: campaign.total_devices,
            updated_devices: campaign.updated_devices,
            failed_devices: campaign.failed_devices,
            devices,
        })
    }

    pub async fn pause_campaign(&self, id: &str) -> Result<UpdateCampaign, FleetError> {
        self.set_status(
            id,
            &[CampaignStatus::Created, CampaignStatus::InProgress],
            CampaignStatus::Paused,
        )
        .await
    }

    /// Start a created campaign or resume a paused one
    pub async fn resume_campaign(&self, id: &str) -> Result<UpdateCampaign, FleetError> {
        self.set_status(
            id,
            &[CampaignStatus::Created, CampaignStatus::Paused],
            CampaignStatus::InProgress,
        )
        .await
    }

    /// Cancel a campaign; devices that have not finished are failed
    pub async fn cancel_campaign(&self, id: &str) -> Result<UpdateCampaign, FleetError> {
        self.set_status(
            id,
            &[
                CampaignStatus::Created,
                CampaignStatus::InProgress,
                CampaignStatus::Paused,
            ],
            CampaignStatus::Cancelled,
        )
        .await?;

        for row in self.store.list_device_updates(id).await? {
            if row.status.is_terminal() {
                continue;
            }
            self.store
                .record_device_update(
                    id,
                    &row.device_id,
                    DeviceStatus::Failed,
                    Some("cancelled".to_string()),
                )
                .await?;
        }
        self.get_campaign(id).await
    }

    async fn set_status(
        &self,
        id: &str,
        expected: &[CampaignStatus],
        status: CampaignStatus,
    ) -> Result<UpdateCampaign, FleetError> {
        match self.store.set_campaign_status(id, expected, status).await? {
            Some(campaign) => {
                info!(campaign = %id, status = ?status, "Campaign status changed");
                Ok(campaign)
            }
            None => {
                let current = self.get_campaign(id).await?;
                Err(FleetError::InvalidState(format!(
                    "campaign {} is {:?}, cannot move to {:?}",
                    id, current.status, status
                )))
            }
        }
    }

    fn assignment(campaign: &UpdateCampaign, device_id: &str) -> Option<Assignment> {
        let target = ReportTarget {
            campaign_id: campaign.id.clone(),
            deployment_id: campaign.deployment_id.clone(),
        };

        let work = match campaign.kind {
            CampaignKind::Rollback => AssignedWork::Rollback {
                reason: campaign
                    .reason
                    .clone()
                    .unwrap_or_else(|| "rollback requested".to_string()),
                version: campaign.target_version.clone(),
            },
            CampaignKind::Update => {
                let Some(artifact) = campaign.artifact.as_ref() else {
                    warn!(campaign = %campaign.id, device = %device_id, "Campaign has no artifact");
                    return None;
                };
                let update_type = match artifact.artifact_type {
                    ArtifactType::Config => UpdateType::Config,
                    _ => UpdateType::Application,
                };
                let manifest = BTreeMap::from([
                    ("artifact_name".to_string(), artifact.file_name()),
                    (
                        "artifact_type".to_string(),
                        artifact.artifact_type.to_string(),
                    ),
                ]);
                AssignedWork::Apply {
                    update: Update {
                        id: campaign.id.clone(),
                        version: artifact.version.clone(),
                        update_type,
                        priority: Default::default(),
                        url: artifact.locator.clone(),
                        checksum: artifact.checksum.clone(),
                        signature: artifact.signature.clone(),
                        rollback_enabled: true,
                        pre_script: None,
                        post_script: None,
                        manifest,
                    },
                }
            }
        };
        Some(Assignment { target, work })
    }
}

#[async_trait]
impl UpdateSource for CampaignService {
    async fn next_assignment(&self, device_id: &str) -> Result<Option<Assignment>, FleetError> {
        for campaign in self.store.list_campaigns().await? {
            if campaign.status != CampaignStatus::InProgress {
                continue;
            }
            let Some(row) = self.store.get_device_update(&campaign.id, device_id).await? else {
                continue;
            };
            if row.status != DeviceStatus::Pending {
                continue;
            }
            if let Some(assignment) = Self::assignment(&campaign, device_id) {
                return Ok(Some(assignment));
            }
        }
        Ok(None)
    }

    async fn assignment_active(&self, campaign_id: &str) -> Result<bool, FleetError> {
        Ok(match self.store.get_campaign(campaign_id).await? {
            Some(campaign) => !matches!(
                campaign.status,
                CampaignStatus::Paused | CampaignStatus::Cancelled
            ),
            None => false,
        })
    }
}

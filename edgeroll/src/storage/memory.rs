//! In-memory store

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::errors::FleetError;
use crate::models::campaign::{apply_report, CampaignStatus, DeviceUpdate, UpdateCampaign};
use crate::models::deployment::{
    Deployment, DeploymentFilter, DeploymentStatus, DeviceDeployment, DeviceStatus, RollbackState,
};
use crate::storage::repository::{
    CampaignStore, DeploymentChange, DeploymentStore, DeviceChange, RollbackOutcome,
};

#[derive(Debug, Default)]
struct Tables {
    deployments: HashMap<String, Deployment>,
    device_deployments: HashMap<String, BTreeMap<String, DeviceDeployment>>,
    deployment_campaigns: HashMap<String, Vec<String>>,
    campaigns: HashMap<String, UpdateCampaign>,
    campaign_order: Vec<String>,
    device_updates: HashMap<String, BTreeMap<String, DeviceUpdate>>,
}

/// Store keeping every table behind one lock
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn insert_deployment(&self, deployment: &Deployment) -> Result<(), FleetError> {
        let mut tables = self.write();
        if tables.deployments.contains_key(&deployment.id) {
            return Err(FleetError::InvalidState(format!(
                "deployment {} already exists",
                deployment.id
            )));
        }
        tables
            .deployments
            .insert(deployment.id.clone(), deployment.clone());
        Ok(())
    }

    async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>, FleetError> {
        Ok(self.read().deployments.get(id).cloned())
    }

    async fn list_deployments(
        &self,
        filter: &DeploymentFilter,
    ) -> Result<Vec<Deployment>, FleetError> {
        let mut deployments: Vec<Deployment> = self
            .read()
            .deployments
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        deployments.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(deployments)
    }

    async fn transition_deployment(
        &self,
        id: &str,
        expected: DeploymentStatus,
        change: DeploymentChange,
    ) -> Result<Option<Deployment>, FleetError> {
        let mut tables = self.write();
        let deployment = tables
            .deployments
            .get_mut(id)
            .ok_or_else(|| FleetError::NotFound(format!("deployment {}", id)))?;
        if deployment.status != expected {
            return Ok(None);
        }

        deployment.status = change.status;
        if change.failure_reason.is_some() {
            deployment.failure_reason = change.failure_reason;
        }
        deployment.updated_at = Utc::now();
        Ok(Some(deployment.clone()))
    }

    async fn insert_device_deployments(
        &self,
        deployment_id: &str,
        device_ids: &[String],
    ) -> Result<usize, FleetError> {
        let mut tables = self.write();
        if !tables.deployments.contains_key(deployment_id) {
            return Err(FleetError::NotFound(format!("deployment {}", deployment_id)));
        }
        if tables.device_deployments.contains_key(deployment_id) {
            return Err(FleetError::InvalidState(format!(
                "deployment {} already has device rows",
                deployment_id
            )));
        }

        let now = Utc::now();
        let rows: BTreeMap<String, DeviceDeployment> = device_ids
            .iter()
            .map(|id| (id.clone(), DeviceDeployment::new(deployment_id, id, now)))
            .collect();
        let inserted = rows.len();
        tables
            .device_deployments
            .insert(deployment_id.to_string(), rows);
        Ok(inserted)
    }

    async fn list_device_deployments(
        &self,
        deployment_id: &str,
    ) -> Result<Vec<DeviceDeployment>, FleetError> {
        Ok(self
            .read()
            .device_deployments
            .get(deployment_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_device_deployment(
        &self,
        deployment_id: &str,
        device_id: &str,
    ) -> Result<Option<DeviceDeployment>, FleetError> {
        Ok(self
            .read()
            .device_deployments
            .get(deployment_id)
            .and_then(|rows| rows.get(device_id))
            .cloned())
    }

    async fn attach_campaign(
        &self,
        deployment_id: &str,
        campaign_id: &str,
    ) -> Result<(), FleetError> {
        let mut tables = self.write();
        let campaigns = tables
            .deployment_campaigns
            .entry(deployment_id.to_string())
            .or_default();
        if !campaigns.iter().any(|id| id == campaign_id) {
            campaigns.push(campaign_id.to_string());
        }
        Ok(())
    }

    async fn deployment_campaigns(&self, deployment_id: &str) -> Result<Vec<String>, FleetError> {
        Ok(self
            .read()
            .deployment_campaigns
            .get(deployment_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_device_deployment(
        &self,
        deployment_id: &str,
        device_id: &str,
        expected: &[DeviceStatus],
        change: DeviceChange,
    ) -> Result<Option<DeviceDeployment>, FleetError> {
        let mut tables = self.write();
        let row = tables
            .device_deployments
            .get_mut(deployment_id)
            .and_then(|rows| rows.get_mut(device_id))
            .ok_or_else(|| {
                FleetError::NotFound(format!(
                    "device {} in deployment {}",
                    device_id, deployment_id
                ))
            })?;
        if !expected.contains(&row.status) {
            return Ok(None);
        }

        row.status = change.status;
        if let Some(progress) = change.progress {
            row.progress = progress;
        } else if change.status == DeviceStatus::Installed {
            row.progress = 100;
        }
        if let Some(message) = change.message {
            row.message = message;
        }
        if row.started_at.is_none() {
            row.started_at = change.started_at;
        }
        if let Some(rollback) = change.rollback {
            row.rollback = rollback;
        }
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn record_rollback_outcome(
        &self,
        deployment_id: &str,
        device_id: &str,
        outcome: RollbackOutcome,
    ) -> Result<Option<(Deployment, DeviceDeployment)>, FleetError> {
        let mut guard = self.write();
        let tables = &mut *guard;
        let not_found = || {
            FleetError::NotFound(format!(
                "device {} in deployment {}",
                device_id, deployment_id
            ))
        };
        let rows = tables
            .device_deployments
            .get_mut(deployment_id)
            .ok_or_else(not_found)?;
        let row = rows.get_mut(device_id).ok_or_else(not_found)?;
        if !row.awaiting_rollback() {
            return Ok(None);
        }

        let now = Utc::now();
        match &outcome {
            RollbackOutcome::Confirmed => {
                row.status = DeviceStatus::RolledBack;
                row.rollback = Some(RollbackState::Confirmed);
                row.progress = 100;
                row.message = "rolled back".to_string();
            }
            RollbackOutcome::Failed(message) => {
                row.status = DeviceStatus::Failed;
                row.rollback = Some(RollbackState::Failed);
                row.message = format!("rollback failed: {}", message);
            }
        }
        row.updated_at = now;
        let row = row.clone();
        let confirmed = rows
            .values()
            .filter(|r| r.rollback == Some(RollbackState::Confirmed))
            .count() as u32;

        let deployment = tables
            .deployments
            .get_mut(deployment_id)
            .ok_or_else(|| FleetError::NotFound(format!("deployment {}", deployment_id)))?;
        deployment.rolled_back_count = confirmed;
        if let RollbackOutcome::Failed(message) = outcome {
            let failure = format!("rollback failed on {}: {}", device_id, message);
            deployment.failure_reason = Some(match deployment.failure_reason.take() {
                Some(reason) => format!("{}; {}", reason, failure),
                None => failure,
            });
        }
        deployment.updated_at = now;
        Ok(Some((deployment.clone(), row)))
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn insert_campaign(
        &self,
        campaign: &UpdateCampaign,
        device_ids: &[String],
    ) -> Result<(), FleetError> {
        let mut tables = self.write();
        if tables.campaigns.contains_key(&campaign.id) {
            return Err(FleetError::InvalidState(format!(
                "campaign {} already exists",
                campaign.id
            )));
        }

        let rows = device_ids
            .iter()
            .map(|device_id| {
                let row = DeviceUpdate {
                    campaign_id: campaign.id.clone(),
                    device_id: device_id.clone(),
                    status: DeviceStatus::Pending,
                    error_message: None,
                    last_updated: campaign.created_at,
                };
                (device_id.clone(), row)
            })
            .collect();
        tables.device_updates.insert(campaign.id.clone(), rows);
        tables.campaign_order.push(campaign.id.clone());
        tables.campaigns.insert(campaign.id.clone(), campaign.clone());
        Ok(())
    }

    async fn get_campaign(&self, id: &str) -> Result<Option<UpdateCampaign>, FleetError> {
        Ok(self.read().campaigns.get(id).cloned())
    }

    async fn list_campaigns(&self) -> Result<Vec<UpdateCampaign>, FleetError> {
        let tables = self.read();
        Ok(tables
            .campaign_order
            .iter()
            .filter_map(|id| tables.campaigns.get(id).cloned())
            .collect())
    }

    async fn set_campaign_status(
        &self,
        id: &str,
        expected: &[CampaignStatus],
        status: CampaignStatus,
    ) -> Result<Option<UpdateCampaign>, FleetError> {
        let mut tables = self.write();
        let campaign = tables
            .campaigns
            .get_mut(id)
            .ok_or_else(|| FleetError::NotFound(format!("campaign {}", id)))?;
        if !expected.contains(&campaign.status) {
            return Ok(None);
        }
        campaign.status = status;
        campaign.updated_at = Utc::now();
        Ok(Some(campaign.clone()))
    }

    async fn get_device_update(
        &self,
        campaign_id: &str,
        device_id: &str,
    ) -> Result<Option<DeviceUpdate>, FleetError> {
        Ok(self
            .read()
            .device_updates
            .get(campaign_id)
            .and_then(|rows| rows.get(device_id))
            .cloned())
    }

    async fn list_device_updates(&self, campaign_id: &str) -> Result<Vec<DeviceUpdate>, FleetError> {
        Ok(self
            .read()
            .device_updates
            .get(campaign_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn record_device_update(
        &self,
        campaign_id: &str,
        device_id: &str,
        status: DeviceStatus,
        error_message: Option<String>,
    ) -> Result<(UpdateCampaign, bool), FleetError> {
        let mut guard = self.write();
        let tables = &mut *guard;
        let campaign = tables
            .campaigns
            .get_mut(campaign_id)
            .ok_or_else(|| FleetError::NotFound(format!("campaign {}", campaign_id)))?;
        let row = tables
            .device_updates
            .get_mut(campaign_id)
            .and_then(|rows| rows.get_mut(device_id))
            .ok_or_else(|| {
                FleetError::NotFound(format!("device {} in campaign {}", device_id, campaign_id))
            })?;

        let changed = apply_report(campaign, row, status, error_message, Utc::now());
        Ok((campaign.clone(), changed))
    }
}

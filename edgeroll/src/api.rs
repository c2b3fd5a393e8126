//! Conversions between engine models and the `edgeroll-api` wire models

use edgeroll_api::{
    BackupResponse, CampaignResponse, CheckResultResponse, DeploymentResponse,
    DeploymentStatusResponse, DeviceUpdateStatusResponse, ReportStatusRequest,
    UpdateStatusResponse,
};

use crate::errors::FleetError;
use crate::models::campaign::{DeviceUpdate, UpdateCampaign};
use crate::models::deployment::{Deployment, DeploymentStatusReport};
use crate::models::update::{StatusReport, UpdateState};
use crate::update::health::CheckResult;
use crate::update::rollback::Backup;

impl From<&Deployment> for DeploymentResponse {
    fn from(d: &Deployment) -> Self {
        Self {
            id: d.id.clone(),
            name: d.name.clone(),
            namespace: d.namespace.clone(),
            description: d.description.clone(),
            status: d.status.to_string(),
            strategy: d.strategy.name().to_string(),
            artifact_type: d.artifact.artifact_type.to_string(),
            artifact_version: d.artifact.version.clone(),
            created_by: d.created_by.clone(),
            created_at: d.created_at,
            updated_at: d.updated_at,
            rolled_back_count: d.rolled_back_count,
            failure_reason: d.failure_reason.clone(),
        }
    }
}

impl From<&DeploymentStatusReport> for DeploymentStatusResponse {
    fn from(r: &DeploymentStatusReport) -> Self {
        Self {
            deployment_id: r.deployment_id.clone(),
            status: r.status.to_string(),
            total: r.progress.total,
            pending: r.progress.pending,
            in_flight: r.progress.in_flight,
            installed: r.progress.installed,
            failed: r.progress.failed,
            rolled_back: r.progress.rolled_back,
            percentage: r.progress.percentage,
            rolled_back_count: r.rolled_back_count,
            failure_reason: r.failure_reason.clone(),
            awaiting_promotion: r.awaiting_promotion,
        }
    }
}

impl From<&UpdateCampaign> for CampaignResponse {
    fn from(c: &UpdateCampaign) -> Self {
        Self {
            id: c.id.clone(),
            name: c.name.clone(),
            binary_id: c.binary_id.clone(),
            target_version: c.target_version.clone(),
            kind: c.kind.as_str().to_string(),
            strategy: c.strategy.as_str().to_string(),
            status: c.status.as_str().to_string(),
            total_devices: c.total_devices,
            updated_devices: c.updated_devices,
            failed_devices: c.failed_devices,
            deployment_id: c.deployment_id.clone(),
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

impl From<&DeviceUpdate> for DeviceUpdateStatusResponse {
    fn from(row: &DeviceUpdate) -> Self {
        Self {
            campaign_id: row.campaign_id.clone(),
            device_id: row.device_id.clone(),
            status: row.status.to_string(),
            error_message: row.error_message.clone(),
            last_updated: row.last_updated,
        }
    }
}

impl From<&StatusReport> for ReportStatusRequest {
    fn from(report: &StatusReport) -> Self {
        Self {
            device_id: report.device_id.clone(),
            campaign_id: report.campaign_id.clone(),
            deployment_id: report.deployment_id.clone(),
            status: report.status.to_string(),
            progress: report.progress,
            error_message: report.error_message.clone(),
            reported_at: report.reported_at,
        }
    }
}

impl TryFrom<ReportStatusRequest> for StatusReport {
    type Error = FleetError;

    fn try_from(request: ReportStatusRequest) -> Result<Self, Self::Error> {
        if request.device_id.is_empty() || request.campaign_id.is_empty() {
            return Err(FleetError::InvalidInput(
                "report needs a device_id and a campaign_id".to_string(),
            ));
        }
        Ok(Self {
            status: request.status.parse()?,
            device_id: request.device_id,
            campaign_id: request.campaign_id,
            deployment_id: request.deployment_id,
            progress: request.progress.min(100),
            error_message: request.error_message,
            reported_at: request.reported_at,
        })
    }
}

impl From<&CheckResult> for CheckResultResponse {
    fn from(r: &CheckResult) -> Self {
        Self {
            name: r.name.clone(),
            critical: r.critical,
            passed: r.passed,
            error: r.message.clone(),
            duration_ms: r.duration_ms,
        }
    }
}

impl From<&Backup> for BackupResponse {
    fn from(b: &Backup) -> Self {
        Self {
            id: b.id.clone(),
            version: b.version.clone(),
            created_at: b.created_at,
        }
    }
}

/// Device update status as served by the local status endpoint
pub fn update_status_response(
    device_id: &str,
    current_version: Option<String>,
    state: Option<&UpdateState>,
) -> UpdateStatusResponse {
    let mut response = UpdateStatusResponse {
        device_id: device_id.to_string(),
        current_version,
        ..Default::default()
    };
    if let Some(state) = state {
        response.update_id = Some(state.update_id.clone());
        response.version = Some(state.version.clone());
        response.status = Some(state.status.to_string());
        response.progress = state.progress;
        response.error = state.error.clone();
        response.rollback_count = state.rollback_count;
        response.updated_at = Some(state.updated_at);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::deployment::DeviceStatus;
    use chrono::Utc;

    fn request(status: &str) -> ReportStatusRequest {
        ReportStatusRequest {
            device_id: "d1".to_string(),
            campaign_id: "c1".to_string(),
            deployment_id: Some("dep".to_string()),
            status: status.to_string(),
            progress: 150,
            error_message: None,
            reported_at: Utc::now(),
        }
    }

    #[test]
    fn test_report_request_parses_status() {
        let report = StatusReport::try_from(request("rolled_back")).unwrap();
        assert_eq!(report.status, DeviceStatus::RolledBack);
        assert_eq!(report.progress, 100);
        assert_eq!(ReportStatusRequest::from(&report).status, "rolled_back");
    }

    #[test]
    fn test_report_request_rejects_unknown_status() {
        let err = StatusReport::try_from(request("exploded")).unwrap_err();
        assert!(matches!(err, FleetError::InvalidInput(_)));

        let mut missing = request("installed");
        missing.campaign_id.clear();
        assert!(StatusReport::try_from(missing).is_err());
    }

    #[test]
    fn test_update_status_without_state() {
        let response = update_status_response("d1", None, None);
        assert_eq!(response.device_id, "d1");
        assert!(response.status.is_none());
    }
}

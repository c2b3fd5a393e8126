//! Delivery of in-process device reports

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::campaign::service::CampaignService;
use crate::errors::FleetError;
use crate::models::update::StatusReport;
use crate::rollout::orchestrator::{DeviceReport, Orchestrator};

/// Applies device reports to the campaign service and, for deployment
/// batches, to the orchestrator
pub struct ReportSink {
    campaigns: Arc<CampaignService>,
    orchestrator: Option<Arc<Orchestrator>>,
}

impl ReportSink {
    pub fn new(campaigns: Arc<CampaignService>) -> Self {
        Self {
            campaigns,
            orchestrator: None,
        }
    }

    pub fn with_orchestrator(mut self, orchestrator: Arc<Orchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub async fn deliver(&self, report: &StatusReport) -> Result<(), FleetError> {
        let (campaign, applied) = self.campaigns.report_update_status(report).await?;
        if !applied {
            debug!(campaign = %campaign.id, device = %report.device_id, "Duplicate report ignored");
        }

        let (Some(orchestrator), Some(deployment_id)) =
            (self.orchestrator.as_ref(), report.deployment_id.as_deref())
        else {
            return Ok(());
        };
        let mut device_report = DeviceReport::new(report.status);
        device_report.progress = Some(report.progress);
        device_report.message = report.error_message.clone();
        orchestrator
            .report_device_status(deployment_id, &report.device_id, device_report)
            .await?;
        Ok(())
    }
}

/// Run the reports worker until shutdown or until every sender is gone
pub async fn run(
    mut reports: mpsc::Receiver<StatusReport>,
    sink: Arc<ReportSink>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Reports worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Reports worker shutting down...");
                break;
            }
            report = reports.recv() => match report {
                Some(report) => deliver(&sink, &report).await,
                None => {
                    info!("Report channel closed");
                    return;
                }
            }
        }
    }

    // flush what the executor already produced
    while let Ok(report) = reports.try_recv() {
        deliver(&sink, &report).await;
    }
}

async fn deliver(sink: &ReportSink, report: &StatusReport) {
    if let Err(e) = sink.deliver(report).await {
        warn!(
            device = %report.device_id,
            campaign = %report.campaign_id,
            status = %report.status,
            "Failed to deliver report: {}",
            e
        );
    }
}

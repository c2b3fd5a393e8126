//! Deployment orchestrator
//!
//! Owns the deployment lifecycle. Each running deployment gets a driver task
//! that re-evaluates the rollout strategy whenever a device report arrives or
//! the reconcile interval elapses. Every evaluation of one deployment runs
//! under that deployment's step lock, so a batch is never dispatched twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{RolloutEvent, StatusBus, StatusEvent};
use crate::errors::FleetError;
use crate::models::deployment::{
    Deployment, DeploymentFilter, DeploymentProgress, DeploymentStatus, DeploymentStatusReport,
    DeviceDeployment, DeviceStatus, NewDeployment, RollbackState,
};
use crate::models::manifest::parse_manifest;
use crate::models::strategy::Strategy;
use crate::rollout::client::UpdateClient;
use crate::rollout::directory::DeviceDirectory;
use crate::rollout::fsm::{device_predecessors, next_status, DeploymentEvent};
use crate::rollout::strategy::{evaluate, Decision, RolloutSnapshot};
use crate::storage::repository::{
    DeploymentChange, DeploymentStore, DeviceChange, RollbackOutcome,
};
use crate::telemetry::RolloutMetrics;
use crate::utils::generate_uuid;

/// Orchestrator options
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Periodic re-evaluation of running deployments
    pub reconcile_interval: Duration,

    /// Dispatched devices with no final report after this long are failed
    pub batch_timeout: Duration,

    /// Abort threshold for strategies that carry none
    pub default_abort_threshold: u32,

    pub status_bus_capacity: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(10),
            batch_timeout: Duration::from_secs(2 * 60 * 60),
            default_abort_threshold: 50,
            status_bus_capacity: 1024,
        }
    }
}

/// Status report of one device within one deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReport {
    pub status: DeviceStatus,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub message: Option<String>,
}

impl DeviceReport {
    pub fn new(status: DeviceStatus) -> Self {
        Self {
            status,
            progress: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Result of applying a device report
#[derive(Debug, Clone, Serialize)]
pub struct ReportOutcome {
    /// False when the report was a duplicate or moved the row backwards
    pub applied: bool,
    pub deployment_status: DeploymentStatus,
    pub progress: DeploymentProgress,
}

/// Result of one evaluation step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The deployment is not running; nothing was evaluated
    Inactive(DeploymentStatus),

    /// The strategy was evaluated and its decision carried out
    Decided(Decision),
}

#[derive(Default)]
struct RolloutHandle {
    cancel: CancellationToken,
    wake: Notify,
    step: tokio::sync::Mutex<()>,
    driver_running: AtomicBool,
    promotion_confirmed: AtomicBool,
    awaiting_promotion: AtomicBool,
}

/// Drives deployments from creation to a final status
pub struct Orchestrator {
    store: Arc<dyn DeploymentStore>,
    client: Arc<dyn UpdateClient>,
    directory: Arc<dyn DeviceDirectory>,
    metrics: Arc<dyn RolloutMetrics>,
    bus: StatusBus,
    options: OrchestratorOptions,
    rollouts: Mutex<HashMap<String, Arc<RolloutHandle>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        client: Arc<dyn UpdateClient>,
        directory: Arc<dyn DeviceDirectory>,
        metrics: Arc<dyn RolloutMetrics>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            store,
            client,
            directory,
            metrics,
            bus: StatusBus::new(options.status_bus_capacity),
            options,
            rollouts: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to device and deployment status events
    pub fn subscribe(&self) -> broadcast::Receiver<RolloutEvent> {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> &StatusBus {
        &self.bus
    }

    /// Validate and store a new deployment in PENDING
    pub async fn create_deployment(&self, request: NewDeployment) -> Result<Deployment, FleetError> {
        request.validate()?;

        let now = Utc::now();
        let deployment = Deployment {
            id: generate_uuid(),
            name: request.name,
            namespace: request
                .namespace
                .filter(|ns| !ns.trim().is_empty())
                .unwrap_or_else(|| "default".to_string()),
            description: request.description,
            artifact: request.artifact,
            selector: request.selector,
            strategy: request.strategy,
            status: DeploymentStatus::Pending,
            created_by: request.created_by,
            created_at: now,
            updated_at: now,
            rolled_back_count: 0,
            failure_reason: None,
            abort_threshold: request.abort_threshold,
        };
        self.store.insert_deployment(&deployment).await?;

        info!(
            deployment = %deployment.id,
            name = %deployment.name,
            strategy = deployment.strategy.name(),
            "Deployment created"
        );
        self.publish_deployment(&deployment);
        Ok(deployment)
    }

    /// Create a deployment from a YAML or JSON manifest.
    ///
    /// Percentages in the manifest resolve against the devices its selector
    /// matches right now.
    pub async fn create_deployment_from_manifest(
        &self,
        data: &[u8],
        created_by: &str,
    ) -> Result<Deployment, FleetError> {
        let manifest = parse_manifest(data)?;
        let targets = self.directory.resolve(&manifest.selector()).await?;
        let request = manifest.to_new_deployment(targets.len(), created_by)?;
        self.create_deployment(request).await
    }

    pub async fn get_deployment(&self, id: &str) -> Result<Deployment, FleetError> {
        self.store
            .get_deployment(id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("deployment {}", id)))
    }

    pub async fn list_deployments(
        &self,
        filter: &DeploymentFilter,
    ) -> Result<Vec<Deployment>, FleetError> {
        self.store.list_deployments(filter).await
    }

    /// Resolve targets, create the device rows and dispatch the first batch
    pub async fn start_deployment(self: &Arc<Self>, id: &str) -> Result<Deployment, FleetError> {
        let handle = self.handle(id);
        {
            let _step = handle.step.lock().await;
            let deployment = self.get_deployment(id).await?;
            next_status(deployment.status, &DeploymentEvent::Start)?;

            let targets = self.directory.resolve(&deployment.selector).await?;
            if targets.is_empty() {
                return Err(FleetError::InvalidInput(format!(
                    "deployment {} selector matches no devices",
                    id
                )));
            }
            let rows = self.store.insert_device_deployments(id, &targets).await?;
            let deployment = self
                .transition(id, deployment.status, DeploymentEvent::Start, |change| change)
                .await?;
            info!(deployment = %id, devices = rows, "Deployment started");

            // The driver retries if the first dispatch fails
            if let Err(e) = self.advance_locked(&deployment, &handle).await {
                warn!(deployment = %id, "Initial dispatch failed: {}", e);
            }
        }

        self.ensure_driver(id, &handle);
        self.get_deployment(id).await
    }

    /// Pause a running deployment and its in-flight campaigns
    pub async fn pause_deployment(&self, id: &str) -> Result<Deployment, FleetError> {
        let handle = self.handle(id);
        let result = {
            let _step = handle.step.lock().await;
            self.pause_locked(id).await
        };
        if result.is_err() {
            self.release_if_finished(id).await;
        }
        result
    }

    async fn pause_locked(&self, id: &str) -> Result<Deployment, FleetError> {
        let deployment = self.get_deployment(id).await?;
        next_status(deployment.status, &DeploymentEvent::Pause)?;
        for campaign_id in self.store.deployment_campaigns(id).await? {
            self.client.pause_campaign(&campaign_id).await?;
        }

        let deployment = self
            .transition(id, deployment.status, DeploymentEvent::Pause, |change| change)
            .await?;
        info!(deployment = %id, "Deployment paused");
        Ok(deployment)
    }

    /// Resume a paused deployment and re-evaluate it
    pub async fn resume_deployment(self: &Arc<Self>, id: &str) -> Result<Deployment, FleetError> {
        let handle = self.handle(id);
        let resumed = {
            let _step = handle.step.lock().await;
            self.resume_locked(id, &handle).await
        };
        if let Err(e) = resumed {
            self.release_if_finished(id).await;
            return Err(e);
        }

        self.ensure_driver(id, &handle);
        handle.wake.notify_one();
        self.get_deployment(id).await
    }

    async fn resume_locked(&self, id: &str, handle: &RolloutHandle) -> Result<(), FleetError> {
        let deployment = self.get_deployment(id).await?;
        next_status(deployment.status, &DeploymentEvent::Resume)?;
        for campaign_id in self.store.deployment_campaigns(id).await? {
            self.client.resume_campaign(&campaign_id).await?;
        }

        let deployment = self
            .transition(id, deployment.status, DeploymentEvent::Resume, |change| change)
            .await?;
        info!(deployment = %id, "Deployment resumed");

        if let Err(e) = self.advance_locked(&deployment, handle).await {
            warn!(deployment = %id, "Evaluation after resume failed: {}", e);
        }
        Ok(())
    }

    /// Cancel a deployment. Devices that have not finished are failed.
    pub async fn cancel_deployment(&self, id: &str) -> Result<Deployment, FleetError> {
        let handle = self.handle(id);
        let deployment = {
            let _step = handle.step.lock().await;

            let deployment = self.get_deployment(id).await?;
            next_status(deployment.status, &DeploymentEvent::Cancel)?;
            self.cancel_campaigns(id).await?;

            let now = Utc::now();
            for row in self.store.list_device_deployments(id).await? {
                if row.status.is_terminal() {
                    continue;
                }
                let change = DeviceChange::to(DeviceStatus::Failed)
                    .with_message("cancelled")
                    .started(now);
                if let Some(row) = self
                    .store
                    .update_device_deployment(id, &row.device_id, &[row.status], change)
                    .await?
                {
                    self.publish_device(&row.deployment_id, &row.device_id, row.status, row.progress);
                }
            }

            self.transition(id, deployment.status, DeploymentEvent::Cancel, |change| {
                change.with_reason("cancelled")
            })
            .await?
        };

        self.release(id);
        info!(deployment = %id, "Deployment cancelled");
        Ok(deployment)
    }

    /// Roll back every device that received the artifact.
    ///
    /// With `force` the deployment is marked rolled back even when the
    /// rollback could not be handed to the devices.
    pub async fn rollback_deployment(
        &self,
        id: &str,
        reason: &str,
        force: bool,
    ) -> Result<Deployment, FleetError> {
        let handle = self.handle(id);
        let result = {
            let _step = handle.step.lock().await;
            match self.get_deployment(id).await {
                Ok(deployment) => self.rollback_locked(&deployment, reason, force).await,
                Err(e) => Err(e),
            }
        };
        self.release_if_finished(id).await;
        result
    }

    /// Record a device status report and re-evaluate the rollout
    pub async fn report_device_status(
        &self,
        deployment_id: &str,
        device_id: &str,
        report: DeviceReport,
    ) -> Result<ReportOutcome, FleetError> {
        let deployment = self.get_deployment(deployment_id).await?;
        let row = self
            .store
            .get_device_deployment(deployment_id, device_id)
            .await?
            .ok_or_else(|| {
                FleetError::NotFound(format!(
                    "device {} in deployment {}",
                    device_id, deployment_id
                ))
            })?;
        let applied = if row.awaiting_rollback() {
            self.apply_rollback_report(deployment_id, device_id, &report).await?
        } else {
            self.apply_report(deployment_id, device_id, &report).await?
        };

        if applied && deployment.status == DeploymentStatus::Running {
            if let Err(e) = self.advance(deployment_id, false).await {
                warn!(deployment = %deployment_id, "Evaluation after report failed: {}", e);
            }
        }

        let deployment = self.get_deployment(deployment_id).await?;
        let devices = self.store.list_device_deployments(deployment_id).await?;
        Ok(ReportOutcome {
            applied,
            deployment_status: deployment.status,
            progress: DeploymentProgress::from_devices(&devices),
        })
    }

    /// Aggregate status of a deployment
    pub async fn get_deployment_status(
        &self,
        id: &str,
    ) -> Result<DeploymentStatusReport, FleetError> {
        let deployment = self.get_deployment(id).await?;
        let devices = self.store.list_device_deployments(id).await?;
        let awaiting_promotion = self
            .existing_handle(id)
            .is_some_and(|handle| handle.awaiting_promotion.load(Ordering::SeqCst));

        Ok(DeploymentStatusReport {
            deployment_id: deployment.id,
            status: deployment.status,
            progress: DeploymentProgress::from_devices(&devices),
            rolled_back_count: deployment.rolled_back_count,
            failure_reason: deployment.failure_reason,
            awaiting_promotion,
        })
    }

    /// Approve a canary: skip the rest of its validation window and release
    /// the remaining fleet once the success rate holds.
    pub async fn promote_deployment(&self, id: &str) -> Result<DeploymentStatusReport, FleetError> {
        let deployment = self.get_deployment(id).await?;
        if deployment.status != DeploymentStatus::Running {
            self.release_if_finished(id).await;
            return Err(FleetError::InvalidState(format!(
                "cannot promote a {} deployment",
                deployment.status
            )));
        }
        if !matches!(deployment.strategy, Strategy::Canary(_)) {
            return Err(FleetError::InvalidInput(format!(
                "deployment {} does not use a canary strategy",
                id
            )));
        }

        let handle = self.handle(id);
        handle.promotion_confirmed.store(true, Ordering::SeqCst);
        info!(deployment = %id, "Canary promotion confirmed");
        self.advance(id, false).await?;
        handle.wake.notify_one();
        self.get_deployment_status(id).await
    }

    /// Poll campaign progress, fail timed-out devices and re-evaluate
    pub async fn reconcile(&self, id: &str) -> Result<StepOutcome, FleetError> {
        self.advance(id, true).await
    }

    /// Reconcile every running deployment and make sure each has a driver.
    ///
    /// Returns the number of running deployments visited.
    pub async fn reconcile_all(self: &Arc<Self>) -> Result<usize, FleetError> {
        let filter = DeploymentFilter {
            status: Some(DeploymentStatus::Running),
            ..Default::default()
        };
        let running = self.store.list_deployments(&filter).await?;
        for deployment in &running {
            if let Err(e) = self.reconcile(&deployment.id).await {
                warn!(deployment = %deployment.id, "Reconcile failed: {}", e);
            }
            let handle = self.handle(&deployment.id);
            self.ensure_driver(&deployment.id, &handle);
        }
        Ok(running.len())
    }

    /// Stop every driver task
    pub fn shutdown(&self) {
        let rollouts = std::mem::take(&mut *self.lock_rollouts());
        for handle in rollouts.values() {
            handle.cancel.cancel();
        }
        debug!("Stopped {} rollout drivers", rollouts.len());
    }

    async fn advance(&self, id: &str, poll: bool) -> Result<StepOutcome, FleetError> {
        let handle = self.handle(id);
        let _step = handle.step.lock().await;

        let deployment = self.get_deployment(id).await?;
        if deployment.status != DeploymentStatus::Running {
            if deployment.status.is_terminal() {
                self.release(id);
            }
            return Ok(StepOutcome::Inactive(deployment.status));
        }
        if poll {
            self.sync_campaigns(id).await;
            self.enforce_batch_timeout(id).await?;
        }
        self.advance_locked(&deployment, &handle).await
    }

    async fn advance_locked(
        &self,
        deployment: &Deployment,
        handle: &RolloutHandle,
    ) -> Result<StepOutcome, FleetError> {
        let id = deployment.id.as_str();
        let devices = self.store.list_device_deployments(id).await?;
        let confirmed = handle.promotion_confirmed.load(Ordering::SeqCst);
        let snapshot = RolloutSnapshot {
            devices: &devices,
            now: Utc::now(),
            abort_threshold: deployment.abort_threshold(self.options.default_abort_threshold),
            validation_waived: confirmed,
        };
        let evaluation = evaluate(&deployment.strategy, &snapshot);

        match &evaluation.decision {
            Decision::Continue => {
                if !evaluation.next_batch.is_empty() {
                    self.dispatch(deployment, &evaluation.next_batch).await?;
                }
            }
            Decision::PauseForValidation { remaining } => {
                debug!(deployment = %id, "Canary validation, {:?} remaining", remaining);
            }
            Decision::Promote => {
                let auto_promote = matches!(&deployment.strategy, Strategy::Canary(cfg) if cfg.auto_promote);
                if auto_promote || confirmed {
                    handle.awaiting_promotion.store(false, Ordering::SeqCst);
                    info!(deployment = %id, devices = evaluation.next_batch.len(), "Promoting canary");
                    self.dispatch(deployment, &evaluation.next_batch).await?;
                } else if !handle.awaiting_promotion.swap(true, Ordering::SeqCst) {
                    info!(deployment = %id, "Canary passed validation, awaiting promotion");
                    self.bus.publish(RolloutEvent::AwaitingPromotion {
                        deployment_id: id.to_string(),
                    });
                }
            }
            Decision::Abort { reason } => {
                warn!(deployment = %id, "Aborting rollout: {}", reason);
                self.rollback_locked(deployment, reason, false).await?;
                self.release(id);
            }
            Decision::Complete => {
                self.transition(id, deployment.status, DeploymentEvent::Complete, |change| change)
                    .await?;
                self.release(id);
                info!(deployment = %id, "Deployment completed");
            }
        }

        Ok(StepOutcome::Decided(evaluation.decision))
    }

    async fn dispatch(&self, deployment: &Deployment, batch: &[String]) -> Result<(), FleetError> {
        let id = deployment.id.as_str();
        let campaign_id = self.client.create_campaign(deployment, batch).await?;
        self.store.attach_campaign(id, &campaign_id).await?;

        let now = Utc::now();
        for device_id in batch {
            let change = DeviceChange::to(DeviceStatus::Pending)
                .with_message(format!("dispatched in campaign {}", campaign_id))
                .started(now);
            self.store
                .update_device_deployment(id, device_id, &[DeviceStatus::Pending], change)
                .await?;
        }

        self.metrics.batch_dispatched(batch.len());
        self.bus.publish(RolloutEvent::BatchDispatched {
            deployment_id: id.to_string(),
            campaign_id: campaign_id.clone(),
            device_ids: batch.to_vec(),
        });
        info!(deployment = %id, campaign = %campaign_id, devices = batch.len(), "Batch dispatched");
        Ok(())
    }

    async fn rollback_locked(
        &self,
        deployment: &Deployment,
        reason: &str,
        force: bool,
    ) -> Result<Deployment, FleetError> {
        let id = deployment.id.as_str();
        next_status(deployment.status, &DeploymentEvent::RollBack)?;

        if let Err(e) = self.cancel_campaigns(id).await {
            warn!(deployment = %id, "Failed to cancel campaigns before rollback: {}", e);
        }

        let devices = self.store.list_device_deployments(id).await?;
        let targets: Vec<&DeviceDeployment> = devices
            .iter()
            .filter(|d| matches!(d.status, DeviceStatus::Installed | DeviceStatus::Failed))
            .collect();

        // Marked before the hand-over so an early answer finds its row waiting
        let mut requested = Vec::with_capacity(targets.len());
        for row in &targets {
            let change = DeviceChange::to(row.status)
                .with_message(format!("rollback requested: {}", reason))
                .with_rollback(RollbackState::Requested);
            if self
                .store
                .update_device_deployment(id, &row.device_id, &[row.status], change)
                .await?
                .is_some()
            {
                requested.push(row.device_id.clone());
            }
        }

        let handed_over = if requested.is_empty() {
            Vec::new()
        } else {
            match self.client.rollback_devices(deployment, &requested, reason).await {
                Ok(ids) => ids,
                Err(e) if force => {
                    error!(deployment = %id, "Rollback dispatch failed, forcing: {}", e);
                    Vec::new()
                }
                Err(e) => {
                    self.clear_rollback_marks(id, &requested).await;
                    return Err(e);
                }
            }
        };

        // Devices caught mid-update lose their campaign
        for row in devices.iter().filter(|d| d.is_in_flight()) {
            let change = DeviceChange::to(DeviceStatus::Failed)
                .with_message(format!("rollout aborted: {}", reason));
            if let Some(row) = self
                .store
                .update_device_deployment(id, &row.device_id, &[row.status], change)
                .await?
            {
                self.publish_device(id, &row.device_id, row.status, row.progress);
            }
        }

        let reason = reason.to_string();
        let mut deployment = self
            .transition(id, deployment.status, DeploymentEvent::RollBack, move |change| {
                change.with_reason(reason)
            })
            .await?;

        for device_id in requested.iter().filter(|d| !handed_over.contains(*d)) {
            let outcome = RollbackOutcome::Failed("rollback was not delivered".to_string());
            if let Some((updated, row)) = self
                .store
                .record_rollback_outcome(id, device_id, outcome)
                .await?
            {
                self.publish_device(id, device_id, row.status, row.progress);
                deployment = updated;
            }
        }
        warn!(
            deployment = %id,
            devices = handed_over.len(),
            "Deployment rolled back, awaiting device confirmation"
        );
        Ok(deployment)
    }

    async fn clear_rollback_marks(&self, id: &str, device_ids: &[String]) {
        for device_id in device_ids {
            let Ok(Some(row)) = self.store.get_device_deployment(id, device_id).await else {
                continue;
            };
            let change = DeviceChange::to(row.status).clear_rollback();
            if let Err(e) = self
                .store
                .update_device_deployment(id, device_id, &[row.status], change)
                .await
            {
                warn!(deployment = %id, device = %device_id, "Failed to clear rollback mark: {}", e);
            }
        }
    }

    /// Record a device's answer to a rollback it was handed
    async fn apply_rollback_report(
        &self,
        deployment_id: &str,
        device_id: &str,
        report: &DeviceReport,
    ) -> Result<bool, FleetError> {
        let outcome = match report.status {
            DeviceStatus::RolledBack => RollbackOutcome::Confirmed,
            DeviceStatus::Failed => RollbackOutcome::Failed(
                report
                    .message
                    .clone()
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "no reason given".to_string()),
            ),
            _ => {
                self.metrics.report_ignored();
                return Ok(false);
            }
        };

        match self
            .store
            .record_rollback_outcome(deployment_id, device_id, outcome)
            .await?
        {
            Some((deployment, row)) => {
                self.metrics.report_received(row.status);
                self.publish_device(deployment_id, device_id, row.status, row.progress);
                self.publish_deployment(&deployment);
                match row.status {
                    DeviceStatus::RolledBack => {
                        info!(deployment = %deployment_id, device = %device_id, "Device rolled back")
                    }
                    _ => warn!(deployment = %deployment_id, device = %device_id, "Device rollback failed: {}", row.message),
                }
                Ok(true)
            }
            None => {
                self.metrics.report_ignored();
                Ok(false)
            }
        }
    }

    async fn apply_report(
        &self,
        deployment_id: &str,
        device_id: &str,
        report: &DeviceReport,
    ) -> Result<bool, FleetError> {
        let mut change = DeviceChange::to(report.status).started(Utc::now());
        if let Some(progress) = report.progress {
            change = change.with_progress(progress);
        }
        if let Some(message) = &report.message {
            change = change.with_message(message.clone());
        }

        let expected = device_predecessors(report.status);
        match self
            .store
            .update_device_deployment(deployment_id, device_id, &expected, change)
            .await?
        {
            Some(row) => {
                self.metrics.report_received(row.status);
                self.publish_device(deployment_id, device_id, row.status, row.progress);
                debug!(deployment = %deployment_id, device = %device_id, status = %row.status, "Device report applied");
                Ok(true)
            }
            None => {
                self.metrics.report_ignored();
                debug!(deployment = %deployment_id, device = %device_id, status = %report.status, "Device report ignored");
                Ok(false)
            }
        }
    }

    /// Fold campaign-side device statuses into the deployment rows
    async fn sync_campaigns(&self, id: &str) {
        let campaigns = match self.store.deployment_campaigns(id).await {
            Ok(campaigns) => campaigns,
            Err(e) => {
                warn!(deployment = %id, "Failed to list campaigns: {}", e);
                return;
            }
        };

        let known: HashMap<String, DeviceStatus> = match self.store.list_device_deployments(id).await {
            Ok(rows) => rows.into_iter().map(|r| (r.device_id, r.status)).collect(),
            Err(e) => {
                warn!(deployment = %id, "Failed to list devices: {}", e);
                return;
            }
        };

        for campaign_id in campaigns {
            let progress = match self.client.get_campaign_status(&campaign_id).await {
                Ok(progress) => progress,
                Err(e) => {
                    warn!(deployment = %id, campaign = %campaign_id, "Failed to poll campaign: {}", e);
                    continue;
                }
            };
            for device in progress.devices {
                if known.get(&device.device_id) == Some(&device.status) {
                    continue;
                }
                let report = DeviceReport {
                    status: device.status,
                    progress: None,
                    message: device.error_message,
                };
                if let Err(e) = self.apply_report(id, &device.device_id, &report).await {
                    debug!(deployment = %id, device = %device.device_id, "Skipping campaign row: {}", e);
                }
            }
        }
    }

    async fn enforce_batch_timeout(&self, id: &str) -> Result<(), FleetError> {
        let now = Utc::now();
        for row in self.store.list_device_deployments(id).await? {
            let Some(started_at) = row.started_at else {
                continue;
            };
            if !row.is_in_flight() {
                continue;
            }
            let elapsed = (now - started_at).to_std().unwrap_or(Duration::ZERO);
            if elapsed <= self.options.batch_timeout {
                continue;
            }

            let change = DeviceChange::to(DeviceStatus::Failed)
                .with_message(format!("no final report after {:?}", self.options.batch_timeout));
            if let Some(row) = self
                .store
                .update_device_deployment(id, &row.device_id, &[row.status], change)
                .await?
            {
                warn!(deployment = %id, device = %row.device_id, "Device timed out");
                self.publish_device(id, &row.device_id, row.status, row.progress);
            }
        }
        Ok(())
    }

    async fn cancel_campaigns(&self, id: &str) -> Result<(), FleetError> {
        for campaign_id in self.store.deployment_campaigns(id).await? {
            if let Err(e) = self.client.cancel_campaign(&campaign_id).await {
                warn!(deployment = %id, campaign = %campaign_id, "Failed to cancel campaign: {}", e);
            }
        }
        Ok(())
    }

    async fn transition<F>(
        &self,
        id: &str,
        from: DeploymentStatus,
        event: DeploymentEvent,
        amend: F,
    ) -> Result<Deployment, FleetError>
    where
        F: FnOnce(DeploymentChange) -> DeploymentChange + Send,
    {
        let to = next_status(from, &event)?;
        let mut change = amend(DeploymentChange::to(to));
        if let DeploymentEvent::Fail(reason) = &event {
            change = change.with_reason(reason.clone());
        }

        let deployment = self
            .store
            .transition_deployment(id, from, change)
            .await?
            .ok_or_else(|| {
                FleetError::InvalidState(format!(
                    "deployment {} is no longer {}, cannot {}",
                    id,
                    from,
                    event.name()
                ))
            })?;

        if deployment.status.is_terminal() {
            self.metrics.deployment_finished(deployment.status);
        }
        self.publish_deployment(&deployment);
        Ok(deployment)
    }

    fn ensure_driver(self: &Arc<Self>, id: &str, handle: &Arc<RolloutHandle>) {
        if handle.driver_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let orchestrator = Arc::clone(self);
        let handle = Arc::clone(handle);
        let id = id.to_string();
        tokio::spawn(async move {
            orchestrator.drive(&id, &handle).await;
            handle.driver_running.store(false, Ordering::SeqCst);
        });
    }

    async fn drive(&self, id: &str, handle: &RolloutHandle) {
        debug!(deployment = %id, "Rollout driver starting");
        let interval = self.options.reconcile_interval;
        let mut wait = interval;

        loop {
            tokio::select! {
                _ = handle.cancel.cancelled() => {
                    debug!(deployment = %id, "Rollout driver stopped");
                    return;
                }
                _ = handle.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }

            wait = match self.reconcile(id).await {
                Ok(StepOutcome::Inactive(status)) if status.is_terminal() => return,
                Ok(StepOutcome::Decided(Decision::Complete | Decision::Abort { .. })) => return,
                Ok(StepOutcome::Decided(Decision::PauseForValidation { remaining })) => {
                    remaining.min(interval)
                }
                Ok(_) => interval,
                Err(FleetError::NotFound(_)) => return,
                Err(e) => {
                    warn!(deployment = %id, "Rollout step failed: {}", e);
                    interval
                }
            };
        }
    }

    fn lock_rollouts(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<RolloutHandle>>> {
        self.rollouts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle(&self, id: &str) -> Arc<RolloutHandle> {
        Arc::clone(self.lock_rollouts().entry(id.to_string()).or_default())
    }

    fn existing_handle(&self, id: &str) -> Option<Arc<RolloutHandle>> {
        self.lock_rollouts().get(id).cloned()
    }

    /// Release the handle of a deployment that has reached a final status
    async fn release_if_finished(&self, id: &str) {
        match self.store.get_deployment(id).await {
            Ok(Some(deployment)) if !deployment.status.is_terminal() => {}
            Ok(_) => self.release(id),
            Err(e) => debug!(deployment = %id, "Keeping rollout handle: {}", e),
        }
    }

    /// Forget a finished deployment and stop its driver
    fn release(&self, id: &str) {
        if let Some(handle) = self.lock_rollouts().remove(id) {
            handle.cancel.cancel();
        }
    }

    fn publish_deployment(&self, deployment: &Deployment) {
        self.bus.publish(RolloutEvent::Deployment {
            deployment_id: deployment.id.clone(),
            status: deployment.status,
            at: deployment.updated_at,
        });
    }

    fn publish_device(&self, deployment_id: &str, device_id: &str, status: DeviceStatus, progress: u8) {
        self.bus.publish(RolloutEvent::Status(StatusEvent {
            deployment_id: deployment_id.to_string(),
            device_id: device_id.to_string(),
            status,
            progress,
            at: Utc::now(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use async_trait::async_trait;

    use crate::models::campaign::{CampaignProgress, CampaignStatus};
    use crate::models::deployment::{ArtifactRef, ArtifactType, Selector};
    use crate::models::device::DeviceRecord;
    use crate::models::strategy::{CanaryConfig, RollingConfig};
    use crate::rollout::directory::InMemoryDeviceDirectory;
    use crate::storage::memory::MemoryStore;
    use crate::telemetry::AtomicRolloutMetrics;

    const CHECKSUM: &str = "sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    /// Records calls instead of talking to devices
    #[derive(Default)]
    struct FakeClient {
        campaigns: Mutex<Vec<Vec<String>>>,
        paused: Mutex<Vec<String>>,
        cancelled: Mutex<Vec<String>>,
        rollbacks: Mutex<Vec<Vec<String>>>,
        rollback_unreachable: AtomicBool,
    }

    impl FakeClient {
        fn batches(&self) -> Vec<Vec<String>> {
            self.campaigns.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UpdateClient for FakeClient {
        async fn create_campaign(
            &self,
            _deployment: &Deployment,
            device_ids: &[String],
        ) -> Result<String, FleetError> {
            let mut campaigns = self.campaigns.lock().unwrap();
            campaigns.push(device_ids.to_vec());
            Ok(format!("campaign-{}", campaigns.len()))
        }

        async fn get_campaign_status(&self, campaign_id: &str) -> Result<CampaignProgress, FleetError> {
            Ok(CampaignProgress {
                campaign_id: campaign_id.to_string(),
                status: CampaignStatus::InProgress,
                total_devices: 0,
                updated_devices: 0,
                failed_devices: 0,
                devices: vec![],
            })
        }

        async fn pause_campaign(&self, campaign_id: &str) -> Result<(), FleetError> {
            self.paused.lock().unwrap().push(campaign_id.to_string());
            Ok(())
        }

        async fn resume_campaign(&self, _campaign_id: &str) -> Result<(), FleetError> {
            Ok(())
        }

        async fn cancel_campaign(&self, campaign_id: &str) -> Result<(), FleetError> {
            self.cancelled.lock().unwrap().push(campaign_id.to_string());
            Ok(())
        }

        async fn rollback_devices(
            &self,
            _deployment: &Deployment,
            device_ids: &[String],
            _reason: &str,
        ) -> Result<Vec<String>, FleetError> {
            if self.rollback_unreachable.load(Ordering::SeqCst) {
                return Err(FleetError::Transient("campaign service unreachable".to_string()));
            }
            self.rollbacks.lock().unwrap().push(device_ids.to_vec());
            Ok(device_ids.to_vec())
        }
    }

    struct Fixture {
        orchestrator: Arc<Orchestrator>,
        client: Arc<FakeClient>,
        store: Arc<MemoryStore>,
        metrics: Arc<AtomicRolloutMetrics>,
    }

    fn fixture(devices: usize) -> Fixture {
        let directory = InMemoryDeviceDirectory::with_devices(
            (0..devices).map(|i| DeviceRecord::new(&format!("dev-{:02}", i)).with_label("env", "prod")),
        );
        let client = Arc::new(FakeClient::default());
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(AtomicRolloutMetrics::new());
        let options = OrchestratorOptions {
            reconcile_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            client.clone(),
            Arc::new(directory),
            metrics.clone(),
            options,
        ));
        Fixture {
            orchestrator,
            client,
            store,
            metrics,
        }
    }

    fn request(strategy: Strategy) -> NewDeployment {
        NewDeployment {
            name: "agent-rollout".to_string(),
            namespace: None,
            description: String::new(),
            artifact: ArtifactRef {
                name: "agent".to_string(),
                artifact_type: ArtifactType::Binary,
                version: "2.0.0".to_string(),
                locator: "https://artifacts.local/agent-2.0.0".to_string(),
                checksum: CHECKSUM.to_string(),
                signature: None,
            },
            selector: Selector::Labels {
                match_labels: BTreeMap::from([("env".to_string(), "prod".to_string())]),
            },
            strategy,
            created_by: "ops".to_string(),
            abort_threshold: None,
        }
    }

    async fn report(f: &Fixture, deployment: &str, device: &str, status: DeviceStatus) -> ReportOutcome {
        f.orchestrator
            .report_device_status(deployment, device, DeviceReport::new(status))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_immediate_rollout_completes() {
        let f = fixture(3);
        let mut events = f.orchestrator.subscribe();
        let deployment = f.orchestrator.create_deployment(request(Strategy::Immediate)).await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Pending);
        assert_eq!(deployment.namespace, "default");

        let deployment = f.orchestrator.start_deployment(&deployment.id).await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Running);
        assert_eq!(f.client.batches(), vec![vec!["dev-00", "dev-01", "dev-02"]]);

        for device in ["dev-00", "dev-01"] {
            let outcome = report(&f, &deployment.id, device, DeviceStatus::Installed).await;
            assert!(outcome.applied);
            assert_eq!(outcome.deployment_status, DeploymentStatus::Running);
        }
        let outcome = report(&f, &deployment.id, "dev-02", DeviceStatus::Installed).await;
        assert_eq!(outcome.deployment_status, DeploymentStatus::Completed);
        assert_eq!(outcome.progress.percentage, 100);

        let status = f.orchestrator.get_deployment_status(&deployment.id).await.unwrap();
        assert_eq!(status.status, DeploymentStatus::Completed);
        assert_eq!(status.progress.installed, 3);
        assert_eq!(f.metrics.snapshot().deployments_completed, 1);

        let mut saw_completed = false;
        while let Ok(event) = events.try_recv() {
            if let RolloutEvent::Deployment { status: DeploymentStatus::Completed, .. } = event {
                saw_completed = true;
            }
        }
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn test_failed_canary_rolls_back() {
        let f = fixture(10);
        let strategy = Strategy::Canary(CanaryConfig {
            canary_percentage: 20,
            validation_duration_ms: 0,
            auto_promote: true,
            success_threshold: 90,
        });
        let deployment = f.orchestrator.create_deployment(request(strategy)).await.unwrap();
        f.orchestrator.start_deployment(&deployment.id).await.unwrap();
        assert_eq!(f.client.batches(), vec![vec!["dev-00", "dev-01"]]);

        report(&f, &deployment.id, "dev-00", DeviceStatus::Failed).await;
        let outcome = report(&f, &deployment.id, "dev-01", DeviceStatus::Failed).await;
        assert_eq!(outcome.deployment_status, DeploymentStatus::RolledBack);

        let deployment = f.orchestrator.get_deployment(&deployment.id).await.unwrap();
        assert_eq!(deployment.rolled_back_count, 0);
        assert!(deployment.failure_reason.unwrap().contains("success rate"));
        assert_eq!(f.client.batches().len(), 1);
        assert_eq!(*f.client.rollbacks.lock().unwrap(), vec![vec!["dev-00", "dev-01"]]);

        let rows = f.store.list_device_deployments(&deployment.id).await.unwrap();
        let untouched = rows.iter().filter(|r| r.status == DeviceStatus::Pending).count();
        assert_eq!(untouched, 8);
        assert!(rows[..2].iter().all(|r| r.awaiting_rollback()));
    }

    #[tokio::test]
    async fn test_rollback_counts_confirmed_devices_only() {
        let f = fixture(3);
        let deployment = f.orchestrator.create_deployment(request(Strategy::Immediate)).await.unwrap();
        f.orchestrator.start_deployment(&deployment.id).await.unwrap();
        for device in ["dev-00", "dev-01", "dev-02"] {
            report(&f, &deployment.id, device, DeviceStatus::Installed).await;
        }
        f.orchestrator
            .rollback_deployment(&deployment.id, "bad release", false)
            .await
            .unwrap();

        let outcome = report(&f, &deployment.id, "dev-00", DeviceStatus::RolledBack).await;
        assert!(outcome.applied);
        assert_eq!(outcome.progress.rolled_back, 1);
        let outcome = f
            .orchestrator
            .report_device_status(
                &deployment.id,
                "dev-01",
                DeviceReport::new(DeviceStatus::Failed).with_message("no backup to restore"),
            )
            .await
            .unwrap();
        assert!(outcome.applied);
        // a second answer changes nothing
        assert!(!report(&f, &deployment.id, "dev-00", DeviceStatus::Failed).await.applied);

        let deployment = f.orchestrator.get_deployment(&deployment.id).await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::RolledBack);
        assert_eq!(deployment.rolled_back_count, 1);
        assert_eq!(
            deployment.failure_reason.as_deref(),
            Some("bad release; rollback failed on dev-01: no backup to restore")
        );

        let rows = f.store.list_device_deployments(&deployment.id).await.unwrap();
        assert_eq!(rows[0].status, DeviceStatus::RolledBack);
        assert_eq!(rows[0].rollback, Some(RollbackState::Confirmed));
        assert_eq!(rows[1].status, DeviceStatus::Failed);
        assert_eq!(rows[1].rollback, Some(RollbackState::Failed));
        assert_eq!(rows[1].message, "rollback failed: no backup to restore");
        assert_eq!(rows[2].status, DeviceStatus::Installed);
        assert!(rows[2].awaiting_rollback());
    }

    #[tokio::test]
    async fn test_undelivered_rollback_keeps_deployment() {
        let f = fixture(1);
        let deployment = f.orchestrator.create_deployment(request(Strategy::Immediate)).await.unwrap();
        f.orchestrator.start_deployment(&deployment.id).await.unwrap();
        report(&f, &deployment.id, "dev-00", DeviceStatus::Installed).await;
        f.client.rollback_unreachable.store(true, Ordering::SeqCst);

        let err = f
            .orchestrator
            .rollback_deployment(&deployment.id, "bad release", false)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        let current = f.orchestrator.get_deployment(&deployment.id).await.unwrap();
        assert_eq!(current.status, DeploymentStatus::Completed);
        let row = f
            .store
            .get_device_deployment(&deployment.id, "dev-00")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.rollback, None);

        let forced = f
            .orchestrator
            .rollback_deployment(&deployment.id, "bad release", true)
            .await
            .unwrap();
        assert_eq!(forced.status, DeploymentStatus::RolledBack);
        assert_eq!(forced.rolled_back_count, 0);
        assert_eq!(
            forced.failure_reason.as_deref(),
            Some("bad release; rollback failed on dev-00: rollback was not delivered")
        );
        assert!(f.orchestrator.existing_handle(&deployment.id).is_none());
    }

    #[tokio::test]
    async fn test_failed_commands_release_finished_deployments() {
        let f = fixture(1);
        let deployment = f.orchestrator.create_deployment(request(Strategy::Immediate)).await.unwrap();
        f.orchestrator.start_deployment(&deployment.id).await.unwrap();
        report(&f, &deployment.id, "dev-00", DeviceStatus::Installed).await;
        assert!(f.orchestrator.existing_handle(&deployment.id).is_none());

        let err = f.orchestrator.pause_deployment(&deployment.id).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidState(_)));
        assert!(f.orchestrator.existing_handle(&deployment.id).is_none());

        assert!(f.orchestrator.resume_deployment(&deployment.id).await.is_err());
        assert!(f.orchestrator.promote_deployment(&deployment.id).await.is_err());
        assert_eq!(
            f.orchestrator.reconcile(&deployment.id).await.unwrap(),
            StepOutcome::Inactive(DeploymentStatus::Completed)
        );
        assert!(f.orchestrator.existing_handle(&deployment.id).is_none());

        // a paused deployment keeps its handle after a rejected command
        let f = fixture(2);
        let deployment = f.orchestrator.create_deployment(request(Strategy::Immediate)).await.unwrap();
        f.orchestrator.start_deployment(&deployment.id).await.unwrap();
        f.orchestrator.pause_deployment(&deployment.id).await.unwrap();
        assert!(f.orchestrator.pause_deployment(&deployment.id).await.is_err());
        assert!(f.orchestrator.existing_handle(&deployment.id).is_some());
        f.orchestrator.shutdown();
    }

    #[tokio::test]
    async fn test_successful_canary_promotes_rest() {
        let f = fixture(10);
        let strategy = Strategy::Canary(CanaryConfig {
            canary_percentage: 20,
            validation_duration_ms: 0,
            auto_promote: true,
            success_threshold: 90,
        });
        let deployment = f.orchestrator.create_deployment(request(strategy)).await.unwrap();
        f.orchestrator.start_deployment(&deployment.id).await.unwrap();

        report(&f, &deployment.id, "dev-00", DeviceStatus::Installed).await;
        report(&f, &deployment.id, "dev-01", DeviceStatus::Installed).await;

        let batches = f.client.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].len(), 8);
        assert_eq!(batches[1][0], "dev-02");
    }

    #[tokio::test]
    async fn test_manual_promotion() {
        let f = fixture(4);
        let strategy = Strategy::Canary(CanaryConfig {
            canary_percentage: 25,
            validation_duration_ms: 0,
            auto_promote: false,
            success_threshold: 90,
        });
        let deployment = f.orchestrator.create_deployment(request(strategy)).await.unwrap();
        f.orchestrator.start_deployment(&deployment.id).await.unwrap();
        report(&f, &deployment.id, "dev-00", DeviceStatus::Installed).await;

        let status = f.orchestrator.get_deployment_status(&deployment.id).await.unwrap();
        assert!(status.awaiting_promotion);
        assert_eq!(f.client.batches().len(), 1);

        let status = f.orchestrator.promote_deployment(&deployment.id).await.unwrap();
        assert!(!status.awaiting_promotion);
        assert_eq!(f.client.batches()[1], vec!["dev-01", "dev-02", "dev-03"]);
    }

    #[tokio::test]
    async fn test_promote_rejects_non_canary() {
        let f = fixture(2);
        let deployment = f.orchestrator.create_deployment(request(Strategy::Immediate)).await.unwrap();
        let err = f.orchestrator.promote_deployment(&deployment.id).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidState(_)));

        f.orchestrator.start_deployment(&deployment.id).await.unwrap();
        let err = f.orchestrator.promote_deployment(&deployment.id).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_rolling_releases_next_batch_after_reports() {
        let f = fixture(5);
        let strategy = Strategy::Rolling(RollingConfig {
            batch_size: 2,
            max_unavailable: 0,
            max_surge: 0,
            max_failure_percentage: 50,
        });
        let deployment = f.orchestrator.create_deployment(request(strategy)).await.unwrap();
        f.orchestrator.start_deployment(&deployment.id).await.unwrap();
        assert_eq!(f.client.batches(), vec![vec!["dev-00", "dev-01"]]);

        report(&f, &deployment.id, "dev-00", DeviceStatus::Installed).await;
        assert_eq!(f.client.batches().len(), 1);
        report(&f, &deployment.id, "dev-01", DeviceStatus::Installed).await;
        assert_eq!(f.client.batches()[1], vec!["dev-02", "dev-03"]);

        report(&f, &deployment.id, "dev-02", DeviceStatus::Installed).await;
        report(&f, &deployment.id, "dev-03", DeviceStatus::Installed).await;
        assert_eq!(f.client.batches()[2], vec!["dev-04"]);

        let outcome = report(&f, &deployment.id, "dev-04", DeviceStatus::Installed).await;
        assert_eq!(outcome.deployment_status, DeploymentStatus::Completed);
    }

    #[tokio::test]
    async fn test_duplicate_and_backward_reports_ignored() {
        let f = fixture(2);
        let deployment = f.orchestrator.create_deployment(request(Strategy::Immediate)).await.unwrap();
        f.orchestrator.start_deployment(&deployment.id).await.unwrap();

        assert!(report(&f, &deployment.id, "dev-00", DeviceStatus::Installing).await.applied);
        assert!(!report(&f, &deployment.id, "dev-00", DeviceStatus::Installing).await.applied);
        assert!(!report(&f, &deployment.id, "dev-00", DeviceStatus::Downloading).await.applied);
        assert!(report(&f, &deployment.id, "dev-00", DeviceStatus::Installed).await.applied);
        assert!(!report(&f, &deployment.id, "dev-00", DeviceStatus::Installed).await.applied);

        let row = f
            .store
            .get_device_deployment(&deployment.id, "dev-00")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, DeviceStatus::Installed);
        assert_eq!(f.metrics.snapshot().reports_ignored, 3);
    }

    #[tokio::test]
    async fn test_report_for_unknown_device() {
        let f = fixture(1);
        let deployment = f.orchestrator.create_deployment(request(Strategy::Immediate)).await.unwrap();
        f.orchestrator.start_deployment(&deployment.id).await.unwrap();

        let err = f
            .orchestrator
            .report_device_status(&deployment.id, "ghost", DeviceReport::new(DeviceStatus::Installed))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid_state() {
        let f = fixture(3);
        let deployment = f.orchestrator.create_deployment(request(Strategy::Immediate)).await.unwrap();
        f.orchestrator.start_deployment(&deployment.id).await.unwrap();

        let err = f.orchestrator.start_deployment(&deployment.id).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidState(_)));
        let rows = f.store.list_device_deployments(&deployment.id).await.unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn test_start_without_targets() {
        let f = fixture(0);
        let deployment = f.orchestrator.create_deployment(request(Strategy::Immediate)).await.unwrap();
        let err = f.orchestrator.start_deployment(&deployment.id).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidInput(_)));

        let deployment = f.orchestrator.get_deployment(&deployment.id).await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let f = fixture(4);
        let strategy = Strategy::Rolling(RollingConfig {
            batch_size: 2,
            max_unavailable: 0,
            max_surge: 0,
            max_failure_percentage: 50,
        });
        let deployment = f.orchestrator.create_deployment(request(strategy)).await.unwrap();
        f.orchestrator.start_deployment(&deployment.id).await.unwrap();

        let paused = f.orchestrator.pause_deployment(&deployment.id).await.unwrap();
        assert_eq!(paused.status, DeploymentStatus::Paused);
        assert_eq!(*f.client.paused.lock().unwrap(), vec!["campaign-1"]);

        // Reports still land, but no new batch goes out while paused
        report(&f, &deployment.id, "dev-00", DeviceStatus::Installed).await;
        report(&f, &deployment.id, "dev-01", DeviceStatus::Installed).await;
        assert_eq!(f.client.batches().len(), 1);

        let err = f.orchestrator.pause_deployment(&deployment.id).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidState(_)));

        let resumed = f.orchestrator.resume_deployment(&deployment.id).await.unwrap();
        assert_eq!(resumed.status, DeploymentStatus::Running);
        assert_eq!(f.client.batches()[1], vec!["dev-02", "dev-03"]);
    }

    #[tokio::test]
    async fn test_cancel_fails_unfinished_devices() {
        let f = fixture(3);
        let strategy = Strategy::Rolling(RollingConfig {
            batch_size: 1,
            max_unavailable: 0,
            max_surge: 0,
            max_failure_percentage: 50,
        });
        let deployment = f.orchestrator.create_deployment(request(strategy)).await.unwrap();
        f.orchestrator.start_deployment(&deployment.id).await.unwrap();
        report(&f, &deployment.id, "dev-00", DeviceStatus::Installed).await;

        let cancelled = f.orchestrator.cancel_deployment(&deployment.id).await.unwrap();
        assert_eq!(cancelled.status, DeploymentStatus::Cancelled);
        assert_eq!(f.client.cancelled.lock().unwrap().len(), 2);

        let rows = f.store.list_device_deployments(&deployment.id).await.unwrap();
        assert_eq!(rows[0].status, DeviceStatus::Installed);
        assert!(rows[1..].iter().all(|r| r.status == DeviceStatus::Failed && r.message == "cancelled"));

        let err = f.orchestrator.cancel_deployment(&deployment.id).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_manual_rollback_of_completed_deployment() {
        let f = fixture(2);
        let deployment = f.orchestrator.create_deployment(request(Strategy::Immediate)).await.unwrap();
        f.orchestrator.start_deployment(&deployment.id).await.unwrap();
        report(&f, &deployment.id, "dev-00", DeviceStatus::Installed).await;
        report(&f, &deployment.id, "dev-01", DeviceStatus::Installed).await;

        let rolled = f
            .orchestrator
            .rollback_deployment(&deployment.id, "bad release", false)
            .await
            .unwrap();
        assert_eq!(rolled.status, DeploymentStatus::RolledBack);
        assert_eq!(rolled.rolled_back_count, 0);
        assert_eq!(rolled.failure_reason.as_deref(), Some("bad release"));
        let rows = f.store.list_device_deployments(&deployment.id).await.unwrap();
        assert!(rows
            .iter()
            .all(|r| r.status == DeviceStatus::Installed && r.awaiting_rollback()));

        report(&f, &deployment.id, "dev-00", DeviceStatus::RolledBack).await;
        report(&f, &deployment.id, "dev-01", DeviceStatus::RolledBack).await;
        let status = f.orchestrator.get_deployment_status(&deployment.id).await.unwrap();
        assert_eq!(status.rolled_back_count, 2);
        assert_eq!(status.progress.rolled_back, 2);

        let err = f
            .orchestrator
            .rollback_deployment(&deployment.id, "again", false)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_threshold_abort_marks_in_flight_failed() {
        let f = fixture(4);
        let deployment = f
            .orchestrator
            .create_deployment(NewDeployment {
                abort_threshold: Some(25),
                ..request(Strategy::Immediate)
            })
            .await
            .unwrap();
        f.orchestrator.start_deployment(&deployment.id).await.unwrap();

        report(&f, &deployment.id, "dev-00", DeviceStatus::Failed).await;
        let outcome = report(&f, &deployment.id, "dev-01", DeviceStatus::Failed).await;
        assert_eq!(outcome.deployment_status, DeploymentStatus::RolledBack);

        let rows = f.store.list_device_deployments(&deployment.id).await.unwrap();
        assert_eq!(rows[0].status, DeviceStatus::Failed);
        assert!(rows[0].awaiting_rollback());
        assert_eq!(rows[2].status, DeviceStatus::Failed);
        assert_eq!(rows[2].rollback, None);
        assert!(rows[2].message.starts_with("rollout aborted"));
    }

    #[tokio::test]
    async fn test_batch_timeout_fails_silent_devices() {
        let f = fixture(1);
        let mut orchestrator = Orchestrator::new(
            f.store.clone(),
            f.client.clone(),
            Arc::new(InMemoryDeviceDirectory::with_devices([DeviceRecord::new("dev-00")
                .with_label("env", "prod")])),
            f.metrics.clone(),
            OrchestratorOptions::default(),
        );
        orchestrator.options.batch_timeout = Duration::ZERO;
        orchestrator.options.default_abort_threshold = 100;
        let orchestrator = Arc::new(orchestrator);

        let deployment = orchestrator.create_deployment(request(Strategy::Immediate)).await.unwrap();
        orchestrator.start_deployment(&deployment.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        orchestrator.reconcile(&deployment.id).await.unwrap();
        let row = f
            .store
            .get_device_deployment(&deployment.id, "dev-00")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, DeviceStatus::Failed);
        assert!(row.message.starts_with("no final report"));
    }

    #[tokio::test]
    async fn test_create_from_manifest() {
        let f = fixture(4);
        let manifest = br#"
apiVersion: fleet.v1
kind: Deployment
metadata:
  name: edge-agent
spec:
  selector:
    matchLabels:
      env: prod
  strategy:
    type: RollingUpdate
    rollingUpdate:
      maxUnavailable: 50%
      maxSurge: 0
  template:
    spec:
      artifacts:
        - name: agent
          version: 2.0.0
          url: https://artifacts.local/agent
          checksum: sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08
"#;
        let deployment = f
            .orchestrator
            .create_deployment_from_manifest(manifest, "ops")
            .await
            .unwrap();
        assert_eq!(deployment.name, "edge-agent");
        match deployment.strategy {
            Strategy::Rolling(cfg) => assert_eq!(cfg.batch_size, 2),
            other => panic!("unexpected strategy {:?}", other),
        }
    }
}

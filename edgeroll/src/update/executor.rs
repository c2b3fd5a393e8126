//! Device-side update executor
//!
//! Applies one update at a time: validate, back up, download with retries,
//! verify checksum and signature, run the pre-install hook, swap the new
//! artifact into the active set, run the post-install hook and health checks,
//! and roll back when the result is unhealthy. Every status transition is
//! pushed through the reporter and persisted to `update.state`.
//!
//! Cancellation is honoured up to the swap and hands the update back: the
//! device reports `pending` again so the work is picked up once its campaign
//! is active. From the swap on the apply runs to completion so the active set
//! is never left half-installed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::FleetError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::deployment::{validate_artifact_name, DeviceStatus};
use crate::models::update::{ReportTarget, StatusReport, Update, UpdateState};
use crate::telemetry::{NoopMetrics, RolloutMetrics};
use crate::update::fetcher::ArtifactFetcher;
use crate::update::health::HealthChecker;
use crate::update::reporter::DeviceUpdateReporter;
use crate::update::rollback::{Backup, RollbackManager};
use crate::update::scripts::run_script;
use crate::update::verify::{verify_checksum, SignatureVerifier};
use crate::utils::{calc_exp_backoff, normalize_checksum, CooldownOptions};

const STATE_FILE: &str = "update.state";
const VERSION_FILE: &str = ".version";
const UNKNOWN_VERSION: &str = "unknown";

/// Executor options
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Id reported with every status transition
    pub device_id: String,

    /// Holds `update.state`
    pub state_dir: PathBuf,

    /// Partial downloads
    pub staging_dir: PathBuf,

    /// Bound on one download attempt
    pub download_timeout: Duration,

    /// Extra download attempts after a transient failure
    pub retry_attempts: u32,
    pub retry_backoff: CooldownOptions,

    /// Bound on each pre/post install hook
    pub script_timeout: Duration,

    /// Bound on the whole health pass
    pub health_timeout: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            device_id: "local".to_string(),
            state_dir: PathBuf::from("/etc/edgeroll/update"),
            staging_dir: PathBuf::from("/etc/edgeroll/staging"),
            download_timeout: Duration::from_secs(300),
            retry_attempts: 3,
            retry_backoff: CooldownOptions::default(),
            script_timeout: Duration::from_secs(300),
            health_timeout: Duration::from_secs(60),
        }
    }
}

/// Why an apply stopped
enum ApplyError {
    /// Nothing in the active set changed
    BeforeSwap(FleetError),

    /// The new artifact is active and `backup` holds the previous set
    AfterSwap { error: FleetError, backup: Backup },
}

/// Applies and rolls back updates on this device
pub struct UpdateExecutor {
    options: ExecutorOptions,
    rollback: Arc<RollbackManager>,
    health: Arc<HealthChecker>,
    fetcher: Arc<dyn ArtifactFetcher>,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    reporter: Arc<dyn DeviceUpdateReporter>,
    metrics: Arc<dyn RolloutMetrics>,
    state: RwLock<Option<UpdateState>>,
    apply_lock: tokio::sync::Mutex<()>,
}

impl UpdateExecutor {
    pub fn new(
        options: ExecutorOptions,
        rollback: Arc<RollbackManager>,
        health: Arc<HealthChecker>,
        fetcher: Arc<dyn ArtifactFetcher>,
        reporter: Arc<dyn DeviceUpdateReporter>,
    ) -> Self {
        Self {
            options,
            rollback,
            health,
            fetcher,
            verifier: None,
            reporter,
            metrics: Arc::new(NoopMetrics),
            state: RwLock::new(None),
            apply_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn RolloutMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn device_id(&self) -> &str {
        &self.options.device_id
    }

    pub fn rollback_manager(&self) -> &Arc<RollbackManager> {
        &self.rollback
    }

    /// Load the state persisted by a previous run
    pub async fn load_state(&self) -> Result<Option<UpdateState>, FleetError> {
        let file = self.state_file();
        if !file.exists().await {
            return Ok(None);
        }
        let state: UpdateState = file.read_json().await?;
        info!(version = %state.current_version, status = %state.status, "Loaded update state");
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        Ok(Some(state))
    }

    pub fn last_state(&self) -> Option<UpdateState> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Version of the active artifact set, if any update settled yet
    pub fn current_version(&self) -> Option<String> {
        self.last_state()
            .map(|s| s.current_version)
            .filter(|v| !v.is_empty())
    }

    /// Apply `update`, reporting every transition against `target`
    pub async fn apply_update(
        &self,
        target: &ReportTarget,
        update: &Update,
        cancel: &CancellationToken,
    ) -> Result<UpdateState, FleetError> {
        let _apply = self.apply_lock.lock().await;
        let previous = self.current_version().unwrap_or_default();
        let last = self.last_state();
        let rollback_count = last.as_ref().map(|s| s.rollback_count).unwrap_or(0);
        let restore_point = last.and_then(|s| s.restore_point);
        info!(update = %update.id, version = %update.version, from = %previous, "Applying update");

        let now = Utc::now();
        self.set_state(UpdateState {
            update_id: update.id.clone(),
            version: update.version.clone(),
            status: DeviceStatus::Pending,
            progress: 0,
            error: None,
            rollback_count,
            started_at: now,
            updated_at: now,
            current_version: previous.clone(),
            restore_point,
        });

        let staged = self.staged_path(update);
        let outcome = self
            .run_apply(target, update, &previous, &staged, cancel)
            .await;
        if let Err(e) = File::new(&staged).delete().await {
            warn!("Failed to remove staged artifact {}: {}", staged.display(), e);
        }

        match outcome {
            Ok(backup) => {
                let state = self
                    .transition(target, DeviceStatus::Installed, 100, None, |s| {
                        s.current_version = update.version.clone();
                        s.restore_point = Some(backup.id);
                    })
                    .await;
                self.metrics.update_finished(DeviceStatus::Installed);
                info!(update = %update.id, version = %update.version, "Update installed");
                Ok(state)
            }
            Err(ApplyError::BeforeSwap(error)) if error.is_cancelled() => {
                info!(update = %update.id, "Update interrupted before install, handing it back");
                self.transition(target, DeviceStatus::Pending, 0, Some("interrupted".to_string()), |_| {})
                    .await;
                Err(error)
            }
            Err(ApplyError::BeforeSwap(error)) => {
                warn!(update = %update.id, "Update failed before install: {}", error);
                self.transition(target, DeviceStatus::Failed, 0, Some(error.to_string()), |_| {})
                    .await;
                self.metrics.update_finished(DeviceStatus::Failed);
                Err(error)
            }
            Err(ApplyError::AfterSwap { error, backup }) => {
                self.recover(target, update, &previous, error, backup).await
            }
        }
    }

    async fn run_apply(
        &self,
        target: &ReportTarget,
        update: &Update,
        previous: &str,
        staged: &Path,
        cancel: &CancellationToken,
    ) -> Result<Backup, ApplyError> {
        use ApplyError::BeforeSwap;

        // 1. structural checks, no I/O yet
        let checksum = normalize_checksum(&update.checksum).map_err(BeforeSwap)?;
        let artifact_name = update.artifact_name();
        validate_artifact_name(&artifact_name).map_err(BeforeSwap)?;
        ensure_active(cancel).map_err(BeforeSwap)?;

        // 2. never install without a way back
        let backup_version = if previous.is_empty() { UNKNOWN_VERSION } else { previous };
        let backup = self
            .rollback
            .create_backup(backup_version)
            .await
            .map_err(|e| BeforeSwap(FleetError::Internal(format!("backup failed: {}", e))))?;

        // 3. download
        self.transition(target, DeviceStatus::Downloading, 10, None, |_| {})
            .await;
        let bytes = self.download(update, staged, cancel).await.map_err(BeforeSwap)?;
        self.metrics.bytes_downloaded(bytes);
        self.transition(target, DeviceStatus::Downloaded, 40, None, |_| {})
            .await;

        // 4-5. integrity
        verify_checksum(staged, &checksum).await.map_err(BeforeSwap)?;
        if let Some(signature) = update.signature.as_deref() {
            let verifier = self.verifier.as_ref().ok_or_else(|| {
                BeforeSwap(FleetError::Integrity(
                    "update is signed but no signature key is configured".to_string(),
                ))
            })?;
            verifier.verify(update, signature).map_err(BeforeSwap)?;
        }
        ensure_active(cancel).map_err(BeforeSwap)?;

        // 6. pre-install hook
        self.transition(target, DeviceStatus::Installing, 60, None, |_| {})
            .await;
        let workdir = self.rollback.active_dir().path().to_path_buf();
        if let Some(script) = update.pre_script.as_deref() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(BeforeSwap(FleetError::cancelled())),
                result = run_script("pre-install", script, &workdir, self.options.script_timeout) => {
                    result.map_err(BeforeSwap)?;
                }
            }
        }
        ensure_active(cancel).map_err(BeforeSwap)?;

        // 7. swap; cancellation is ignored from here on
        self.swap(update, &artifact_name, staged)
            .await
            .map_err(BeforeSwap)?;
        debug!(update = %update.id, "Artifact swapped in");

        let after_swap = |error: FleetError| ApplyError::AfterSwap {
            error,
            backup: backup.clone(),
        };
        if let Some(script) = update.post_script.as_deref() {
            run_script("post-install", script, &workdir, self.options.script_timeout)
                .await
                .map_err(after_swap)?;
        }

        // 8. health
        match tokio::time::timeout(self.options.health_timeout, self.health.check_health()).await {
            Ok(Ok(_)) => Ok(backup.clone()),
            Ok(Err(e)) => Err(after_swap(e)),
            Err(_) => Err(after_swap(FleetError::HealthCheckFailure(format!(
                "health checks timed out after {:?}",
                self.options.health_timeout
            )))),
        }
    }

    /// Roll back after an unhealthy install, or record the failure
    async fn recover(
        &self,
        target: &ReportTarget,
        update: &Update,
        previous: &str,
        error: FleetError,
        backup: Backup,
    ) -> Result<UpdateState, FleetError> {
        error!(update = %update.id, "Installed update is unhealthy: {}", error);

        if !update.rollback_enabled {
            self.transition(target, DeviceStatus::Failed, 100, Some(error.to_string()), |s| {
                s.current_version = update.version.clone();
                s.restore_point = Some(backup.id.clone());
            })
            .await;
            self.metrics.update_finished(DeviceStatus::Failed);
            return Err(error);
        }

        match self.rollback.rollback_to(&backup.id).await {
            Ok(restored) => {
                let message = format!("{}; rolled back to {}", error, restored.version);
                self.transition(target, DeviceStatus::RolledBack, 100, Some(message), |s| {
                    s.current_version = previous.to_string();
                    s.rollback_count += 1;
                })
                .await;
                self.metrics.rollback_performed();
                self.metrics.update_finished(DeviceStatus::RolledBack);
            }
            Err(rollback_error) => {
                error!(update = %update.id, "Rollback failed: {}", rollback_error);
                let message = format!("{}; rollback failed: {}", error, rollback_error);
                self.transition(target, DeviceStatus::Failed, 100, Some(message), |s| {
                    s.current_version = update.version.clone();
                })
                .await;
                self.metrics.update_finished(DeviceStatus::Failed);
            }
        }
        Err(error)
    }

    /// Undo the install of `version` on request of the control plane.
    ///
    /// Only the backup taken by the apply that installed `version` is
    /// restored. When `version` is not active nothing was swapped in and the
    /// rollback succeeds without touching the active set. An empty `version`
    /// reverts whatever is active.
    pub async fn rollback(
        &self,
        target: &ReportTarget,
        reason: &str,
        version: &str,
    ) -> Result<UpdateState, FleetError> {
        let _apply = self.apply_lock.lock().await;
        info!(campaign = %target.campaign_id, version = %version, "Rolling back: {}", reason);

        let now = Utc::now();
        let last = self.last_state();
        let current = self.current_version().unwrap_or_default();
        let restore_point = last.as_ref().and_then(|s| s.restore_point.clone());
        self.set_state(UpdateState {
            update_id: target.campaign_id.clone(),
            version: version.to_string(),
            status: DeviceStatus::Pending,
            progress: 0,
            error: None,
            rollback_count: last.as_ref().map(|s| s.rollback_count).unwrap_or(0),
            started_at: now,
            updated_at: now,
            current_version: current.clone(),
            restore_point: restore_point.clone(),
        });

        if !version.is_empty() && current != version {
            info!(version = %version, active = %current, "Version not active, nothing to roll back");
            let message = format!("{}; {} is not installed", reason, version);
            let state = self
                .transition(target, DeviceStatus::RolledBack, 100, Some(message), |_| {})
                .await;
            return Ok(state);
        }

        let restored = match restore_point {
            Some(id) => self.rollback.rollback_to(&id).await,
            None => Err(FleetError::NotFound(format!(
                "no backup taken before {} was installed",
                if current.is_empty() { UNKNOWN_VERSION } else { current.as_str() }
            ))),
        };
        match restored {
            Ok(backup) => {
                let state = self
                    .transition(target, DeviceStatus::RolledBack, 100, Some(reason.to_string()), |s| {
                        s.current_version = match backup.version.as_str() {
                            UNKNOWN_VERSION => String::new(),
                            restored => restored.to_string(),
                        };
                        s.restore_point = None;
                        s.rollback_count += 1;
                    })
                    .await;
                self.metrics.rollback_performed();
                Ok(state)
            }
            Err(e) => {
                error!(version = %current, "Rollback failed: {}", e);
                self.transition(target, DeviceStatus::Failed, 0, Some(e.to_string()), |_| {})
                    .await;
                Err(e)
            }
        }
    }

    async fn download(
        &self,
        update: &Update,
        staged: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, FleetError> {
        let mut attempt = 0;
        loop {
            let fetch = self
                .fetcher
                .fetch(&update.url, staged, self.options.download_timeout);
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(FleetError::cancelled()),
                result = fetch => result,
            };

            match result {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_retryable() && attempt < self.options.retry_attempts => {
                    let delay = calc_exp_backoff(&self.options.retry_backoff, attempt);
                    attempt += 1;
                    warn!(update = %update.id, attempt, "Download failed, retrying in {:?}: {}", delay, e);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FleetError::cancelled()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn swap(&self, update: &Update, artifact_name: &str, staged: &Path) -> Result<(), FleetError> {
        let active = self.rollback.active_dir();
        let next = Dir::new(active.path().with_extension("next"));
        next.delete().await?;
        active.copy_to(&next).await?;

        File::new(staged)
            .replace(&next.path().join(artifact_name))
            .await?;
        next.file(VERSION_FILE).write_string(&update.version).await?;
        next.swap_into(active).await
    }

    /// Move to `status`, persist and report it
    async fn transition<F>(
        &self,
        target: &ReportTarget,
        status: DeviceStatus,
        progress: u8,
        error: Option<String>,
        amend: F,
    ) -> UpdateState
    where
        F: FnOnce(&mut UpdateState),
    {
        let state = {
            let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
            let now = Utc::now();
            let state = guard.get_or_insert_with(|| UpdateState {
                update_id: target.campaign_id.clone(),
                version: String::new(),
                status,
                progress,
                error: None,
                rollback_count: 0,
                started_at: now,
                updated_at: now,
                current_version: String::new(),
                restore_point: None,
            });
            state.status = status;
            state.progress = progress;
            state.error = error.clone();
            state.updated_at = now;
            amend(state);
            state.clone()
        };

        if let Err(e) = self.state_file().write_json(&state).await {
            warn!("Failed to persist update state: {}", e);
        }

        let report = StatusReport {
            device_id: self.options.device_id.clone(),
            campaign_id: target.campaign_id.clone(),
            deployment_id: target.deployment_id.clone(),
            status,
            progress,
            error_message: error,
            reported_at: state.updated_at,
        };
        if let Err(e) = self.reporter.report(report).await {
            warn!(status = %status, "Failed to report update status: {}", e);
        }
        state
    }

    fn set_state(&self, state: UpdateState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = Some(state);
    }

    fn state_file(&self) -> File {
        File::new(self.options.state_dir.join(STATE_FILE))
    }

    fn staged_path(&self, update: &Update) -> PathBuf {
        let name: String = update
            .id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.options.staging_dir.join(format!("{}.part", name))
    }
}

fn ensure_active(cancel: &CancellationToken) -> Result<(), FleetError> {
    if cancel.is_cancelled() {
        return Err(FleetError::cancelled());
    }
    Ok(())
}

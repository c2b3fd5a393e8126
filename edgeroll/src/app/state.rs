//! Application state management

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use crate::app::options::AppOptions;
use crate::campaign::adapter::CampaignUpdateClient;
use crate::campaign::service::CampaignService;
use crate::errors::FleetError;
use crate::http::client::HttpClient;
use crate::http::reports::HttpReporter;
use crate::http::updates::HttpUpdateSource;
use crate::models::update::StatusReport;
use crate::rollout::directory::InMemoryDeviceDirectory;
use crate::rollout::orchestrator::Orchestrator;
use crate::storage::memory::MemoryStore;
use crate::storage::settings::Role;
use crate::telemetry::AtomicRolloutMetrics;
use crate::update::executor::UpdateExecutor;
use crate::update::fetcher::HttpArtifactFetcher;
use crate::update::health::HealthChecker;
use crate::update::reporter::{ChannelReporter, DeviceUpdateReporter};
use crate::update::rollback::RollbackManager;
use crate::update::source::UpdateSource;
use crate::update::verify::JwtSignatureVerifier;
use crate::workers::reports::ReportSink;

const CONTROL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const REPORT_CHANNEL_CAPACITY: usize = 256;

/// Orchestrator side of the node
pub struct ControlState {
    pub directory: Arc<InMemoryDeviceDirectory>,
    pub campaigns: Arc<CampaignService>,
    pub orchestrator: Arc<Orchestrator>,
}

/// Device side of the node
pub struct DeviceState {
    pub executor: Arc<UpdateExecutor>,
    pub health: Arc<HealthChecker>,
    pub source: Arc<dyn UpdateSource>,
}

/// Main application state
pub struct AppState {
    pub control: Option<ControlState>,
    pub device: Option<DeviceState>,

    /// In-process report delivery (standalone role)
    pub report_sink: Option<Arc<ReportSink>>,

    pub metrics: Arc<AtomicRolloutMetrics>,
}

impl AppState {
    /// Initialize application state.
    ///
    /// Returns the receiving end of the in-process report channel when the
    /// device reports to a local campaign service.
    pub async fn init(
        options: &AppOptions,
    ) -> Result<(Self, Option<mpsc::Receiver<StatusReport>>), FleetError> {
        info!("Initializing application state for role {:?}...", options.role);

        let metrics = Arc::new(AtomicRolloutMetrics::new());

        let control = if options.runs_control() {
            Some(init_control(options, metrics.clone()))
        } else {
            None
        };

        let mut report_rx = None;
        let mut report_sink = None;
        let device = match (options.role, control.as_ref()) {
            (Role::Standalone, Some(control)) => {
                let (reporter, rx) = ChannelReporter::new(REPORT_CHANNEL_CAPACITY);
                report_rx = Some(rx);
                report_sink = Some(Arc::new(
                    ReportSink::new(control.campaigns.clone())
                        .with_orchestrator(control.orchestrator.clone()),
                ));
                let source: Arc<dyn UpdateSource> = control.campaigns.clone();
                Some(init_device(options, source, Arc::new(reporter), metrics.clone()).await?)
            }
            (Role::Device, _) => {
                let client = HttpClient::new(&options.control_url, CONTROL_REQUEST_TIMEOUT)?
                    .with_device_id(options.device.id.clone());
                let reporter = HttpReporter::new(client.clone()).with_retries(
                    options.executor.retry_attempts,
                    options.executor.retry_backoff.clone(),
                );
                let source = Arc::new(HttpUpdateSource::new(client));
                Some(init_device(options, source, Arc::new(reporter), metrics.clone()).await?)
            }
            _ => None,
        };

        Ok((
            Self {
                control,
                device,
                report_sink,
                metrics,
            },
            report_rx,
        ))
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), FleetError> {
        info!("Shutting down application state...");
        if let Some(control) = &self.control {
            control.orchestrator.shutdown();
        }
        Ok(())
    }
}

fn init_control(options: &AppOptions, metrics: Arc<AtomicRolloutMetrics>) -> ControlState {
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(InMemoryDeviceDirectory::with_devices(options.inventory.clone()));
    if options.role == Role::Standalone {
        directory.register(options.device.clone());
    }
    info!("Device directory holds {} devices", directory.len());

    let campaigns = Arc::new(CampaignService::new(store.clone(), directory.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        Arc::new(CampaignUpdateClient::new(campaigns.clone())),
        directory.clone(),
        metrics,
        options.orchestrator.clone(),
    ));

    ControlState {
        directory,
        campaigns,
        orchestrator,
    }
}

async fn init_device(
    options: &AppOptions,
    source: Arc<dyn UpdateSource>,
    reporter: Arc<dyn DeviceUpdateReporter>,
    metrics: Arc<AtomicRolloutMetrics>,
) -> Result<DeviceState, FleetError> {
    let health = Arc::new(match &options.health_checks {
        Some(checks) => HealthChecker::with_default_checks(checks.clone()),
        None => HealthChecker::new(),
    });

    // no client-wide timeout; each download is bounded by the executor
    let fetcher = HttpArtifactFetcher::new(reqwest::Client::builder().build()?);

    let mut executor = UpdateExecutor::new(
        options.executor.clone(),
        Arc::new(RollbackManager::new(options.rollback.clone())),
        health.clone(),
        Arc::new(fetcher),
        reporter,
    )
    .with_metrics(metrics);
    if let Some(secret) = &options.signature_secret {
        executor = executor.with_verifier(Arc::new(JwtSignatureVerifier::new(secret)));
    }

    let executor = Arc::new(executor);
    if let Some(state) = executor.load_state().await? {
        info!(
            "Restored update state: {} {:?} (active {})",
            state.version, state.status, state.current_version
        );
    }

    Ok(DeviceState {
        executor,
        health,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::layout::StorageLayout;
    use crate::storage::settings::Settings;

    fn options(role: Role, tmp: &tempfile::TempDir) -> AppOptions {
        let mut settings = Settings::default();
        settings.role = role;
        settings.device.device_id = "pi-1".to_string();
        settings.device.default_health_checks = false;
        AppOptions::from_settings(&settings, StorageLayout::new(tmp.path()))
    }

    #[tokio::test]
    async fn test_standalone_wires_both_sides() {
        let tmp = tempfile::tempdir().unwrap();
        let (state, reports) = AppState::init(&options(Role::Standalone, &tmp)).await.unwrap();

        let control = state.control.as_ref().unwrap();
        assert_eq!(control.directory.len(), 1);
        assert!(state.device.is_some());
        assert!(state.report_sink.is_some());
        assert!(reports.is_some());
    }

    #[tokio::test]
    async fn test_device_role_has_no_orchestrator() {
        let tmp = tempfile::tempdir().unwrap();
        let (state, reports) = AppState::init(&options(Role::Device, &tmp)).await.unwrap();

        assert!(state.control.is_none());
        assert_eq!(state.device.as_ref().unwrap().executor.device_id(), "pi-1");
        assert!(reports.is_none());
    }

    #[tokio::test]
    async fn test_control_role_has_no_executor() {
        let tmp = tempfile::tempdir().unwrap();
        let (state, _) = AppState::init(&options(Role::Control, &tmp)).await.unwrap();

        assert!(state.control.is_some());
        assert!(state.device.is_none());
    }
}

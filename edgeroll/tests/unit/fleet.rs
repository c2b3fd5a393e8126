//! In-process fleet used by the integration tests: one orchestrator, one
//! campaign service and a set of device executors wired through the workers.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use edgeroll::campaign::adapter::CampaignUpdateClient;
use edgeroll::campaign::service::CampaignService;
use edgeroll::errors::FleetError;
use edgeroll::filesys::file::File;
use edgeroll::models::deployment::{
    ArtifactRef, ArtifactType, DeploymentStatusReport, NewDeployment, Selector,
};
use edgeroll::models::device::DeviceRecord;
use edgeroll::models::strategy::Strategy;
use edgeroll::rollout::directory::InMemoryDeviceDirectory;
use edgeroll::rollout::orchestrator::{Orchestrator, OrchestratorOptions};
use edgeroll::storage::memory::MemoryStore;
use edgeroll::telemetry::AtomicRolloutMetrics;
use edgeroll::update::executor::{ExecutorOptions, UpdateExecutor};
use edgeroll::update::fetcher::ArtifactFetcher;
use edgeroll::update::health::{HealthCheck, HealthChecker};
use edgeroll::update::reporter::ChannelReporter;
use edgeroll::update::rollback::{RollbackManager, RollbackOptions};
use edgeroll::utils::sha256_hash;
use edgeroll::workers::reports::ReportSink;
use edgeroll::workers::{reports, rollout, updater};

pub const BODY: &[u8] = b"agent 2.0.0";

/// Serves [`BODY`] for every url
pub struct MemoryFetcher;

#[async_trait]
impl ArtifactFetcher for MemoryFetcher {
    async fn fetch(&self, _url: &str, dest: &Path, _timeout: Duration) -> Result<u64, FleetError> {
        File::new(dest).write_bytes(BODY).await?;
        Ok(BODY.len() as u64)
    }
}

/// Serves [`BODY`] after holding every download for a while
pub struct SlowFetcher(pub Duration);

#[async_trait]
impl ArtifactFetcher for SlowFetcher {
    async fn fetch(&self, url: &str, dest: &Path, timeout: Duration) -> Result<u64, FleetError> {
        tokio::time::sleep(self.0).await;
        MemoryFetcher.fetch(url, dest, timeout).await
    }
}

pub struct Fleet {
    pub orchestrator: Arc<Orchestrator>,
    pub campaigns: Arc<CampaignService>,
    pub executors: Vec<Arc<UpdateExecutor>>,
    pub metrics: Arc<AtomicRolloutMetrics>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    _tmp: TempDir,
}

impl Fleet {
    /// Start a fleet; each entry is a device id and whether it passes health checks
    pub fn start(devices: &[(&str, bool)]) -> Self {
        Self::start_with(devices, Arc::new(MemoryFetcher))
    }

    /// Start a fleet whose devices download through `fetcher`
    pub fn start_with(devices: &[(&str, bool)], fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut handles = Vec::new();

        let directory = Arc::new(InMemoryDeviceDirectory::with_devices(
            devices
                .iter()
                .map(|(id, _)| DeviceRecord::new(*id).with_label("env", "prod")),
        ));
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(AtomicRolloutMetrics::new());
        let campaigns = Arc::new(CampaignService::new(store.clone(), directory.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            store,
            Arc::new(CampaignUpdateClient::new(campaigns.clone())),
            directory,
            metrics.clone(),
            OrchestratorOptions {
                reconcile_interval: Duration::from_millis(50),
                ..Default::default()
            },
        ));

        let (reporter, report_rx) = ChannelReporter::new(256);
        let reporter = Arc::new(reporter);
        let sink = Arc::new(ReportSink::new(campaigns.clone()).with_orchestrator(orchestrator.clone()));
        handles.push(tokio::spawn(reports::run(report_rx, sink, signal(&shutdown_tx))));

        {
            let orchestrator = orchestrator.clone();
            let shutdown = signal(&shutdown_tx);
            handles.push(tokio::spawn(async move {
                let options = rollout::Options {
                    interval: Duration::from_millis(50),
                };
                rollout::run(&options, orchestrator, tokio::time::sleep, shutdown).await;
            }));
        }

        let mut executors = Vec::new();
        for (id, healthy) in devices {
            let root = tmp.path().join(id);
            let health = HealthChecker::new();
            if !healthy {
                health.register(HealthCheck::new(
                    "service_running",
                    true,
                    Duration::from_secs(1),
                    || async { anyhow::bail!("service exited with status 1") },
                ));
            }
            let executor = Arc::new(
                UpdateExecutor::new(
                    ExecutorOptions {
                        device_id: id.to_string(),
                        state_dir: root.join("update"),
                        staging_dir: root.join("staging"),
                        ..Default::default()
                    },
                    Arc::new(RollbackManager::new(RollbackOptions {
                        active_dir: root.join("active"),
                        backup_dir: root.join("backups"),
                        max_backups: 3,
                    })),
                    Arc::new(health),
                    fetcher.clone(),
                    reporter.clone(),
                )
                .with_metrics(metrics.clone()),
            );
            executors.push(executor.clone());

            let source = campaigns.clone();
            let shutdown = signal(&shutdown_tx);
            let device_id = id.to_string();
            handles.push(tokio::spawn(async move {
                let options = updater::Options {
                    device_id,
                    interval: Duration::from_millis(20),
                    watch_interval: Duration::from_millis(20),
                };
                updater::run(&options, source, executor, tokio::time::sleep, shutdown).await;
            }));
        }

        Self {
            orchestrator,
            campaigns,
            executors,
            metrics,
            shutdown_tx,
            handles,
            _tmp: tmp,
        }
    }

    /// Working directory of one device: `active/`, `backups/`, `update/`
    pub fn device_root(&self, device_id: &str) -> PathBuf {
        self._tmp.path().join(device_id)
    }

    /// Poll the deployment until `done` holds, failing after ten seconds
    pub async fn wait_for<P>(&self, id: &str, done: P) -> DeploymentStatusReport
    where
        P: Fn(&DeploymentStatusReport) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let status = self.orchestrator.get_deployment_status(id).await.unwrap();
            if done(&status) {
                return status;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "deployment {} stuck at {:?}",
                id,
                status
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        for handle in self.handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}

fn signal(tx: &broadcast::Sender<()>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let mut rx = tx.subscribe();
    Box::pin(async move {
        let _ = rx.recv().await;
    })
}

pub fn checksum() -> String {
    format!("sha256:{}", sha256_hash(BODY))
}

pub fn request(strategy: Strategy) -> NewDeployment {
    NewDeployment {
        name: "agent-rollout".to_string(),
        namespace: None,
        description: String::new(),
        artifact: ArtifactRef {
            name: "agent".to_string(),
            artifact_type: ArtifactType::Binary,
            version: "2.0.0".to_string(),
            locator: "https://artifacts.local/agent-2.0.0".to_string(),
            checksum: checksum(),
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

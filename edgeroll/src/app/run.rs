//! Main application run loop

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::AppOptions;
use crate::app::state::AppState;
use crate::errors::FleetError;
use crate::models::update::StatusReport;
use crate::rollout::orchestrator::Orchestrator;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::update::executor::UpdateExecutor;
use crate::update::source::UpdateSource;
use crate::workers::reports::ReportSink;
use crate::workers::{reports, rollout, updater};

/// Run a node until `shutdown_signal` resolves.
///
/// `on_ready` runs once everything is started; it receives the state so the
/// caller can submit work such as an initial deployment.
pub async fn run<R, RF>(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
    on_ready: R,
) -> Result<(), FleetError>
where
    R: FnOnce(Arc<AppState>) -> RF,
    RF: Future<Output = Result<(), FleetError>>,
{
    info!("Initializing edgeroll...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.max_shutdown_delay);

    let app_state = match init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to start edgeroll: {}", e);
            shutdown_manager.shutdown().await?;
            return Err(e);
        }
    };

    if let Err(e) = on_ready(app_state).await {
        error!("Startup task failed: {}", e);
        drop(shutdown_tx);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    // Shutdown
    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<Arc<AppState>, FleetError> {
    if options.runs_device() {
        options.layout.setup().await?;
    }

    let (app_state, report_rx) = AppState::init(options).await?;
    let app_state = Arc::new(app_state);
    shutdown_manager.with_app_state(app_state.clone())?;

    if let (Some(rx), Some(sink)) = (report_rx, app_state.report_sink.clone()) {
        init_reports_worker(rx, sink, shutdown_manager, shutdown_tx.subscribe())?;
    }

    if let Some(control) = &app_state.control {
        init_rollout_worker(
            options.rollout_worker.clone(),
            control.orchestrator.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )?;
    }

    if let Some(device) = &app_state.device {
        init_updater_worker(
            options.updater_worker.clone(),
            device.source.clone(),
            device.executor.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )?;

        if options.enable_server {
            let server_state = ServerState::new(device.executor.clone(), device.health.clone());
            init_server(options, server_state, shutdown_manager, shutdown_tx.subscribe()).await?;
        }
    }

    Ok(app_state)
}

fn init_reports_worker(
    rx: mpsc::Receiver<StatusReport>,
    sink: Arc<ReportSink>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), FleetError> {
    info!("Initializing reports worker...");

    let handle = tokio::spawn(async move {
        reports::run(
            rx,
            sink,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_reports_worker_handle(handle)
}

fn init_rollout_worker(
    options: rollout::Options,
    orchestrator: Arc<Orchestrator>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), FleetError> {
    info!("Initializing rollout worker...");

    let handle = tokio::spawn(async move {
        rollout::run(
            &options,
            orchestrator,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_rollout_worker_handle(handle)
}

fn init_updater_worker(
    options: updater::Options,
    source: Arc<dyn UpdateSource>,
    executor: Arc<UpdateExecutor>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), FleetError> {
    info!("Initializing updater worker...");

    let handle = tokio::spawn(async move {
        updater::run(
            &options,
            source,
            executor,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_updater_worker_handle(handle)
}

async fn init_server(
    options: &AppOptions,
    server_state: ServerState,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), FleetError> {
    info!("Initializing local HTTP server...");

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    max_shutdown_delay: Duration,
    app_state: Option<Arc<AppState>>,
    server_handle: Option<JoinHandle<Result<(), FleetError>>>,
    updater_worker_handle: Option<JoinHandle<()>>,
    rollout_worker_handle: Option<JoinHandle<()>>,
    reports_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, max_shutdown_delay: Duration) -> Self {
        Self {
            shutdown_tx,
            max_shutdown_delay,
            app_state: None,
            server_handle: None,
            updater_worker_handle: None,
            rollout_worker_handle: None,
            reports_worker_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), FleetError> {
        if self.app_state.is_some() {
            return Err(FleetError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_updater_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), FleetError> {
        if self.updater_worker_handle.is_some() {
            return Err(FleetError::ShutdownError("updater_handle already set".to_string()));
        }
        self.updater_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_rollout_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), FleetError> {
        if self.rollout_worker_handle.is_some() {
            return Err(FleetError::ShutdownError("rollout_handle already set".to_string()));
        }
        self.rollout_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_reports_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), FleetError> {
        if self.reports_worker_handle.is_some() {
            return Err(FleetError::ShutdownError("reports_handle already set".to_string()));
        }
        self.reports_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), FleetError>>,
    ) -> Result<(), FleetError> {
        if self.server_handle.is_some() {
            return Err(FleetError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), FleetError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(self.max_shutdown_delay, self.shutdown_impl()).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), FleetError> {
        info!("Shutting down edgeroll...");

        // 1. Updater worker; an apply past the swap finishes first
        if let Some(handle) = self.updater_worker_handle.take() {
            handle.await.map_err(|e| FleetError::ShutdownError(e.to_string()))?;
        }

        // 2. Rollout worker, stops the deployment drivers
        if let Some(handle) = self.rollout_worker_handle.take() {
            handle.await.map_err(|e| FleetError::ShutdownError(e.to_string()))?;
        }

        // 3. Reports worker, drains what the device already sent
        if let Some(handle) = self.reports_worker_handle.take() {
            handle.await.map_err(|e| FleetError::ShutdownError(e.to_string()))?;
        }

        // 4. Status server
        if let Some(handle) = self.server_handle.take() {
            handle.await.map_err(|e| FleetError::ShutdownError(e.to_string()))??;
        }

        // 5. App state
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}

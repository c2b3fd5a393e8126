//! Periodic reconciliation of running deployments

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::rollout::orchestrator::Orchestrator;

/// Rollout worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Reconcile interval
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Run the rollout worker.
///
/// Each pass reconciles every RUNNING deployment and restarts missing
/// drivers, which also resumes rollouts after a restart.
pub async fn run<S, F>(
    options: &Options,
    orchestrator: Arc<Orchestrator>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Rollout worker starting...");

    loop {
        match orchestrator.reconcile_all().await {
            Ok(0) => {}
            Ok(running) => debug!("Reconciled {} running deployments", running),
            Err(e) => error!("Reconcile pass failed: {}", e),
        }

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Rollout worker shutting down...");
                orchestrator.shutdown();
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }
    }
}

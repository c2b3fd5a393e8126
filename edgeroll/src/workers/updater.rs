//! Device updater worker

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::models::update::{AssignedWork, Assignment};
use crate::update::executor::UpdateExecutor;
use crate::update::source::UpdateSource;

/// Updater worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Id the device polls work for
    pub device_id: String,

    /// Polling interval
    pub interval: Duration,

    /// How often a running apply checks that its campaign is still active
    pub watch_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            device_id: "local".to_string(),
            interval: Duration::from_secs(30),
            watch_interval: Duration::from_secs(5),
        }
    }
}

/// How an assignment ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,

    /// Interrupted before the swap and reported back as pending
    HandedBack,
    Shutdown,
}

/// Run the updater worker: poll for an assignment, execute it, repeat.
///
/// Assignments run one at a time. A pause or cancel of the campaign, or a
/// shutdown, interrupts the running apply; past the swap the apply finishes
/// first. An interrupted apply is handed back and runs again once its
/// campaign is served again.
pub async fn run<S, F>(
    options: &Options,
    source: Arc<dyn UpdateSource>,
    executor: Arc<UpdateExecutor>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Updater worker starting...");

    if let Err(e) = executor.load_state().await {
        warn!("Ignoring unreadable update state: {}", e);
    }

    // a finished campaign is not executed again while its reports are in transit
    let mut last_campaign: Option<String> = None;

    loop {
        let assignment = match source.next_assignment(&options.device_id).await {
            Ok(assignment) => assignment,
            Err(e) => {
                error!("Failed to poll for assignments: {}", e);
                None
            }
        };
        let assignment = assignment.filter(|a| {
            let repeat = last_campaign.as_deref() == Some(a.target.campaign_id.as_str());
            if repeat {
                debug!(campaign = %a.target.campaign_id, "Assignment already handled");
            }
            !repeat
        });

        if let Some(assignment) = assignment {
            let campaign_id = assignment.target.campaign_id.clone();
            match execute(options, source.as_ref(), &executor, assignment, &mut shutdown_signal).await {
                Outcome::Shutdown => {
                    info!("Updater worker shutting down...");
                    return;
                }
                Outcome::HandedBack => last_campaign = None,
                Outcome::Done => last_campaign = Some(campaign_id),
            }
            // look for more work right away
            continue;
        }

        debug!("No pending assignment");
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Updater worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }
    }
}

/// Execute one assignment
async fn execute(
    options: &Options,
    source: &dyn UpdateSource,
    executor: &UpdateExecutor,
    assignment: Assignment,
    shutdown_signal: &mut Pin<Box<dyn Future<Output = ()> + Send>>,
) -> Outcome {
    let target = assignment.target;
    match assignment.work {
        AssignedWork::Apply { update } => {
            info!(campaign = %target.campaign_id, version = %update.version, "Received update assignment");
            let cancel = CancellationToken::new();
            let done = CancellationToken::new();

            let apply = async {
                let result = executor.apply_update(&target, &update, &cancel).await;
                done.cancel();
                result
            };
            let watch = watch_assignment(
                source,
                &target.campaign_id,
                options.watch_interval,
                &cancel,
                &done,
                shutdown_signal,
            );
            let (result, shutdown) = tokio::join!(apply, watch);

            let outcome = match result {
                Ok(state) => {
                    info!(version = %state.current_version, "Update applied");
                    Outcome::Done
                }
                Err(e) if e.is_cancelled() => {
                    info!(campaign = %target.campaign_id, "Update handed back");
                    Outcome::HandedBack
                }
                Err(e) => {
                    warn!(campaign = %target.campaign_id, "Update not applied: {}", e);
                    Outcome::Done
                }
            };
            if shutdown {
                Outcome::Shutdown
            } else {
                outcome
            }
        }
        AssignedWork::Rollback { reason, version } => {
            info!(campaign = %target.campaign_id, version = %version, "Received rollback assignment");
            if let Err(e) = executor.rollback(&target, &reason, &version).await {
                warn!(campaign = %target.campaign_id, "Rollback not performed: {}", e);
            }
            Outcome::Done
        }
    }
}

/// Cancel `cancel` when the campaign stops being active or on shutdown;
/// returns once `done` fires. Returns true when shutdown was observed.
async fn watch_assignment(
    source: &dyn UpdateSource,
    campaign_id: &str,
    interval: Duration,
    cancel: &CancellationToken,
    done: &CancellationToken,
    shutdown_signal: &mut Pin<Box<dyn Future<Output = ()> + Send>>,
) -> bool {
    let mut shutdown = false;
    loop {
        tokio::select! {
            _ = done.cancelled() => return shutdown,
            _ = &mut *shutdown_signal, if !shutdown => {
                info!(campaign = %campaign_id, "Shutdown requested, cancelling update");
                shutdown = true;
                cancel.cancel();
            }
            _ = tokio::time::sleep(interval), if !cancel.is_cancelled() => {
                match source.assignment_active(campaign_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(campaign = %campaign_id, "Campaign no longer active, cancelling update");
                        cancel.cancel();
                    }
                    Err(e) => warn!(campaign = %campaign_id, "Failed to check campaign: {}", e),
                }
            }
        }
    }
}

//! Rollout strategy engine
//!
//! A pure decision function: given a strategy and a snapshot of the device
//! rows of one deployment, compute the next batch to dispatch and what the
//! orchestrator should do next. No I/O happens here.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::deployment::{DeviceDeployment, DeviceStatus};
use crate::models::strategy::{CanaryConfig, RollingConfig, Strategy};

/// Input of one evaluation
#[derive(Debug, Clone, Copy)]
pub struct RolloutSnapshot<'a> {
    /// Every device row of the deployment
    pub devices: &'a [DeviceDeployment],

    pub now: DateTime<Utc>,

    /// Failed-device percentage above which the rollout aborts
    pub abort_threshold: u32,

    /// Operator approved the canary; skip the rest of the validation wait
    pub validation_waived: bool,
}

/// What the orchestrator should do after dispatching `next_batch`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Keep going; dispatch the batch if there is one
    Continue,

    /// Canary batch settled, observe for `remaining` before deciding
    PauseForValidation { remaining: Duration },

    /// Canary succeeded; the batch is the remaining fleet
    Promote,

    /// Failure tolerance exceeded, roll back
    Abort { reason: String },

    /// Nothing left to dispatch and every device settled
    Complete,
}

/// Result of one evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    /// Device ids to dispatch now, in stable id order
    pub next_batch: Vec<String>,
    pub decision: Decision,
}

impl Evaluation {
    fn decide(decision: Decision) -> Self {
        Self {
            next_batch: Vec::new(),
            decision,
        }
    }

    fn dispatch(next_batch: Vec<String>, decision: Decision) -> Self {
        Self {
            next_batch,
            decision,
        }
    }
}

/// Evaluate a strategy against the current snapshot
pub fn evaluate(strategy: &Strategy, snapshot: &RolloutSnapshot<'_>) -> Evaluation {
    let mut devices: Vec<&DeviceDeployment> = snapshot.devices.iter().collect();
    devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));

    match strategy {
        Strategy::Immediate => evaluate_immediate(&devices, snapshot.abort_threshold),
        Strategy::Rolling(cfg) => evaluate_rolling(cfg, &devices, snapshot.abort_threshold),
        Strategy::Canary(cfg) => evaluate_canary(cfg, &devices, snapshot),
    }
}

fn evaluate_immediate(devices: &[&DeviceDeployment], abort_threshold: u32) -> Evaluation {
    if let Some(reason) = failure_exceeded(devices, abort_threshold) {
        return Evaluation::decide(Decision::Abort { reason });
    }
    dispatch_all_remaining(devices, Decision::Continue)
}

fn evaluate_rolling(
    cfg: &RollingConfig,
    devices: &[&DeviceDeployment],
    abort_threshold: u32,
) -> Evaluation {
    if let Some(reason) = failure_exceeded(devices, abort_threshold) {
        return Evaluation::decide(Decision::Abort { reason });
    }

    let undispatched = undispatched_ids(devices);
    let in_flight = devices.iter().filter(|d| d.is_in_flight()).count();

    if undispatched.is_empty() {
        return Evaluation::decide(settled_or_continue(in_flight));
    }

    // The previous batch may only trail by max_surge devices
    if in_flight > cfg.max_surge as usize {
        return Evaluation::decide(Decision::Continue);
    }

    let capacity = cfg.max_in_flight().saturating_sub(in_flight);
    let size = cfg.effective_batch_size().min(capacity).min(undispatched.len());
    let batch = undispatched.into_iter().take(size).collect();
    Evaluation::dispatch(batch, Decision::Continue)
}

fn evaluate_canary(
    cfg: &CanaryConfig,
    devices: &[&DeviceDeployment],
    snapshot: &RolloutSnapshot<'_>,
) -> Evaluation {
    let canary_count = cfg.canary_count(devices.len());
    let (canary, rest) = devices.split_at(canary_count);

    let canary_pending = undispatched_ids(canary);
    if !canary_pending.is_empty() {
        return Evaluation::dispatch(canary_pending, Decision::Continue);
    }
    if canary.iter().any(|d| d.is_in_flight()) {
        return Evaluation::decide(Decision::Continue);
    }

    let promoted = rest.iter().any(|d| d.is_dispatched());
    if promoted {
        if let Some(reason) = failure_exceeded(devices, snapshot.abort_threshold) {
            return Evaluation::decide(Decision::Abort { reason });
        }
        return dispatch_all_remaining(devices, Decision::Continue);
    }

    let settled_at = canary.iter().map(|d| d.updated_at).max();
    if let (Some(settled_at), false) = (settled_at, snapshot.validation_waived) {
        let elapsed = (snapshot.now - settled_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let validation = cfg.validation_duration();
        if elapsed < validation {
            return Evaluation::decide(Decision::PauseForValidation {
                remaining: validation - elapsed,
            });
        }
    }

    let installed = canary
        .iter()
        .filter(|d| d.status == DeviceStatus::Installed)
        .count();
    let failed = canary.iter().filter(|d| d.status.is_failure()).count();
    let success_rate = if installed + failed == 0 {
        0
    } else {
        (installed * 100 / (installed + failed)) as u32
    };

    if success_rate < cfg.success_threshold {
        return Evaluation::decide(Decision::Abort {
            reason: format!(
                "canary success rate {}% is below threshold {}%",
                success_rate, cfg.success_threshold
            ),
        });
    }

    if rest.is_empty() {
        return Evaluation::decide(Decision::Complete);
    }
    Evaluation::dispatch(undispatched_ids(rest), Decision::Promote)
}

fn dispatch_all_remaining(devices: &[&DeviceDeployment], decision: Decision) -> Evaluation {
    let undispatched = undispatched_ids(devices);
    if !undispatched.is_empty() {
        return Evaluation::dispatch(undispatched, decision);
    }
    let in_flight = devices.iter().filter(|d| d.is_in_flight()).count();
    Evaluation::decide(settled_or_continue(in_flight))
}

fn settled_or_continue(in_flight: usize) -> Decision {
    if in_flight == 0 {
        Decision::Complete
    } else {
        Decision::Continue
    }
}

fn undispatched_ids(devices: &[&DeviceDeployment]) -> Vec<String> {
    devices
        .iter()
        .filter(|d| !d.is_dispatched())
        .map(|d| d.device_id.clone())
        .collect()
}

/// Reason to abort when failed devices exceed `threshold` percent of the fleet
fn failure_exceeded(devices: &[&DeviceDeployment], threshold: u32) -> Option<String> {
    let total = devices.len();
    let failed = devices.iter().filter(|d| d.status.is_failure()).count();
    if failed == 0 || failed * 100 <= threshold as usize * total {
        return None;
    }
    Some(format!(
        "{} of {} devices failed, above the {}% abort threshold",
        failed, total, threshold
    ))
}

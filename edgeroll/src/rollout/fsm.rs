//! Transition tables for deployments and per-device rollout rows

use crate::errors::FleetError;
use crate::models::deployment::{DeploymentStatus, DeviceStatus};

/// Deployment lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentEvent {
    /// Target devices resolved, rollout begins
    Start,

    /// Operator paused the rollout
    Pause,

    /// Operator resumed the rollout
    Resume,

    /// Every device reached a final status within tolerance
    Complete,

    /// Rollout could not continue
    Fail(String),

    /// Operator cancelled the rollout
    Cancel,

    /// Devices were reverted to their previous version
    RollBack,
}

impl DeploymentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DeploymentEvent::Start => "start",
            DeploymentEvent::Pause => "pause",
            DeploymentEvent::Resume => "resume",
            DeploymentEvent::Complete => "complete",
            DeploymentEvent::Fail(_) => "fail",
            DeploymentEvent::Cancel => "cancel",
            DeploymentEvent::RollBack => "rollback",
        }
    }
}

/// Compute the status a deployment moves to on `event`
pub fn next_status(
    current: DeploymentStatus,
    event: &DeploymentEvent,
) -> Result<DeploymentStatus, FleetError> {
    use DeploymentEvent as E;
    use DeploymentStatus as S;

    let next = match (current, event) {
        // From Pending
        (S::Pending, E::Start) => S::Running,
        (S::Pending, E::Cancel) => S::Cancelled,

        // From Running
        (S::Running, E::Pause) => S::Paused,
        (S::Running, E::Complete) => S::Completed,
        (S::Running, E::Fail(_)) => S::Failed,
        (S::Running, E::Cancel) => S::Cancelled,
        (S::Running, E::RollBack) => S::RolledBack,

        // From Paused
        (S::Paused, E::Resume) => S::Running,
        (S::Paused, E::Fail(_)) => S::Failed,
        (S::Paused, E::Cancel) => S::Cancelled,
        (S::Paused, E::RollBack) => S::RolledBack,

        // Finished rollouts can still be reverted
        (S::Completed, E::RollBack) => S::RolledBack,
        (S::Failed, E::RollBack) => S::RolledBack,

        (state, event) => {
            return Err(FleetError::InvalidState(format!(
                "Invalid transition: cannot {} a {} deployment",
                event.name(),
                state
            )))
        }
    };
    Ok(next)
}

/// Whether a device row may move from `from` to `to`.
///
/// Statuses only move forward. Reports that would move a row backward, or
/// repeat its current status, are rejected so duplicates are absorbed.
/// Two moves are exempt from the ordering:
///
/// * `rolled_back` is reachable from `installing`, `installed` and `failed`,
///   the statuses in which something may have been swapped in.
/// * an apply interrupted before the swap hands its row back, so
///   `downloading`, `downloaded` and `installing` may return to `pending`.
pub fn device_transition_allowed(from: DeviceStatus, to: DeviceStatus) -> bool {
    use DeviceStatus::*;

    match (from, to) {
        _ if from == to => false,
        (Installing | Installed | Failed, RolledBack) => true,
        (_, RolledBack) => false,
        (Downloading | Downloaded | Installing, Pending) => true,
        _ => !from.is_terminal() && to.rank() > from.rank(),
    }
}

/// Whether a row of a rollback campaign may move from `from` to `to`.
///
/// Such rows go straight from `pending` to the device's answer.
pub fn rollback_transition_allowed(from: DeviceStatus, to: DeviceStatus) -> bool {
    from == DeviceStatus::Pending && matches!(to, DeviceStatus::RolledBack | DeviceStatus::Failed)
}

/// Statuses a row may be in for a move to `to` to apply
pub fn device_predecessors(to: DeviceStatus) -> Vec<DeviceStatus> {
    DeviceStatus::ALL
        .into_iter()
        .filter(|from| device_transition_allowed(*from, to))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_happy_path() {
        let running = next_status(DeploymentStatus::Pending, &DeploymentEvent::Start).unwrap();
        assert_eq!(running, DeploymentStatus::Running);
        let paused = next_status(running, &DeploymentEvent::Pause).unwrap();
        let running = next_status(paused, &DeploymentEvent::Resume).unwrap();
        assert_eq!(
            next_status(running, &DeploymentEvent::Complete).unwrap(),
            DeploymentStatus::Completed
        );
    }

    #[test]
    fn test_deployment_invalid_transitions() {
        let err = next_status(DeploymentStatus::Completed, &DeploymentEvent::Pause).unwrap_err();
        assert!(matches!(err, FleetError::InvalidState(_)));
        assert!(next_status(DeploymentStatus::Pending, &DeploymentEvent::Pause).is_err());
        assert!(next_status(DeploymentStatus::Cancelled, &DeploymentEvent::Cancel).is_err());
        assert!(next_status(DeploymentStatus::RolledBack, &DeploymentEvent::RollBack).is_err());
    }

    #[test]
    fn test_device_transitions_are_monotonic() {
        use DeviceStatus::*;
        assert!(device_transition_allowed(Pending, Downloading));
        assert!(device_transition_allowed(Downloading, Installed));
        assert!(device_transition_allowed(Pending, Failed));
        assert!(!device_transition_allowed(Installing, Downloading));
        assert!(!device_transition_allowed(Installed, Installed));
        assert!(!device_transition_allowed(Installed, Failed));
        assert!(!device_transition_allowed(Failed, Installed));
        assert!(device_transition_allowed(Installed, RolledBack));
        assert!(device_transition_allowed(Failed, RolledBack));
        assert!(!device_transition_allowed(RolledBack, RolledBack));
    }

    #[test]
    fn test_device_predecessors() {
        use DeviceStatus::*;
        assert_eq!(
            device_predecessors(Installed),
            vec![Pending, Downloading, Downloaded, Installing]
        );
        assert_eq!(device_predecessors(Pending), vec![Downloading, Downloaded, Installing]);
        assert_eq!(device_predecessors(RolledBack), vec![Installing, Installed, Failed]);
    }

    #[test]
    fn test_rolled_back_needs_something_swapped() {
        use DeviceStatus::*;
        assert!(!device_transition_allowed(Pending, RolledBack));
        assert!(!device_transition_allowed(Downloading, RolledBack));
        assert!(!device_transition_allowed(Downloaded, RolledBack));
        assert!(device_transition_allowed(Installing, RolledBack));
    }

    #[test]
    fn test_interrupted_apply_returns_to_pending() {
        use DeviceStatus::*;
        assert!(device_transition_allowed(Downloading, Pending));
        assert!(device_transition_allowed(Installing, Pending));
        assert!(!device_transition_allowed(Installed, Pending));
        assert!(!device_transition_allowed(Failed, Pending));
        assert!(!device_transition_allowed(RolledBack, Pending));
    }

    #[test]
    fn test_rollback_rows() {
        use DeviceStatus::*;
        assert!(rollback_transition_allowed(Pending, RolledBack));
        assert!(rollback_transition_allowed(Pending, Failed));
        assert!(!rollback_transition_allowed(Pending, Installed));
        assert!(!rollback_transition_allowed(RolledBack, Failed));
    }
}

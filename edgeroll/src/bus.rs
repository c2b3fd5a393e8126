//! Rollout status streaming
//!
//! [`StatusBus`] wraps a bounded [`tokio::sync::broadcast`] channel. When a
//! subscriber falls behind, the oldest buffered events are overwritten and
//! the subscriber's next `recv` returns `Lagged(n)` with the number it
//! missed. Publishers never block and never fail.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::deployment::{DeploymentStatus, DeviceStatus};

/// Event published while deployments progress
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RolloutEvent {
    /// A device row moved to a new status
    Status(StatusEvent),

    /// A deployment changed lifecycle status
    Deployment {
        deployment_id: String,
        status: DeploymentStatus,
        at: DateTime<Utc>,
    },

    /// A batch was handed to a campaign
    BatchDispatched {
        deployment_id: String,
        campaign_id: String,
        device_ids: Vec<String>,
    },

    /// A canary passed validation and waits for operator promotion
    AwaitingPromotion { deployment_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub deployment_id: String,
    pub device_id: String,
    pub status: DeviceStatus,
    pub progress: u8,
    pub at: DateTime<Utc>,
}

/// Broadcast channel for rollout events
#[derive(Debug, Clone)]
pub struct StatusBus {
    tx: broadcast::Sender<RolloutEvent>,
}

impl StatusBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to all subscribers.
    ///
    /// Having no subscribers is not an error.
    pub fn publish(&self, event: RolloutEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RolloutEvent> {
        self.tx.subscribe()
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

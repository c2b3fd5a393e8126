//! Device-to-control-plane status reporting

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::FleetError;
use crate::models::update::StatusReport;

/// Pushes status transitions to the control plane
#[async_trait]
pub trait DeviceUpdateReporter: Send + Sync {
    async fn report(&self, report: StatusReport) -> Result<(), FleetError>;
}

/// In-process reporter feeding a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::Sender<StatusReport>,
}

impl ChannelReporter {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StatusReport>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl DeviceUpdateReporter for ChannelReporter {
    async fn report(&self, report: StatusReport) -> Result<(), FleetError> {
        self.tx
            .send(report)
            .await
            .map_err(|_| FleetError::ShutdownError("report channel closed".to_string()))
    }
}

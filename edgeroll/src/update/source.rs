//! Where a device gets its work from

use async_trait::async_trait;

use crate::errors::FleetError;
use crate::models::update::Assignment;

/// Hands out pending work to devices
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Oldest pending assignment of `device_id`, if any
    async fn next_assignment(&self, device_id: &str) -> Result<Option<Assignment>, FleetError>;

    /// False once the campaign was paused or cancelled
    async fn assignment_active(&self, campaign_id: &str) -> Result<bool, FleetError>;
}

//! Server state

use std::sync::Arc;

use crate::update::executor::UpdateExecutor;
use crate::update::health::HealthChecker;

/// Server state shared across handlers
pub struct ServerState {
    pub executor: Arc<UpdateExecutor>,
    pub health: Arc<HealthChecker>,
}

impl ServerState {
    pub fn new(executor: Arc<UpdateExecutor>, health: Arc<HealthChecker>) -> Self {
        Self { executor, health }
    }
}

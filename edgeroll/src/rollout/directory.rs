//! Target device resolution

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::errors::FleetError;
use crate::models::deployment::Selector;
use crate::models::device::DeviceRecord;

/// Resolves selectors to device ids
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Sorted, de-duplicated ids of the devices matching `selector`
    async fn resolve(&self, selector: &Selector) -> Result<Vec<String>, FleetError>;

    /// Devices whose platform is in `platforms` and architecture in
    /// `architectures`; an empty list matches anything
    async fn devices_for_platforms(
        &self,
        platforms: &[String],
        architectures: &[String],
    ) -> Result<Vec<String>, FleetError>;
}

/// Device directory held in memory
#[derive(Debug, Default)]
pub struct InMemoryDeviceDirectory {
    devices: RwLock<BTreeMap<String, DeviceRecord>>,
}

impl InMemoryDeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = DeviceRecord>) -> Self {
        let directory = Self::new();
        for device in devices {
            directory.register(device);
        }
        directory
    }

    /// Add or replace a device
    pub fn register(&self, device: DeviceRecord) {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        devices.insert(device.id.clone(), device);
    }

    pub fn remove(&self, device_id: &str) -> Option<DeviceRecord> {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        devices.remove(device_id)
    }

    pub fn len(&self) -> usize {
        self.devices.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeviceDirectory for InMemoryDeviceDirectory {
    async fn resolve(&self, selector: &Selector) -> Result<Vec<String>, FleetError> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());

        let ids: BTreeSet<String> = match selector {
            Selector::Devices { ids } => ids
                .iter()
                .filter(|id| devices.contains_key(id.as_str()))
                .cloned()
                .collect(),
            Selector::Groups { ids } => devices
                .values()
                .filter(|device| device.groups.iter().any(|group| ids.contains(group)))
                .map(|device| device.id.clone())
                .collect(),
            Selector::Labels { match_labels } => devices
                .values()
                .filter(|device| device.matches_labels(match_labels))
                .map(|device| device.id.clone())
                .collect(),
        };

        Ok(ids.into_iter().collect())
    }

    async fn devices_for_platforms(
        &self,
        platforms: &[String],
        architectures: &[String],
    ) -> Result<Vec<String>, FleetError> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        Ok(devices
            .values()
            .filter(|device| platforms.is_empty() || platforms.contains(&device.platform))
            .filter(|device| {
                architectures.is_empty() || architectures.contains(&device.architecture)
            })
            .map(|device| device.id.clone())
            .collect())
    }
}

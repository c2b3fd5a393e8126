//! Fleet device records

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A device known to the control plane
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub groups: Vec<String>,

    /// Device type, e.g. `raspberry-pi`
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub architecture: String,
}

impl DeviceRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.groups.push(group.to_string());
        self
    }

    pub fn with_platform(mut self, platform: &str, architecture: &str) -> Self {
        self.platform = platform.to_string();
        self.architecture = architecture.to_string();
        self
    }

    /// Every selector label is present with the same value
    pub fn matches_labels(&self, match_labels: &BTreeMap<String, String>) -> bool {
        match_labels
            .iter()
            .all(|(key, value)| self.labels.get(key) == Some(value))
    }
}

//! Artifact store contract

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::FleetError;

/// Where a versioned artifact can be downloaded from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLocation {
    pub locator: String,
    pub checksum: String,
    #[serde(default)]
    pub signature: Option<String>,
}

/// Resolves binary versions to download locations
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn get_artifact(
        &self,
        binary_id: &str,
        version: &str,
    ) -> Result<ArtifactLocation, FleetError>;
}

#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    artifacts: RwLock<HashMap<(String, String), ArtifactLocation>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, binary_id: &str, version: &str, location: ArtifactLocation) {
        self.artifacts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((binary_id.to_string(), version.to_string()), location);
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn get_artifact(
        &self,
        binary_id: &str,
        version: &str,
    ) -> Result<ArtifactLocation, FleetError> {
        self.artifacts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(binary_id.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| {
                FleetError::NotFound(format!("artifact {} version {}", binary_id, version))
            })
    }
}

//! Deployment manifest parsing
//!
//! Manifests arrive as YAML or JSON documents with identical field names:
//!
//! ```yaml
//! apiVersion: fleet/v1
//! kind: Deployment
//! metadata: { name: sensor-agent, namespace: default }
//! spec:
//!   selector: { matchLabels: { site: north } }
//!   strategy: { type: Canary, canary: { steps: [{ weight: 20, duration: 5m }, { weight: 100 }] } }
//!   template: { spec: { artifacts: [{ name: agent, version: 1.2.0, url: ..., checksum: ... }] } }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::FleetError;
use crate::models::deployment::{ArtifactRef, ArtifactType, NewDeployment, Selector};
use crate::models::strategy::{CanaryConfig, RollingConfig, Strategy};

const DEFAULT_MAX_UNAVAILABLE: &str = "25%";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ManifestMetadata,
    pub spec: ManifestSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestSpec {
    #[serde(default)]
    pub selector: ManifestSelector,
    #[serde(default)]
    pub strategy: ManifestStrategy,
    #[serde(default)]
    pub template: ManifestTemplate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestStrategy {
    #[serde(default, rename = "type")]
    pub strategy_type: String,
    #[serde(default)]
    pub rolling_update: Option<RollingUpdate>,
    #[serde(default)]
    pub canary: Option<CanarySteps>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdate {
    #[serde(default)]
    pub max_unavailable: Option<IntOrPercent>,
    #[serde(default)]
    pub max_surge: Option<IntOrPercent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanarySteps {
    #[serde(default)]
    pub steps: Vec<CanaryStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanaryStep {
    pub weight: u32,
    #[serde(default)]
    pub duration: Option<DurationValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestTemplate {
    #[serde(default)]
    pub spec: TemplateSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateSpec {
    #[serde(default)]
    pub artifacts: Vec<ManifestArtifact>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestArtifact {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub checksum: String,
    #[serde(default, rename = "type")]
    pub artifact_type: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
}

/// `5` or `"10%"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntOrPercent {
    Int(u32),
    Str(String),
}

impl IntOrPercent {
    /// Resolve against `total` devices, rounding percentages up
    pub fn resolve(&self, total: usize) -> Result<u32, FleetError> {
        match self {
            IntOrPercent::Int(value) => Ok(*value),
            IntOrPercent::Str(raw) => {
                let raw = raw.trim();
                if let Some(percent) = raw.strip_suffix('%') {
                    let percent: usize = percent.trim().parse().map_err(|_| {
                        FleetError::InvalidInput(format!("invalid percentage: {}", raw))
                    })?;
                    if percent > 100 {
                        return Err(FleetError::InvalidInput(format!(
                            "percentage must be between 0-100: {}",
                            raw
                        )));
                    }
                    Ok((total * percent).div_ceil(100) as u32)
                } else {
                    raw.parse()
                        .map_err(|_| FleetError::InvalidInput(format!("invalid value: {}", raw)))
                }
            }
        }
    }
}

/// `300`, `"30s"`, `"5m"`, `"1h"` or `"500ms"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Seconds(u64),
    Text(String),
}

impl DurationValue {
    pub fn to_duration(&self) -> Result<Duration, FleetError> {
        match self {
            DurationValue::Seconds(secs) => Ok(Duration::from_secs(*secs)),
            DurationValue::Text(raw) => parse_duration(raw),
        }
    }
}

fn parse_duration(raw: &str) -> Result<Duration, FleetError> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: u64 = number
        .parse()
        .map_err(|_| FleetError::InvalidInput(format!("invalid duration: {}", raw)))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(FleetError::InvalidInput(format!("invalid duration unit: {}", raw))),
    }
}

/// Parse and validate a YAML or JSON manifest
pub fn parse_manifest(data: &[u8]) -> Result<Manifest, FleetError> {
    let mut manifest: Manifest = match serde_yaml::from_slice(data) {
        Ok(manifest) => manifest,
        Err(yaml_err) => serde_json::from_slice(data).map_err(|json_err| {
            FleetError::InvalidInput(format!(
                "failed to parse manifest as YAML or JSON: {}, {}",
                yaml_err, json_err
            ))
        })?,
    };
    manifest.validate()?;
    Ok(manifest)
}

impl Manifest {
    /// Validate the manifest, filling in namespace and rolling defaults
    pub fn validate(&mut self) -> Result<(), FleetError> {
        if self.api_version != "fleet.v1" && self.api_version != "fleet/v1" {
            return Err(FleetError::InvalidInput(format!(
                "unsupported API version: {}",
                self.api_version
            )));
        }
        if self.kind != "Deployment" {
            return Err(FleetError::InvalidInput(format!(
                "unsupported kind: {} (expected 'Deployment')",
                self.kind
            )));
        }
        if self.metadata.name.trim().is_empty() {
            return Err(FleetError::InvalidInput("deployment name is required".to_string()));
        }
        if self.metadata.namespace.is_empty() {
            self.metadata.namespace = "default".to_string();
        }
        if self.spec.selector.match_labels.is_empty() {
            return Err(FleetError::InvalidInput(
                "selector must specify matchLabels".to_string(),
            ));
        }

        self.validate_strategy()?;

        let artifacts = &self.spec.template.spec.artifacts;
        if artifacts.is_empty() {
            return Err(FleetError::InvalidInput(
                "at least one artifact is required".to_string(),
            ));
        }
        for (i, artifact) in artifacts.iter().enumerate() {
            if artifact.name.is_empty() {
                return Err(FleetError::InvalidInput(format!("artifact[{}]: name is required", i)));
            }
            if artifact.version.is_empty() {
                return Err(FleetError::InvalidInput(format!(
                    "artifact[{}]: version is required",
                    i
                )));
            }
        }
        Ok(())
    }

    fn validate_strategy(&mut self) -> Result<(), FleetError> {
        let strategy = &mut self.spec.strategy;
        match strategy.strategy_type.as_str() {
            "" | "RollingUpdate" => {
                let rolling = strategy.rolling_update.get_or_insert_with(|| RollingUpdate {
                    max_unavailable: Some(IntOrPercent::Str(DEFAULT_MAX_UNAVAILABLE.to_string())),
                    max_surge: Some(IntOrPercent::Str(DEFAULT_MAX_UNAVAILABLE.to_string())),
                });
                for value in [&rolling.max_unavailable, &rolling.max_surge].into_iter().flatten() {
                    value.resolve(100)?;
                }
                Ok(())
            }
            "Canary" => {
                let canary = strategy.canary.as_ref().ok_or_else(|| {
                    FleetError::InvalidInput("canary strategy requires configuration".to_string())
                })?;
                if canary.steps.is_empty() {
                    return Err(FleetError::InvalidInput(
                        "canary requires at least one step".to_string(),
                    ));
                }
                for (i, step) in canary.steps.iter().enumerate() {
                    if step.weight == 0 || step.weight > 100 {
                        return Err(FleetError::InvalidInput(format!(
                            "canary step[{}]: weight must be between 1-100",
                            i
                        )));
                    }
                    if let Some(duration) = &step.duration {
                        duration.to_duration()?;
                    }
                }
                if canary.steps.last().map(|step| step.weight) != Some(100) {
                    return Err(FleetError::InvalidInput(
                        "final canary step must have weight of 100".to_string(),
                    ));
                }
                Ok(())
            }
            other => Err(FleetError::InvalidInput(format!("unknown strategy type: {}", other))),
        }
    }

    /// Label selector of the manifest
    pub fn selector(&self) -> Selector {
        Selector::Labels {
            match_labels: self.spec.selector.match_labels.clone(),
        }
    }

    /// Map the manifest to a deployment request.
    ///
    /// `target_count` resolves percentage values of a rolling strategy.
    pub fn to_new_deployment(
        &self,
        target_count: usize,
        created_by: &str,
    ) -> Result<NewDeployment, FleetError> {
        let artifact = self.spec.template.spec.artifacts.first().ok_or_else(|| {
            FleetError::InvalidInput("at least one artifact is required".to_string())
        })?;
        let artifact_type = match &artifact.artifact_type {
            Some(raw) => raw.parse()?,
            None => ArtifactType::Binary,
        };

        Ok(NewDeployment {
            name: self.metadata.name.clone(),
            namespace: Some(self.metadata.namespace.clone()),
            description: String::new(),
            artifact: ArtifactRef {
                name: artifact.name.clone(),
                artifact_type,
                version: artifact.version.clone(),
                locator: artifact.url.clone(),
                checksum: artifact.checksum.clone(),
                signature: None,
            },
            selector: self.selector(),
            strategy: self.to_strategy(target_count)?,
            created_by: created_by.to_string(),
            abort_threshold: None,
        })
    }

    fn to_strategy(&self, target_count: usize) -> Result<Strategy, FleetError> {
        let strategy = &self.spec.strategy;
        if strategy.strategy_type == "Canary" {
            let first = strategy
                .canary
                .as_ref()
                .and_then(|canary| canary.steps.first())
                .ok_or_else(|| {
                    FleetError::InvalidInput("canary requires at least one step".to_string())
                })?;
            let mut config = CanaryConfig {
                canary_percentage: first.weight,
                ..Default::default()
            };
            if let Some(duration) = &first.duration {
                config.validation_duration_ms = duration.to_duration()?.as_millis() as u64;
            }
            return Ok(Strategy::Canary(config));
        }

        let rolling = strategy.rolling_update.clone().unwrap_or_default();
        let unavailable = rolling
            .max_unavailable
            .unwrap_or_else(|| IntOrPercent::Str(DEFAULT_MAX_UNAVAILABLE.to_string()))
            .resolve(target_count)?
            .max(1);
        let surge = match rolling.max_surge {
            Some(value) => value.resolve(target_count)?,
            None => 0,
        };
        Ok(Strategy::Rolling(RollingConfig {
            batch_size: unavailable,
            max_unavailable: unavailable,
            max_surge: surge,
            ..Default::default()
        }))
    }
}

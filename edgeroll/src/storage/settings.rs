//! Settings file management

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::FleetError;
use crate::logs::LogLevel;
use crate::models::device::DeviceRecord;

/// What this process runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Orchestrator and campaign service
    Control,

    /// Update executor polling a remote control plane
    #[default]
    Device,

    /// Both sides in one process, wired in memory
    Standalone,
}

impl std::str::FromStr for Role {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "control" => Ok(Role::Control),
            "device" => Ok(Role::Device),
            "standalone" => Ok(Role::Standalone),
            other => Err(FleetError::ConfigError(format!("unknown role: {}", other))),
        }
    }
}

/// Node settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// Also write a daily rolling log file under the logs dir
    #[serde(default)]
    pub log_to_file: bool,

    #[serde(default)]
    pub role: Role,

    #[serde(default)]
    pub control: ControlSettings,

    #[serde(default)]
    pub device: DeviceSettings,

    #[serde(default)]
    pub server: ServerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: false,
            role: Role::default(),
            control: ControlSettings::default(),
            device: DeviceSettings::default(),
            server: ServerSettings::default(),
        }
    }
}

/// Control plane settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSettings {
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Devices still working after this long are marked failed
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_secs: u64,

    /// Failure percentage aborting an immediate rollout
    #[serde(default = "default_abort_threshold")]
    pub default_abort_threshold: u32,

    #[serde(default = "default_status_bus_capacity")]
    pub status_bus_capacity: usize,

    /// Static device inventory loaded into the directory at startup
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
}

fn default_reconcile_interval() -> u64 {
    10
}

fn default_batch_timeout() -> u64 {
    7200
}

fn default_abort_threshold() -> u32 {
    50
}

fn default_status_bus_capacity() -> usize {
    1024
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval(),
            batch_timeout_secs: default_batch_timeout(),
            default_abort_threshold: default_abort_threshold(),
            status_bus_capacity: default_status_bus_capacity(),
            devices: Vec::new(),
        }
    }
}

impl ControlSettings {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }
}

/// Device updater settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// Control plane base URL for assignments and reports
    #[serde(default = "default_control_url")]
    pub control_url: String,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Identity used when the device registers with an in-process directory
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default = "default_architecture")]
    pub architecture: String,

    /// Overrides of the storage layout directories
    #[serde(default)]
    pub active_dir: Option<PathBuf>,
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,

    #[serde(default = "default_max_backups")]
    pub max_backups: usize,

    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_secs: u64,

    /// Bound on each pre/post install script
    #[serde(default = "default_script_timeout")]
    pub script_timeout_secs: u64,

    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,

    /// Register the disk and memory checks
    #[serde(default = "default_true")]
    pub default_health_checks: bool,

    #[serde(default = "default_disk_threshold")]
    pub disk_threshold_percent: f32,

    #[serde(default = "default_memory_threshold")]
    pub memory_threshold_percent: f32,

    /// HS256 key of release signatures
    #[serde(default, deserialize_with = "deserialize_secret", skip_serializing)]
    pub signature_secret: Option<SecretString>,
}

fn default_true() -> bool {
    true
}

fn default_device_id() -> String {
    "local".to_string()
}

fn default_control_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_poll_interval() -> u64 {
    30
}

fn default_platform() -> String {
    std::env::consts::OS.to_string()
}

fn default_architecture() -> String {
    std::env::consts::ARCH.to_string()
}

fn default_max_backups() -> usize {
    3
}

fn default_download_timeout() -> u64 {
    300
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    2000
}

fn default_retry_max_delay() -> u64 {
    120
}

fn default_script_timeout() -> u64 {
    300
}

fn default_health_timeout() -> u64 {
    60
}

fn default_disk_threshold() -> f32 {
    95.0
}

fn default_memory_threshold() -> f32 {
    90.0
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.is_empty()).map(SecretString::from))
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            control_url: default_control_url(),
            poll_interval_secs: default_poll_interval(),
            labels: BTreeMap::new(),
            groups: Vec::new(),
            platform: default_platform(),
            architecture: default_architecture(),
            active_dir: None,
            backup_dir: None,
            staging_dir: None,
            max_backups: default_max_backups(),
            download_timeout_secs: default_download_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_secs: default_retry_max_delay(),
            script_timeout_secs: default_script_timeout(),
            health_timeout_secs: default_health_timeout(),
            default_health_checks: true,
            disk_threshold_percent: default_disk_threshold(),
            memory_threshold_percent: default_memory_threshold(),
            signature_secret: None,
        }
    }
}

impl DeviceSettings {
    /// Directory entry describing this device
    pub fn device_record(&self) -> DeviceRecord {
        DeviceRecord {
            id: self.device_id.clone(),
            labels: self.labels.clone(),
            groups: self.groups.clone(),
            platform: self.platform.clone(),
            architecture: self.architecture.clone(),
        }
    }
}

/// Local HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
        }
    }
}

//! Application configuration options

use std::time::Duration;

use secrecy::SecretString;

use crate::models::device::DeviceRecord;
use crate::rollout::orchestrator::OrchestratorOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{Role, Settings};
use crate::update::executor::ExecutorOptions;
use crate::update::health::DefaultCheckOptions;
use crate::update::rollback::RollbackOptions;
use crate::utils::CooldownOptions;
use crate::workers::{rollout, updater};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// What this process runs
    pub role: Role,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Control plane base URL (device role)
    pub control_url: String,

    /// Identity of the local device
    pub device: DeviceRecord,

    /// Devices loaded into the directory at startup
    pub inventory: Vec<DeviceRecord>,

    /// Enable the local status server
    pub enable_server: bool,

    /// Server configuration
    pub server: ServerOptions,

    pub orchestrator: OrchestratorOptions,

    pub executor: ExecutorOptions,

    pub rollback: RollbackOptions,

    /// Built-in health checks, when enabled
    pub health_checks: Option<DefaultCheckOptions>,

    /// HS256 key of release signatures
    pub signature_secret: Option<SecretString>,

    /// Rollout worker options
    pub rollout_worker: rollout::Options,

    /// Updater worker options
    pub updater_worker: updater::Options,

    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default(), StorageLayout::default())
    }
}

impl AppOptions {
    /// Derive the runtime options from the settings file
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Self {
        let control = &settings.control;
        let device = &settings.device;

        let active_dir = device
            .active_dir
            .clone()
            .unwrap_or_else(|| layout.active_dir().path().to_path_buf());
        let backup_dir = device
            .backup_dir
            .clone()
            .unwrap_or_else(|| layout.backup_dir().path().to_path_buf());
        let staging_dir = device
            .staging_dir
            .clone()
            .unwrap_or_else(|| layout.staging_dir().path().to_path_buf());

        Self {
            role: settings.role,
            control_url: device.control_url.clone(),
            device: device.device_record(),
            inventory: control.devices.clone(),
            enable_server: settings.server.enabled,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            orchestrator: OrchestratorOptions {
                reconcile_interval: control.reconcile_interval(),
                batch_timeout: control.batch_timeout(),
                default_abort_threshold: control.default_abort_threshold,
                status_bus_capacity: control.status_bus_capacity,
            },
            executor: ExecutorOptions {
                device_id: device.device_id.clone(),
                state_dir: layout.update_dir().path().to_path_buf(),
                staging_dir,
                download_timeout: Duration::from_secs(device.download_timeout_secs),
                retry_attempts: device.retry_attempts,
                retry_backoff: CooldownOptions {
                    base_delay: Duration::from_millis(device.retry_base_delay_ms),
                    max_delay: Duration::from_secs(device.retry_max_delay_secs),
                    ..Default::default()
                },
                script_timeout: Duration::from_secs(device.script_timeout_secs),
                health_timeout: Duration::from_secs(device.health_timeout_secs),
            },
            rollback: RollbackOptions {
                active_dir,
                backup_dir,
                max_backups: device.max_backups,
            },
            health_checks: device.default_health_checks.then(|| DefaultCheckOptions {
                max_disk_percent: device.disk_threshold_percent,
                max_memory_percent: device.memory_threshold_percent,
                ..Default::default()
            }),
            signature_secret: device.signature_secret.clone(),
            rollout_worker: rollout::Options {
                interval: control.reconcile_interval(),
            },
            updater_worker: updater::Options {
                device_id: device.device_id.clone(),
                interval: Duration::from_secs(device.poll_interval_secs.max(1)),
                ..Default::default()
            },
            max_shutdown_delay: Duration::from_secs(30),
            layout,
        }
    }

    /// Whether the orchestrator runs in this process
    pub fn runs_control(&self) -> bool {
        matches!(self.role, Role::Control | Role::Standalone)
    }

    /// Whether the update executor runs in this process
    pub fn runs_device(&self) -> bool {
        matches!(self.role, Role::Device | Role::Standalone)
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

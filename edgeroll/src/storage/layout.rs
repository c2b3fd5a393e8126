//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::FleetError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// On-disk layout of a node
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Executor state (`update.state`)
    pub fn update_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("update"))
    }

    /// Artifact set currently in use
    pub fn active_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("active"))
    }

    /// Version-tagged copies of the active set
    pub fn backup_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("backups"))
    }

    /// Partial downloads
    pub fn staging_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("staging"))
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), FleetError> {
        self.update_dir().create().await?;
        self.active_dir().create().await?;
        self.backup_dir().create().await?;
        self.staging_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        // Use /etc/edgeroll on Linux, or user home directory on other platforms
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/etc/edgeroll");

        #[cfg(not(target_os = "linux"))]
        let base_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".edgeroll");

        Self::new(base_dir)
    }
}

#[cfg(not(target_os = "linux"))]
mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
    }
}

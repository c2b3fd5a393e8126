//! Versioned backups of the active artifact set
//!
//! Each backup lives in its own directory under the backup root:
//!
//! ```text
//! <backup_dir>/<id>/backup.json   metadata
//! <backup_dir>/<id>/data/         copy of the active directory
//! ```

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::FleetError;
use crate::filesys::dir::Dir;

const METADATA_FILE: &str = "backup.json";
const DATA_DIR: &str = "data";

/// A saved copy of the active artifact set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub version: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Rollback manager options
#[derive(Debug, Clone)]
pub struct RollbackOptions {
    /// Directory holding the active artifact set
    pub active_dir: PathBuf,

    /// Root of the backup directories
    pub backup_dir: PathBuf,

    /// Backups kept; the oldest is evicted beyond this
    pub max_backups: usize,
}

/// Creates, lists and restores backups
#[derive(Debug)]
pub struct RollbackManager {
    active: Dir,
    backups: Dir,
    max_backups: usize,
}

impl RollbackManager {
    pub fn new(options: RollbackOptions) -> Self {
        Self {
            active: Dir::new(options.active_dir),
            backups: Dir::new(options.backup_dir),
            max_backups: options.max_backups.max(1),
        }
    }

    pub fn active_dir(&self) -> &Dir {
        &self.active
    }

    /// Copy the active set into a new backup tagged with `version`
    pub async fn create_backup(&self, version: &str) -> Result<Backup, FleetError> {
        let now = Utc::now();
        let id = format!("{}-{}", now.format("%Y%m%d%H%M%S%3f"), sanitize(version));
        let root = self.backups.subdir(&id);
        root.delete().await?;

        self.active.copy_to(&root.subdir(DATA_DIR)).await?;
        let backup = Backup {
            id,
            version: version.to_string(),
            path: root.path().to_path_buf(),
            created_at: now,
        };
        root.file(METADATA_FILE).write_json(&backup).await?;
        info!(backup = %backup.id, version = %backup.version, "Backup created");

        self.prune().await?;
        Ok(backup)
    }

    /// Every readable backup, newest first
    pub async fn list_backups(&self) -> Result<Vec<Backup>, FleetError> {
        if !self.backups.exists().await {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        for path in self.backups.list_dirs().await? {
            let metadata = Dir::new(path.clone()).file(METADATA_FILE);
            match metadata.read_json::<Backup>().await {
                Ok(backup) => backups.push(backup),
                Err(e) => debug!("Skipping unreadable backup {}: {}", path.display(), e),
            }
        }
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(backups)
    }

    pub async fn latest_backup(&self) -> Result<Option<Backup>, FleetError> {
        Ok(self.list_backups().await?.into_iter().next())
    }

    /// Check that a backup has its metadata and data directory
    pub async fn validate_backup(&self, id: &str) -> Result<Backup, FleetError> {
        let root = self.backups.subdir(id);
        let metadata = root.file(METADATA_FILE);
        if !metadata.exists().await {
            return Err(FleetError::NotFound(format!("backup {}", id)));
        }
        let backup: Backup = metadata
            .read_json()
            .await
            .map_err(|e| FleetError::Integrity(format!("backup {} metadata: {}", id, e)))?;
        if backup.id != id {
            return Err(FleetError::Integrity(format!(
                "backup {} metadata names {}",
                id, backup.id
            )));
        }
        if !root.subdir(DATA_DIR).exists().await {
            return Err(FleetError::Integrity(format!("backup {} has no data", id)));
        }
        Ok(backup)
    }

    /// Restore the most recent backup
    pub async fn rollback(&self) -> Result<Backup, FleetError> {
        let latest = self
            .latest_backup()
            .await?
            .ok_or_else(|| FleetError::NotFound("no backup to roll back to".to_string()))?;
        self.rollback_to(&latest.id).await
    }

    /// Restore a specific backup over the active set
    pub async fn rollback_to(&self, id: &str) -> Result<Backup, FleetError> {
        let backup = self.validate_backup(id).await?;

        let restoring = Dir::new(self.active.path().with_extension("restore"));
        restoring.delete().await?;
        self.backups
            .subdir(id)
            .subdir(DATA_DIR)
            .copy_to(&restoring)
            .await?;
        restoring.swap_into(&self.active).await?;

        warn!(backup = %backup.id, version = %backup.version, "Active set restored from backup");
        Ok(backup)
    }

    async fn prune(&self) -> Result<(), FleetError> {
        let backups = self.list_backups().await?;
        for stale in backups.iter().skip(self.max_backups) {
            debug!(backup = %stale.id, "Evicting backup");
            self.backups.subdir(&stale.id).delete().await?;
        }
        Ok(())
    }
}

fn sanitize(version: &str) -> String {
    version
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

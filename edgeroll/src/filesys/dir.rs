//! Directory operations

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::FleetError;
use crate::filesys::file::File;

/// A directory wrapper with path
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory (and parents)
    pub async fn create(&self) -> Result<(), FleetError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Delete the directory and all contents
    pub async fn delete(&self) -> Result<(), FleetError> {
        if self.exists().await {
            fs::remove_dir_all(&self.path).await?;
        }
        Ok(())
    }

    /// List subdirectories
    pub async fn list_dirs(&self) -> Result<Vec<PathBuf>, FleetError> {
        let mut dirs = Vec::new();
        let mut entries = fs::read_dir(&self.path).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }

        Ok(dirs)
    }

    /// Get a file within this directory
    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }

    /// Get a subdirectory
    pub fn subdir(&self, name: &str) -> Dir {
        Dir::new(self.path.join(name))
    }

    /// Recursively copy the contents into `dest`, creating it.
    ///
    /// A missing source copies nothing.
    pub async fn copy_to(&self, dest: &Dir) -> Result<(), FleetError> {
        let src = self.path.clone();
        let dst = dest.path.clone();
        tokio::task::spawn_blocking(move || copy_recursive(&src, &dst))
            .await
            .map_err(|e| FleetError::Internal(format!("copy task failed: {}", e)))??;
        Ok(())
    }

    /// Replace `dest` with this directory using renames.
    ///
    /// The old `dest` is moved aside first and removed once the new one is
    /// in place.
    pub async fn swap_into(&self, dest: &Dir) -> Result<(), FleetError> {
        let retired = Dir::new(dest.path.with_extension("old"));
        retired.delete().await?;
        if dest.exists().await {
            fs::rename(&dest.path, &retired.path).await?;
        }
        fs::rename(&self.path, &dest.path).await?;
        retired.delete().await
    }
}

fn copy_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    if !src.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copy_to_is_recursive() {
        let tmp = tempfile::tempdir().unwrap();
        let src = Dir::new(tmp.path().join("src"));
        src.file("a.bin").write_bytes(b"a").await.unwrap();
        src.subdir("lib").file("b.so").write_bytes(b"b").await.unwrap();

        let dst = Dir::new(tmp.path().join("dst"));
        src.copy_to(&dst).await.unwrap();

        assert_eq!(dst.file("a.bin").read_string().await.unwrap(), "a");
        assert_eq!(dst.subdir("lib").file("b.so").read_string().await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_swap_into_replaces_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let active = Dir::new(tmp.path().join("active"));
        active.file("v").write_string("1").await.unwrap();
        let staged = Dir::new(tmp.path().join("staged"));
        staged.file("v").write_string("2").await.unwrap();

        staged.swap_into(&active).await.unwrap();

        assert_eq!(active.file("v").read_string().await.unwrap(), "2");
        assert!(!staged.exists().await);
        assert!(!tmp.path().join("active.old").exists());
    }
}

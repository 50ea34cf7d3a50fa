//! Config file on disk
//!
//! `~/.oxidefetch/config.json`, or `%APPDATA%\OxideFetch\config.json` on Windows.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};

use super::types::{ProvisionConfig, CONFIG_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("No home directory to keep the config in")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

fn default_path() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    let dir = dirs::config_dir()
        .map(|d| d.join("OxideFetch"))
        .or_else(|| dirs::home_dir().map(|h| h.join(".oxidefetch")));
    #[cfg(not(windows))]
    let dir = dirs::home_dir().map(|h| h.join(".oxidefetch"));

    dir.map(|d| d.join("config.json"))
        .ok_or(StorageError::NoConfigDir)
}

/// Reads and writes one [`ProvisionConfig`] file.
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: default_path()?,
        })
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// A missing file loads as the defaults. An unparsable one is copied
    /// aside and also loads as the defaults, which `validate` then rejects
    /// with a field-level message.
    pub async fn load(&self) -> Result<ProvisionConfig, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ProvisionConfig::default())
            }
            Err(e) => return Err(e.into()),
        };

        let config: ProvisionConfig = match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                warn!("{} is not valid config JSON: {}", self.path.display(), e);
                match self.set_aside().await {
                    Ok(copy) => warn!("Kept the unreadable file as {}", copy.display()),
                    Err(e) => error!("Could not keep a copy of the unreadable config: {}", e),
                }
                return Ok(ProvisionConfig::default());
            }
        };

        if config.version > CONFIG_VERSION {
            return Err(StorageError::VersionTooNew {
                found: config.version,
                supported: CONFIG_VERSION,
            });
        }
        Ok(config)
    }

    /// Write through a temp file and rename over the target.
    pub async fn save(&self, config: &ProvisionConfig) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(config)?;
        let staged = self.path.with_extension("json.tmp");

        let mut file = fs::File::create(&staged).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&staged, &self.path).await?;
        Ok(())
    }

    async fn set_aside(&self) -> Result<PathBuf, StorageError> {
        let copy = self.path.with_extension(format!(
            "json.backup.{}",
            Utc::now().format("%Y%m%d_%H%M%S")
        ));
        fs::copy(&self.path, &copy).await?;
        Ok(copy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_nonexistent() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("config.json"));

        let config = storage.load().await.unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.pipeline.env_var, "NMS_HOME");
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("nested/config.json"));

        let mut config = ProvisionConfig::default();
        config.ssh.host = "nms01".to_string();
        config.pipeline.exclusion = "logs".to_string();
        storage.save(&config).await.unwrap();

        let loaded = storage.load().await.unwrap();
        assert_eq!(loaded.ssh.host, "nms01");
        assert_eq!(loaded.pipeline.exclusion, "logs");
    }

    #[tokio::test]
    async fn test_corrupt_file_is_set_aside() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let storage = ConfigStorage::with_path(&path);

        let config = storage.load().await.unwrap();
        assert!(config.ssh.host.is_empty());

        let backups = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("backup"))
            .count();
        assert_eq!(backups, 1);
        // The original stays where it was for the user to fix
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[tokio::test]
    async fn test_save_replaces_without_leftovers() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{ old").unwrap();
        let storage = ConfigStorage::with_path(&path);

        storage.save(&ProvisionConfig::default()).await.unwrap();

        assert!(storage.exists().await);
        let names: Vec<String> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["config.json".to_string()]);
        assert_eq!(storage.load().await.unwrap().pipeline.remote_suffix, "java");
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"version": 99}"#).unwrap();

        let err = ConfigStorage::with_path(&path).load().await.unwrap_err();
        assert!(matches!(err, StorageError::VersionTooNew { found: 99, .. }));
    }
}

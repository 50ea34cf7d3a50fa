//! Configuration Types

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::ssh::SshConfig;

/// Current config file format version
pub const CONFIG_VERSION: u32 = 1;

/// Root of `config.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    /// Config format version
    #[serde(default = "default_version")]
    pub version: u32,

    /// Remote host to provision from
    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub pipeline: PipelineSettings,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            ssh: SshConfig::default(),
            pipeline: PipelineSettings::default(),
        }
    }
}

impl ProvisionConfig {
    /// Check what serde cannot.
    pub fn validate(&self) -> Result<(), String> {
        if self.ssh.host.trim().is_empty() {
            return Err("ssh.host is empty".to_string());
        }
        if self.ssh.username.trim().is_empty() {
            return Err("ssh.username is empty".to_string());
        }
        let p = &self.pipeline;
        if p.env_var.trim().is_empty() {
            return Err("pipeline.env_var is empty".to_string());
        }
        if p.completion_marker.trim().is_empty() {
            return Err("pipeline.completion_marker is empty".to_string());
        }
        p.validate_paths()
    }
}

/// What to archive, where to put it, and how long each step may take
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Remote env var holding the installation root
    pub env_var: String,

    /// Sub-directory of the installation root to archive; also the name of
    /// the local target directory
    pub remote_suffix: String,

    /// Sub-path excluded from the archive
    pub exclusion: String,

    /// Echoed only if every archive step succeeded
    pub completion_marker: String,

    pub remote_temp_dir: String,

    /// Defaults to the OS temp dir
    pub local_temp_dir: Option<PathBuf>,

    /// Parent of the local target directory
    pub local_extract_dir: PathBuf,

    /// Timeout for short commands (env lookup, `test -d`, `rm -f`)
    pub command_timeout_secs: u64,

    /// Timeout for the archive command
    pub archive_timeout_secs: u64,

    /// Purpose tag recorded on the session
    pub purpose: String,

    /// Custom regex for counting archived entries; zip verbose output if unset
    pub entry_pattern: Option<String>,

    /// How long a graceful shutdown waits for running operations
    pub shutdown_grace_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            env_var: "NMS_HOME".to_string(),
            remote_suffix: "java".to_string(),
            exclusion: "working".to_string(),
            completion_marker: "OXIDEFETCH_ARCHIVE_COMPLETE".to_string(),
            remote_temp_dir: "/tmp".to_string(),
            local_temp_dir: None,
            local_extract_dir: PathBuf::from("provisioned"),
            command_timeout_secs: 30,
            archive_timeout_secs: 1800,
            purpose: "project_only".to_string(),
            entry_pattern: None,
            shutdown_grace_secs: 10,
        }
    }
}

impl PipelineSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn archive_timeout(&self) -> Duration {
        Duration::from_secs(self.archive_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// `remote_suffix` names the local directory that gets replaced, so it
    /// must be a single plain component. `exclusion` may be empty or any
    /// relative path below the suffix.
    pub fn validate_paths(&self) -> Result<(), String> {
        let mut components = Path::new(&self.remote_suffix).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => {
                return Err(format!(
                    "pipeline.remote_suffix must be a single directory name, got {:?}",
                    self.remote_suffix
                ))
            }
        }
        if !Path::new(&self.exclusion)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(format!(
                "pipeline.exclusion must be a relative path, got {:?}",
                self.exclusion
            ));
        }
        Ok(())
    }

    /// `<local_extract_dir>/<remote_suffix>`, replaced on every run
    pub fn local_target_dir(&self) -> PathBuf {
        self.local_extract_dir.join(&self.remote_suffix)
    }

    pub fn local_temp_dir(&self) -> PathBuf {
        crate::sftp::path_utils::local_temp_dir(self.local_temp_dir.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{
            "ssh": {"host": "nms01", "username": "deploy", "auth": {"type": "password", "password": "pw"}},
            "pipeline": {"exclusion": "logs"}
        }"#;
        let config: ProvisionConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.pipeline.exclusion, "logs");
        assert_eq!(config.pipeline.env_var, "NMS_HOME");
        assert_eq!(config.pipeline.remote_suffix, "java");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_local_target_dir() {
        let settings = PipelineSettings {
            local_extract_dir: PathBuf::from("/srv/workspace"),
            ..Default::default()
        };
        assert_eq!(settings.local_target_dir(), PathBuf::from("/srv/workspace/java"));
    }

    #[test]
    fn test_validate_rejects_missing_host() {
        let config = ProvisionConfig::default();
        assert!(config.validate().unwrap_err().contains("ssh.host"));
    }

    #[test]
    fn test_remote_suffix_must_be_one_directory_name() {
        for suffix in ["", "/", "/srv/data", ".", "..", "java/lib", "./java", "java/.."] {
            let settings = PipelineSettings {
                remote_suffix: suffix.to_string(),
                ..Default::default()
            };
            let err = settings.validate_paths().unwrap_err();
            assert!(err.contains("remote_suffix"), "{:?}: {}", suffix, err);
        }

        let settings = PipelineSettings {
            remote_suffix: "java".to_string(),
            ..Default::default()
        };
        assert!(settings.validate_paths().is_ok());
    }

    #[test]
    fn test_exclusion_must_stay_relative() {
        for exclusion in ["/", "/etc", "../working", "working/../.."] {
            let settings = PipelineSettings {
                exclusion: exclusion.to_string(),
                ..Default::default()
            };
            assert!(settings.validate_paths().is_err(), "{:?}", exclusion);
        }
        for exclusion in ["", "working", "working/tmp/"] {
            let settings = PipelineSettings {
                exclusion: exclusion.to_string(),
                ..Default::default()
            };
            assert!(settings.validate_paths().is_ok(), "{:?}", exclusion);
        }
    }

    #[test]
    fn test_validate_checks_pipeline_paths() {
        let mut config = ProvisionConfig::default();
        config.ssh.host = "nms01".to_string();
        config.ssh.username = "deploy".to_string();
        assert!(config.validate().is_ok());

        config.pipeline.remote_suffix = "/".to_string();
        assert!(config.validate().unwrap_err().contains("remote_suffix"));
    }
}

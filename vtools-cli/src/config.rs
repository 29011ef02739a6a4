//! Persisted connection settings for the `vtools` CLI.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vtools_esxi::LifecycleConfig;
use vtools_vsphere::VsphereConfig;

const MASK: &str = "********";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no config at {0}, run `vtools config set` first")]
    Missing(PathBuf),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot determine the user config directory, pass --config")]
    NoConfigDir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub connection: VsphereConfig,
    #[serde(default)]
    pub lifecycle: LifecycleSettings,
}

/// Confirmation tuning, stored in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleSettings {
    pub confirm_attempts: u32,
    pub confirm_interval_ms: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        let defaults = LifecycleConfig::default();
        Self {
            confirm_attempts: defaults.confirm_attempts,
            confirm_interval_ms: defaults.confirm_interval.as_millis() as u64,
        }
    }
}

/// `~/.config/vtools/config.json` (platform equivalent).
pub fn default_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("vtools").join("config.json"))
        .ok_or(ConfigError::NoConfigDir)
}

impl Config {
    pub fn new(connection: VsphereConfig) -> Self {
        Self {
            connection,
            lifecycle: LifecycleSettings::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigError::Missing(path.to_path_buf()));
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path`, or `None` when nothing has been saved there yet.
    pub fn load_optional(path: &Path) -> Result<Option<Self>, ConfigError> {
        match Self::load(path) {
            Ok(config) => Ok(Some(config)),
            Err(ConfigError::Missing(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write the config as JSON, readable by the owner only.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(write_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(write_err)?;
        }
        Ok(())
    }

    /// Copy safe to print.
    pub fn masked(&self) -> Self {
        let mut masked = self.clone();
        if !masked.connection.password.is_empty() {
            masked.connection.password = MASK.to_string();
        }
        masked
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            confirm_attempts: self.lifecycle.confirm_attempts,
            confirm_interval: Duration::from_millis(self.lifecycle.confirm_interval_ms),
            ..LifecycleConfig::default()
        }
    }
}

// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use storage_partitions::{DEFAULT_PROBE_WORKERS, DEFAULT_REFRESH_DEBOUNCE, ManagerConfig};
use storage_sys::DEFAULT_MOUNT_TABLE;
use storage_udisks::DEFAULT_WAITER_TIMEOUT;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/storage-partitiond.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_directive(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Contents of the daemon's TOML file. Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub root_mount: String,
    /// Empty disables the separate home partition
    pub home_mount: String,
    pub refresh_debounce_ms: u64,
    pub waiter_timeout_ms: u64,
    pub probe_workers: usize,
    pub mount_table: PathBuf,
    pub excluded_device_prefixes: Vec<String>,
    pub log_level: LogLevel,
    pub log_to_disk: bool,
    /// Defaults to the XDG state directory
    pub log_dir: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            root_mount: "/".to_string(),
            home_mount: "/home".to_string(),
            refresh_debounce_ms: DEFAULT_REFRESH_DEBOUNCE.as_millis() as u64,
            waiter_timeout_ms: DEFAULT_WAITER_TIMEOUT.as_millis() as u64,
            probe_workers: DEFAULT_PROBE_WORKERS,
            mount_table: PathBuf::from(DEFAULT_MOUNT_TABLE),
            excluded_device_prefixes: Vec::new(),
            log_level: LogLevel::Info,
            log_to_disk: false,
            log_dir: None,
        }
    }
}

impl ServiceConfig {
    /// Load `path`. A missing file is only an error when it was asked for
    /// explicitly.
    pub fn load(path: &Path, explicit: bool) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn manager_config(&self) -> ManagerConfig {
        let home_mount = self.home_mount.trim();
        ManagerConfig {
            root_mount: self.root_mount.clone(),
            home_mount: (!home_mount.is_empty()).then(|| home_mount.to_string()),
            refresh_debounce: Duration::from_millis(self.refresh_debounce_ms),
            waiter_timeout: Duration::from_millis(self.waiter_timeout_ms),
            probe_workers: self.probe_workers.max(1),
            excluded_device_prefixes: self.excluded_device_prefixes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_the_manager() {
        assert_eq!(
            ServiceConfig::default().manager_config(),
            ManagerConfig::default()
        );
    }

    #[test]
    fn missing_default_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        assert_eq!(
            ServiceConfig::load(&path, false).unwrap(),
            ServiceConfig::default()
        );
        assert!(matches!(
            ServiceConfig::load(&path, true),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "home_mount = \"\"\nwaiter_timeout_ms = 500\nexcluded_device_prefixes = [\"/dev/loop\"]\nlog_level = \"debug\""
        )
        .unwrap();

        let config = ServiceConfig::load(file.path(), true).unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.root_mount, "/");

        let manager = config.manager_config();
        assert_eq!(manager.home_mount, None);
        assert_eq!(manager.waiter_timeout, Duration::from_millis(500));
        assert_eq!(manager.excluded_device_prefixes, vec!["/dev/loop".to_string()]);
        assert_eq!(manager.refresh_debounce, DEFAULT_REFRESH_DEBOUNCE);
    }

    #[test]
    fn malformed_file_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "probe_workers = \"many\"").unwrap();

        assert!(matches!(
            ServiceConfig::load(file.path(), true),
            Err(ConfigError::Parse { .. })
        ));
    }
}

//! SessionConfig - セッション設定
//!
//! Loaded from JSON; every field has a default, so a config file only
//! needs to name what it changes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Parameters of one VM session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// VM name as known to the hypervisor.
    pub name: String,
    pub memory_mb: u32,
    pub cpus: u32,
    /// Boot disk image. When set, it is used instead of `iso_url`.
    pub disk_url: Option<String>,
    /// Boot ISO image.
    pub iso_url: Option<String>,
    /// Where downloaded media are stored.
    pub cache_dir: PathBuf,
    /// Hex SHA-256 the boot medium must match.
    pub media_sha256: Option<String>,
    /// Errors closer together than this count towards `heal_tries`.
    pub heal_threshold_secs: u64,
    /// More errors than this inside the window give up (Fatal).
    pub heal_tries: u32,
    /// Retry policy of hypervisor commands.
    pub exec_retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "vmsession".to_string(),
            memory_mb: 1024,
            cpus: 2,
            disk_url: None,
            iso_url: None,
            cache_dir: std::env::temp_dir().join("vmsession-cache"),
            media_sha256: None,
            heal_threshold_secs: 60,
            heal_tries: 2,
            exec_retry: RetryPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn heal_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heal_threshold_secs as i64)
    }

    /// URL of the boot medium to fetch, disk image first.
    pub fn boot_media_url(&self) -> Option<&str> {
        self.disk_url.as_deref().or(self.iso_url.as_deref())
    }
}

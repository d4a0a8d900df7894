//! Persisted application settings.
//!
//! A single YAML record holding the OBS connection defaults, the master's
//! default listen port, and the slave's default master endpoint. Stored at
//! the per-user config path; absent file means defaults.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, SyncError};
use crate::protocol::DEFAULT_SYNC_PORT;

/// Root settings record.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AppSettings {
    #[serde(default)]
    pub obs: ObsSettings,
    #[serde(default)]
    pub master: MasterSettings,
    #[serde(default)]
    pub slave: SlaveSettings,
}

/// OBS WebSocket connection defaults.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ObsSettings {
    #[serde(default = "default_obs_host")]
    pub host: String,
    #[serde(default = "default_obs_port")]
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Master role defaults.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MasterSettings {
    #[serde(default = "default_sync_port")]
    pub listen_port: u16,
}

/// Slave role defaults.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SlaveSettings {
    #[serde(default = "default_master_host")]
    pub master_host: String,
    #[serde(default = "default_sync_port")]
    pub master_port: u16,
}

fn default_obs_host() -> String {
    "localhost".to_string()
}

fn default_obs_port() -> u16 {
    4455
}

fn default_sync_port() -> u16 {
    DEFAULT_SYNC_PORT
}

fn default_master_host() -> String {
    "localhost".to_string()
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            obs: ObsSettings::default(),
            master: MasterSettings::default(),
            slave: SlaveSettings::default(),
        }
    }
}

impl Default for ObsSettings {
    fn default() -> Self {
        Self {
            host: default_obs_host(),
            port: default_obs_port(),
            password: None,
        }
    }
}

impl Default for MasterSettings {
    fn default() -> Self {
        Self {
            listen_port: default_sync_port(),
        }
    }
}

impl Default for SlaveSettings {
    fn default() -> Self {
        Self {
            master_host: default_master_host(),
            master_port: default_sync_port(),
        }
    }
}

impl AppSettings {
    /// Load settings from `path`, falling back to defaults when the file
    /// does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw)
            .map_err(|e| SyncError::Settings(format!("{}: {}", path.display(), e)))
    }

    /// Persist settings to `path`, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_yaml::to_string(self)
            .map_err(|e| SyncError::Settings(e.to_string()))?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Load from the default per-user location.
    pub fn load_default() -> anyhow::Result<Self> {
        let path = crate::paths::settings_file();
        Self::load(&path).with_context(|| format!("loading {}", path.display()))
    }
}

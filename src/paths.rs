//! Application path resolution.
//!
//! Resolves the per-user settings file, the log directory, and the shared
//! image staging directory under the system temp dir. The staging directory
//! is created lazily on first use and is deliberately shared between runs:
//! staged images are keyed by source name and overwritten on update, so no
//! cleanup between runs is needed.

use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Application name used for per-user directories.
const APP_NAME: &str = "obs-sync";

/// Subdirectory of the system temp dir where image payloads are staged.
const STAGING_SUBDIR: &str = "obs-sync";

static STAGING_DIR: Lazy<PathBuf> = Lazy::new(|| {
    let dir = std::env::temp_dir().join(STAGING_SUBDIR);
    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!("Failed to create image staging dir {}: {}", dir.display(), e);
    }
    dir
});

/// Per-user configuration directory (`~/.config/obs-sync` or equivalent).
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Path of the persisted settings record.
pub fn settings_file() -> PathBuf {
    config_dir().join("settings.yaml")
}

/// Directory for rotated log files.
pub fn logs_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
        .join("logs")
}

/// Shared image staging directory, created on first access.
pub fn staging_dir() -> &'static Path {
    &STAGING_DIR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_dir_is_under_temp() {
        assert!(staging_dir().starts_with(std::env::temp_dir()));
        assert!(staging_dir().ends_with(STAGING_SUBDIR));
    }

    #[test]
    fn settings_file_lives_in_config_dir() {
        assert!(settings_file().starts_with(config_dir()));
    }
}

//! Config file discovery and loading.

use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};
use crate::types::WorkerConfig;

/// Application name for the config directory.
const APP_NAME: &str = "taskbox";

/// Config file name inside the config directory.
const CONFIG_FILE: &str = "config.toml";

/// Environment variable to override the config directory.
const CONFIG_DIR_ENV: &str = "TASKBOX_CONFIG_DIR";

/// Get the config directory for taskbox.
///
/// Checks `TASKBOX_CONFIG_DIR` first, then falls back to the platform default
/// (`~/.config/taskbox` on Linux).
pub fn config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

/// Path of the default config file.
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join(CONFIG_FILE))
}

/// Load config from a specific file path.
pub fn load_config_file(path: &Path) -> Result<WorkerConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    WorkerConfig::from_toml(&contents)
}

/// Load config from `path` if given, else from the default location.
///
/// A missing default file is not an error; defaults are used instead. An
/// explicitly requested file must exist.
pub fn load_config(path: Option<&Path>) -> Result<WorkerConfig> {
    if let Some(path) = path {
        return load_config_file(path);
    }
    match default_config_path() {
        Some(path) if path.is_file() => load_config_file(&path),
        _ => Ok(WorkerConfig::default()),
    }
}

//! Configuration errors.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Why a worker configuration could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// A setting is present but unusable; `field` is its dotted TOML path.
    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

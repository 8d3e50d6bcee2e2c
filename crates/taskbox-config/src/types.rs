//! Configuration types mapping to the TOML schema.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Temporary storage for task working folders.
    pub storage: StorageConfig,

    /// Native process engine.
    pub native: NativeSection,

    /// QEMU virtual machine engine.
    pub qemu: QemuSection,

    /// Worker log output.
    pub logging: LoggingConfig,
}

impl WorkerConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that deserialize fine but cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.qemu.binary.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "qemu.binary",
                reason: "must not be empty".to_string(),
            });
        }
        if self.qemu.socket_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "qemu.socket_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.qemu.memory_mb < 64 {
            return Err(ConfigError::Invalid {
                field: "qemu.memory_mb",
                reason: format!("{} MiB is too little to boot a guest", self.qemu.memory_mb),
            });
        }
        for group in &self.native.groups {
            if group.is_empty() || group.contains(char::is_whitespace) {
                return Err(ConfigError::Invalid {
                    field: "native.groups",
                    reason: format!("'{}' is not a valid group name", group),
                });
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// Temporary storage configuration (`[storage]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory under which per-task folders are allocated.
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("taskbox"),
        }
    }
}

/// Native engine configuration (`[native]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeSection {
    /// Run every task as a freshly created, throwaway OS user.
    pub create_user: bool,

    /// Supplementary groups for created users.
    pub groups: Vec<String>,
}

/// QEMU engine configuration (`[qemu]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QemuSection {
    /// QEMU system emulator to execute.
    pub binary: String,

    /// Directory under which each VM gets a private socket folder.
    pub socket_folder: PathBuf,

    /// Seconds to wait for the VNC and QMP sockets to appear.
    pub socket_timeout_secs: u64,

    /// Guest memory in MiB.
    pub memory_mb: u32,

    /// Use KVM acceleration.
    pub kvm: bool,
}

impl QemuSection {
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }
}

impl Default for QemuSection {
    fn default() -> Self {
        Self {
            binary: "qemu-system-x86_64".to_string(),
            socket_folder: std::env::temp_dir().join("taskbox-qemu"),
            socket_timeout_secs: 90,
            memory_mb: 512,
            kvm: true,
        }
    }
}

/// Log output configuration (`[logging]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for the rolling JSON log; defaults to `<config dir>/logs`.
    pub directory: Option<PathBuf>,
}

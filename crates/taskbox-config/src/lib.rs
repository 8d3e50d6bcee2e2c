//! Configuration for the taskbox worker.
//!
//! A single TOML file configures temporary storage, the native process
//! engine, the QEMU engine and log output. Every section is optional and
//! falls back to defaults suitable for a development machine:
//!
//! ```toml
//! [storage]
//! root = "/var/lib/taskbox/tmp"
//!
//! [native]
//! create_user = true
//! groups = ["audio"]
//!
//! [qemu]
//! binary = "qemu-system-x86_64"
//! socket_folder = "/run/taskbox/qemu"
//! socket_timeout_secs = 90
//! memory_mb = 512
//! kvm = true
//!
//! [logging]
//! directory = "/var/log/taskbox"
//! ```

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{config_dir, default_config_path, load_config, load_config_file};
pub use error::{ConfigError, Result};
pub use types::*;

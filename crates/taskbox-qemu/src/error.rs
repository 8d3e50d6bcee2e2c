//! Virtual machine errors.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Why a virtual machine stopped, or failed to start.
///
/// A machine records at most one of these: the first failure wins, since
/// later ones are usually fallout from it.
#[derive(Debug, Error)]
pub enum VmError {
    /// The control sockets did not appear in time.
    #[error("vnc and qmp sockets didn't show up in {}s", .0.as_secs_f64())]
    SocketTimeout(Duration),

    /// Monitoring the socket folder failed.
    #[error("Error monitoring socket folder: {0}")]
    Watch(String),

    /// The socket folder could not be created.
    #[error("Failed to create socket folder: {0}")]
    SocketFolder(#[source] io::Error),

    /// QEMU could not be started.
    #[error("Failed to start QEMU: {0}")]
    Spawn(#[source] io::Error),

    /// QEMU exited unsuccessfully.
    #[error("QEMU exited: {0}")]
    Exited(String),

    /// Waiting for QEMU failed.
    #[error("Failed to wait for QEMU: {0}")]
    Wait(#[source] io::Error),
}

impl VmError {
    /// Whether the machine never got as far as running QEMU.
    pub fn is_startup_failure(&self) -> bool {
        matches!(self, Self::SocketFolder(_) | Self::Spawn(_) | Self::Watch(_))
    }
}

/// Result type alias for virtual machine operations.
pub type VmResult<T> = std::result::Result<T, VmError>;

//! QEMU engine configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default time allowed for the control sockets to appear.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(90);

/// Configuration for virtual machines.
#[derive(Debug, Clone)]
pub struct QemuConfig {
    /// QEMU system emulator to run.
    pub binary: PathBuf,

    /// Folder under which each machine gets a private socket folder.
    pub socket_folder: PathBuf,

    /// How long to wait for the VNC and QMP sockets after spawning.
    pub socket_timeout: Duration,

    /// Guest memory in MiB.
    pub memory_mb: u32,

    /// Use KVM acceleration; falls back to TCG emulation when off.
    pub kvm: bool,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("qemu-system-x86_64"),
            socket_folder: std::env::temp_dir().join("taskbox-qemu"),
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            memory_mb: 512,
            kvm: true,
        }
    }
}

impl QemuConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_socket_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.socket_folder = folder.into();
        self
    }

    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u32) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_kvm(mut self, kvm: bool) -> Self {
        self.kvm = kvm;
        self
    }
}

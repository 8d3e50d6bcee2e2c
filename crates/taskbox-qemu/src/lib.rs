//! QEMU engine: tasks running inside virtual machines.
//!
//! A [`VirtualMachine`] wraps one QEMU process. It is configured with an
//! [`Image`] to boot and a [`Network`] to attach to, both of which it owns
//! and releases when QEMU exits. Each machine gets a private folder holding
//! its VNC and QMP control sockets; [`VirtualMachine::start`] returns once
//! both exist.
//!
//! ```no_run
//! use taskbox_qemu::{LocalImage, Machine, QemuConfig, UserNetwork, VirtualMachine};
//! use taskbox_types::Monitor;
//!
//! # async fn run(machine: Machine) {
//! let image = LocalImage::new("/images/ubuntu.qcow2", "qcow2", machine);
//! let vm = VirtualMachine::new(
//!     &QemuConfig::default(),
//!     Box::new(image),
//!     Box::new(UserNetwork::new()),
//!     [None, None],
//!     Monitor::new("qemu"),
//! );
//! vm.start().await;
//! println!("VNC at {:?}", vm.vnc_socket());
//! if let Some(error) = vm.wait().await {
//!     eprintln!("machine failed: {}", error);
//! }
//! # }
//! ```

mod arguments;
mod config;
mod error;
mod image;
mod network;
mod readiness;
mod vm;

pub use config::{DEFAULT_SOCKET_TIMEOUT, QemuConfig};
pub use error::{VmError, VmResult};
pub use image::{Image, Keyboard, LocalImage, Machine, NetworkDevice, Sound};
pub use network::{Network, UserNetwork};
pub use vm::VirtualMachine;

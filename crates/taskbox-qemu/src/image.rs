//! Disk images and the machine definitions that travel with them.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Hardware definition of a virtual machine.
///
/// Stored as JSON next to the disk image:
///
/// ```json
/// {
///   "uuid": "52f6b0b8-3c6f-4b55-9f55-31d2f6e2d5c1",
///   "keyboard": { "layout": "en-us" },
///   "network": { "device": "e1000", "mac": "aa:54:1a:30:4c:a1" },
///   "sound": { "device": "hda-duplex", "controller": "ich9-intel-hda" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub uuid: String,
    pub keyboard: Keyboard,
    pub network: NetworkDevice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<Sound>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyboard {
    pub layout: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDevice {
    /// QEMU device model, e.g. `e1000` or `virtio-net-pci`.
    pub device: String,
    pub mac: String,
}

/// Sound hardware.
///
/// A `controller` of `"pci"` means `device` is itself a PCI sound card;
/// otherwise `controller` is the PCI controller and `device` its codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sound {
    pub device: String,
    pub controller: String,
}

impl Machine {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// A disk image a virtual machine boots from.
///
/// The machine consumes the image and calls [`Image::release`] once QEMU has
/// exited.
pub trait Image: Send + Sync {
    /// Path of the disk file handed to QEMU.
    fn disk_file(&self) -> &Path;

    /// On-disk format, e.g. `qcow2` or `raw`.
    fn format(&self) -> &str;

    fn machine(&self) -> &Machine;

    /// Give the image back; it must not be used afterwards.
    fn release(self: Box<Self>);
}

/// An image file on local disk.
#[derive(Debug, Clone)]
pub struct LocalImage {
    disk_file: PathBuf,
    format: String,
    machine: Machine,
    delete_on_release: bool,
}

impl LocalImage {
    pub fn new(disk_file: impl Into<PathBuf>, format: impl Into<String>, machine: Machine) -> Self {
        Self {
            disk_file: disk_file.into(),
            format: format.into(),
            machine,
            delete_on_release: false,
        }
    }

    /// Delete the disk file on release, for per-task copies of an image.
    pub fn with_delete_on_release(mut self, delete: bool) -> Self {
        self.delete_on_release = delete;
        self
    }
}

impl Image for LocalImage {
    fn disk_file(&self) -> &Path {
        &self.disk_file
    }

    fn format(&self) -> &str {
        &self.format
    }

    fn machine(&self) -> &Machine {
        &self.machine
    }

    fn release(self: Box<Self>) {
        if !self.delete_on_release {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.disk_file) {
            tracing::warn!(file = %self.disk_file.display(), error = %e, "failed to delete image");
        }
    }
}

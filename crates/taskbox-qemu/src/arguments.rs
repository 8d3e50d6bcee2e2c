//! QEMU command line for a task machine.
//!
//! Device placement is fixed so guests see the same hardware on every boot:
//!
//! | PCI slot | Device |
//! |----------|--------|
//! | 0x2 | video |
//! | 0x3 | USB controller (keyboard on port 1, mouse on port 2) |
//! | 0x4 | memory balloon |
//! | 0x5 | network interface |
//! | 0x6 | sound (optional) |
//! | 0x7 | reserved |
//! | 0x8 | boot disk |
//!
//! Up to two read-only CD-ROMs hang off the IDE bus after the boot disk.

use std::path::Path;

use crate::image::Machine;

pub(crate) const VNC_SOCKET: &str = "vnc.sock";
pub(crate) const QMP_SOCKET: &str = "qmp.sock";

const NETDEV_ID: &str = "netdev-0";

/// Inputs to [`arguments`].
pub(crate) struct Layout<'a> {
    pub machine: &'a Machine,
    pub disk_file: &'a Path,
    pub disk_format: &'a str,
    /// Value for `-netdev`.
    pub netdev: String,
    pub socket_folder: &'a Path,
    pub memory_mb: u32,
    pub kvm: bool,
    pub cdroms: [Option<&'a Path>; 2],
}

/// Render `kind,key=value,...`; an empty `kind` yields just the options.
fn opts(kind: &str, options: &[(&str, &str)]) -> String {
    let mut out = kind.to_string();
    for (key, value) in options {
        if !out.is_empty() {
            out.push(',');
        }
        out.push_str(key);
        out.push('=');
        out.push_str(value);
    }
    out
}

/// Returns the netdev id handed to [`crate::Network::net_dev`].
pub(crate) fn netdev_id() -> &'static str {
    NETDEV_ID
}

pub(crate) fn arguments(layout: &Layout<'_>) -> Vec<String> {
    let machine = layout.machine;
    let vnc_socket = layout.socket_folder.join(VNC_SOCKET);
    let qmp_socket = layout.socket_folder.join(QMP_SOCKET);
    let disk_file = layout.disk_file.display().to_string();
    let memory = layout.memory_mb.to_string();

    let mut args: Vec<String> = Vec::with_capacity(64);
    let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

    push(&["-name", "qemu-guest"]);
    push(&[
        "-machine",
        &opts("pc-i440fx-2.1", &[("accel", if layout.kvm { "kvm" } else { "tcg" })]),
    ]);
    push(&["-m", &memory]);
    push(&["-realtime", "mlock=off"]);
    push(&["-smp", "cpus=2,sockets=2,cores=1,threads=1"]);
    push(&["-uuid", &machine.uuid]);
    push(&["-no-user-config", "-nodefaults"]);
    push(&["-rtc", "base=utc"]);
    push(&["-boot", "menu=off,strict=on"]);
    push(&["-k", &machine.keyboard.layout]);
    push(&[
        "-device",
        &opts(
            "vmware-svga",
            &[("id", "video-0"), ("vgamem_mb", "64"), ("bus", "pci.0"), ("addr", "0x2")],
        ),
    ]);
    push(&[
        "-device",
        &opts("nec-usb-xhci", &[("id", "usb"), ("bus", "pci.0"), ("addr", "0x3")]),
    ]);
    push(&[
        "-device",
        &opts(
            "virtio-balloon-pci",
            &[("id", "balloon-0"), ("bus", "pci.0"), ("addr", "0x4")],
        ),
    ]);
    push(&["-netdev", &layout.netdev]);
    push(&[
        "-device",
        &opts(
            &machine.network.device,
            &[
                ("netdev", NETDEV_ID),
                ("id", "nic0"),
                ("mac", &machine.network.mac),
                ("bus", "pci.0"),
                ("addr", "0x5"),
            ],
        ),
    ]);
    push(&[
        "-device",
        &opts("usb-kbd", &[("id", "keyboard-0"), ("bus", "usb.0"), ("port", "1")]),
    ]);
    push(&[
        "-device",
        &opts("usb-mouse", &[("id", "mouse-0"), ("bus", "usb.0"), ("port", "2")]),
    ]);
    push(&[
        "-vnc",
        &opts(
            &format!("unix:{}", vnc_socket.display()),
            &[("share", "force-shared")],
        ),
    ]);
    push(&[
        "-chardev",
        &format!("socket,id=qmpsocket,path={},nowait,server=on", qmp_socket.display()),
    ]);
    push(&["-mon", "chardev=qmpsocket,mode=control"]);
    push(&[
        "-drive",
        &opts(
            "",
            &[
                ("file", &disk_file),
                ("if", "none"),
                ("id", "boot-disk"),
                ("cache", "unsafe"),
                ("aio", "threads"),
                ("format", layout.disk_format),
                ("werror", "report"),
                ("rerror", "report"),
            ],
        ),
    ]);
    push(&[
        "-device",
        &opts(
            "virtio-blk-pci",
            &[
                ("scsi", "off"),
                ("bus", "pci.0"),
                ("addr", "0x8"),
                ("drive", "boot-disk"),
                ("id", "virtio-disk0"),
                ("bootindex", "1"),
            ],
        ),
    ]);

    if let Some(sound) = &machine.sound {
        if sound.controller == "pci" {
            push(&[
                "-device",
                &opts(&sound.device, &[("id", "sound-0"), ("bus", "pci.0"), ("addr", "0x6")]),
            ]);
        } else {
            push(&[
                "-device",
                &opts(
                    &sound.controller,
                    &[("id", "sound-0"), ("bus", "pci.0"), ("addr", "0x6")],
                ),
            ]);
            push(&[
                "-device",
                &opts(
                    &sound.device,
                    &[("id", "sound-0-codec-0"), ("bus", "sound-0.0"), ("cad", "0")],
                ),
            ]);
        }
    }

    for (index, cdrom) in layout.cdroms.iter().enumerate() {
        let Some(cdrom) = cdrom else {
            continue;
        };
        let n = index + 1;
        let file = cdrom.display().to_string();
        let id = format!("cdrom{}", n);
        let device_id = format!("ide-cd{}", n);
        let bootindex = (n + 1).to_string();
        let unit = index.to_string();
        let drive = opts(
            "",
            &[
                ("file", &file),
                ("if", "none"),
                ("id", &id),
                ("cache", "unsafe"),
                ("aio", "threads"),
                ("format", "raw"),
                ("werror", "report"),
                ("rerror", "report"),
            ],
        );
        push(&["-drive", &format!("{},readonly", drive)]);
        push(&[
            "-device",
            &opts(
                "ide-cd",
                &[
                    ("bootindex", &bootindex),
                    ("drive", &id),
                    ("id", &device_id),
                    ("bus", "ide.0"),
                    ("unit", &unit),
                ],
            ),
        ]);
    }

    args
}

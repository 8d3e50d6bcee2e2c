//! `taskbox vm`: boot an image under QEMU until it stops or is interrupted.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use taskbox_qemu::{LocalImage, Machine, QemuConfig, UserNetwork, VirtualMachine};
use taskbox_types::Monitor;

use super::Context;

/// Arguments for the vm command.
#[derive(Args, Debug)]
pub struct VmArgs {
    /// Disk image to boot
    #[arg(long)]
    pub image: PathBuf,

    /// Machine definition (JSON)
    #[arg(long)]
    pub machine: PathBuf,

    /// Disk image format
    #[arg(long, default_value = "qcow2")]
    pub format: String,

    /// ISO image to attach as a CD-ROM (at most two)
    #[arg(long)]
    pub cdrom: Vec<PathBuf>,

    /// Only allow the guest to reach the host
    #[arg(long)]
    pub restrict_network: bool,
}

/// Boot the machine and wait for it to stop.
pub async fn run(args: VmArgs, ctx: &Context) -> Result<ExitCode> {
    if args.cdrom.len() > 2 {
        bail!("at most two CD-ROM images can be attached");
    }

    let json = tokio::fs::read_to_string(&args.machine)
        .await
        .with_context(|| format!("failed to read {}", args.machine.display()))?;
    let machine = Machine::from_json(&json)
        .with_context(|| format!("invalid machine definition in {}", args.machine.display()))?;

    let qemu = &ctx.config.qemu;
    let config = QemuConfig::new()
        .with_binary(&qemu.binary)
        .with_socket_folder(&qemu.socket_folder)
        .with_socket_timeout(qemu.socket_timeout())
        .with_memory_mb(qemu.memory_mb)
        .with_kvm(qemu.kvm);

    let image = LocalImage::new(&args.image, &args.format, machine);
    let network = UserNetwork::new().with_restrict(args.restrict_network);
    let mut cdroms = [None, None];
    for (slot, path) in cdroms.iter_mut().zip(&args.cdrom) {
        *slot = Some(path.as_path());
    }

    let vm = VirtualMachine::new(
        &config,
        Box::new(image),
        Box::new(network),
        cdroms,
        Monitor::new("qemu"),
    );
    if ctx.verbose {
        tracing::debug!(binary = %qemu.binary, arguments = ?vm.arguments(), "Starting QEMU");
    }

    vm.start().await;
    if let Some(vnc) = vm.vnc_socket() {
        println!("VNC socket: {}", vnc.display());
    }

    let error = tokio::select! {
        error = vm.wait() => error,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted, stopping virtual machine");
            vm.kill();
            // Killed on request; the exit status is expected.
            vm.wait().await;
            return Ok(ExitCode::SUCCESS);
        }
    };

    match error {
        None => Ok(ExitCode::SUCCESS),
        Some(e) => bail!("virtual machine failed: {}", e),
    }
}

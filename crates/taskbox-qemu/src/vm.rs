//! The virtual machine supervisor.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use parking_lot::Mutex;
use taskbox_types::Monitor;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::arguments::{self, Layout, QMP_SOCKET, VNC_SOCKET};
use crate::config::QemuConfig;
use crate::error::VmError;
use crate::image::Image;
use crate::network::Network;
use crate::readiness::{Readiness, SocketWatch};

/// Time given to the output forwarders to flush once QEMU has exited.
const FORWARDER_GRACE: Duration = Duration::from_secs(1);

/// A QEMU process together with the image, network and socket folder it
/// uses.
///
/// The machine owns its image and network and releases both once QEMU has
/// exited, together with its private socket folder. Only then does the done
/// signal fire, so anyone woken by [`VirtualMachine::wait`] sees a machine
/// that is completely torn down.
pub struct VirtualMachine {
    binary: PathBuf,
    arguments: Vec<String>,
    socket_timeout: Duration,
    started: AtomicBool,
    shared: Arc<Shared>,
}

struct Shared {
    monitor: Monitor,
    state: Mutex<Resources>,
    done: watch::Sender<bool>,
    kill: Notify,
}

struct Resources {
    image: Option<Box<dyn Image>>,
    network: Option<Box<dyn Network>>,
    /// `None` once removed.
    socket_folder: Option<PathBuf>,
    error: Option<Arc<VmError>>,
}

impl Resources {
    /// Keep the first error; later ones are usually fallout from it.
    fn record(&mut self, error: VmError) {
        if self.error.is_none() {
            self.error = Some(Arc::new(error));
        }
    }
}

impl VirtualMachine {
    /// Configure a machine. Nothing runs until [`VirtualMachine::start`].
    pub fn new(
        config: &QemuConfig,
        image: Box<dyn Image>,
        network: Box<dyn Network>,
        cdroms: [Option<&Path>; 2],
        monitor: Monitor,
    ) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        let socket_folder = config.socket_folder.join(&id);
        let monitor = monitor.with_tag("vm", id);

        let arguments = arguments::arguments(&Layout {
            machine: image.machine(),
            disk_file: image.disk_file(),
            disk_format: image.format(),
            netdev: network.net_dev(arguments::netdev_id()),
            socket_folder: &socket_folder,
            memory_mb: config.memory_mb,
            kvm: config.kvm,
            cdroms,
        });

        Self {
            binary: config.binary.clone(),
            arguments,
            socket_timeout: config.socket_timeout,
            started: AtomicBool::new(false),
            shared: Arc::new(Shared {
                monitor,
                state: Mutex::new(Resources {
                    image: Some(image),
                    network: Some(network),
                    socket_folder: Some(socket_folder),
                    error: None,
                }),
                done: watch::Sender::new(false),
                kill: Notify::new(),
            }),
        }
    }

    /// QEMU command line, without the binary.
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    /// Start QEMU and wait until it is ready or has stopped.
    ///
    /// Returns once both control sockets exist, or once the machine is done
    /// (check [`VirtualMachine::error`]). If the sockets do not show up in
    /// time the machine is killed.
    ///
    /// # Panics
    ///
    /// If called more than once.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            panic!("virtual machine has already been started once");
        }
        let monitor = &self.shared.monitor;

        let Some(folder) = self.shared.state.lock().socket_folder.clone() else {
            return;
        };
        if let Err(e) = tokio::fs::create_dir_all(&folder).await {
            self.shared.fail_before_spawn(VmError::SocketFolder(e));
            return;
        }

        // Arm before spawning, or QEMU could create the sockets unseen.
        let sockets = match SocketWatch::arm(&folder) {
            Ok(sockets) => sockets,
            Err(e) => {
                monitor.error(format!("Error configuring socket folder monitoring: {}", e));
                self.shared.fail_before_spawn(e);
                return;
            }
        };

        let mut child = match Command::new(&self.binary)
            .args(&self.arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                monitor.error(format!("Failed to start QEMU: {}", e));
                self.shared.fail_before_spawn(VmError::Spawn(e));
                return;
            }
        };
        monitor.info(format!("Started QEMU (pid {:?})", child.id()));

        let mut forwarders = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(forward_lines(stdout, monitor.clone(), false));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(forward_lines(stderr, monitor.clone(), true));
        }
        tokio::spawn(watch_exit(self.shared.clone(), child, forwarders));

        match sockets
            .ready(self.socket_timeout, self.shared.done.subscribe())
            .await
        {
            Ok(Readiness::Ready) => monitor.debug("QEMU control sockets are ready"),
            Ok(Readiness::Stopped) => {}
            Err(e) => {
                monitor.error(format!("Error monitoring socket folder: {}", e));
                self.shared.state.lock().record(e);
                self.kill();
            }
        }
    }

    /// Kill QEMU; teardown happens as for a normal exit. Does not wait.
    pub fn kill(&self) {
        if self.is_done() {
            return;
        }
        self.shared.kill.notify_one();
    }

    /// Install the metadata service handler, unless the network is already
    /// released.
    pub fn set_http_handler(&self, handler: Router) {
        if let Some(network) = &self.shared.state.lock().network {
            network.set_handler(handler);
        }
    }

    /// Path of the VNC socket; `None` once the machine is torn down.
    pub fn vnc_socket(&self) -> Option<PathBuf> {
        self.socket(VNC_SOCKET)
    }

    /// Path of the QMP socket; `None` once the machine is torn down.
    pub fn qmp_socket(&self) -> Option<PathBuf> {
        self.socket(QMP_SOCKET)
    }

    fn socket(&self, name: &str) -> Option<PathBuf> {
        self.shared
            .state
            .lock()
            .socket_folder
            .as_ref()
            .map(|folder| folder.join(name))
    }

    /// Wait for the machine to be done and torn down; returns its error.
    pub async fn wait(&self) -> Option<Arc<VmError>> {
        let mut done = self.shared.done.subscribe();
        let _ = done.wait_for(|done| *done).await;
        self.shared.state.lock().error.clone()
    }

    /// The error the machine stopped with. Always `None` until done.
    pub fn error(&self) -> Option<Arc<VmError>> {
        if !self.is_done() {
            return None;
        }
        self.shared.state.lock().error.clone()
    }

    pub fn is_done(&self) -> bool {
        *self.shared.done.borrow()
    }

    /// A receiver that turns `true` once the machine is done.
    pub fn done_signal(&self) -> watch::Receiver<bool> {
        self.shared.done.subscribe()
    }
}

impl std::fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("binary", &self.binary)
            .field("started", &self.started.load(Ordering::Acquire))
            .field("done", &self.is_done())
            .finish()
    }
}

impl Shared {
    /// Release everything and report done, for failures before QEMU ran.
    fn fail_before_spawn(&self, error: VmError) {
        {
            let mut state = self.state.lock();
            state.record(error);
            self.release(&mut state);
        }
        self.close_done();
    }

    fn release(&self, state: &mut Resources) {
        if let Some(network) = state.network.take() {
            network.release();
        }
        if let Some(image) = state.image.take() {
            image.release();
        }
        if let Some(folder) = state.socket_folder.take() {
            match std::fs::remove_dir_all(&folder) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => self
                    .monitor
                    .error(format!("Failed to remove socket folder {}: {}", folder.display(), e)),
            }
        }
    }

    fn close_done(&self) {
        let closed = self.done.send_if_modified(|done| !std::mem::replace(done, true));
        debug_assert!(closed, "done signal closed twice");
    }
}

fn forward_lines<R>(reader: R, monitor: Monitor, is_stderr: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if is_stderr => monitor.error(format!("QEMU: {}", line)),
                Ok(Some(line)) => monitor.info(format!("QEMU: {}", line)),
                Ok(None) => break,
                Err(e) => {
                    monitor.error(format!("Error reading QEMU output: {}", e));
                    break;
                }
            }
        }
    })
}

async fn watch_exit(shared: Arc<Shared>, mut child: Child, forwarders: Vec<JoinHandle<()>>) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = shared.kill.notified() => {
                shared.monitor.info("Killing QEMU");
                let _ = child.start_kill();
            }
        }
    };
    let error = match status {
        Ok(status) if status.success() => None,
        Ok(status) => Some(VmError::Exited(status.to_string())),
        Err(e) => Some(VmError::Wait(e)),
    };

    let mut forwarders = forwarders;
    for forwarder in &mut forwarders {
        let _ = tokio::time::timeout(FORWARDER_GRACE, forwarder).await;
    }

    {
        let mut state = shared.state.lock();
        if let Some(error) = error {
            state.record(error);
        }
        for forwarder in &forwarders {
            forwarder.abort();
        }
        shared.release(&mut state);
    }
    shared.monitor.info("QEMU stopped");
    // Last, so waiters never observe a half released machine.
    shared.close_done();
}

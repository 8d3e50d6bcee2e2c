//! Supervised OS processes.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use taskbox_types::{SharedLogSink, drain_into};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, watch};

use super::user::User;

/// Time output forwarders get to drain after a kill before they are
/// detached. Descendants that left the process group can hold the pipes
/// open indefinitely.
const OUTPUT_GRACE: Duration = Duration::from_secs(1);

/// Options for [`Process::start`].
pub struct ProcessOptions<'a> {
    /// Program followed by its arguments.
    pub arguments: &'a [String],
    /// Complete environment of the process.
    pub environment: &'a HashMap<String, String>,
    pub working_folder: &'a Path,
    /// Account to run as; `None` runs as the worker's own user.
    pub owner: Option<&'a User>,
    /// Destination of standard output and standard error.
    pub stdout: SharedLogSink,
}

/// A process running in its own process group.
///
/// A background task owns the child: it forwards output to the log sink,
/// reaps the child and then waits for the output pipes to close, which
/// happens once every process holding them (the whole tree, usually) has
/// exited. [`Process::wait`] resolves after both; after
/// [`Process::kill_tree`] it waits at most a short grace period for the
/// pipes.
#[derive(Debug)]
pub struct Process {
    pid: u32,
    exit: watch::Receiver<Option<bool>>,
    kill: Arc<Notify>,
}

impl Process {
    /// Spawn a process. Must be called from within a tokio runtime.
    pub fn start(options: ProcessOptions<'_>) -> io::Result<Self> {
        let (program, args) = options
            .arguments
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(options.environment)
            .current_dir(options.working_folder)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(owner) = options.owner {
            owner.apply_to(&mut cmd)?;
        }

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("process exited before its pid was read"))?;

        let stdout = child.stdout.take().map(|out| {
            let sink = options.stdout.clone();
            tokio::spawn(async move { drain_into(out, sink.as_ref()).await })
        });
        let stderr = child.stderr.take().map(|err| {
            let sink = options.stdout.clone();
            tokio::spawn(async move { drain_into(err, sink.as_ref()).await })
        });

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = Arc::new(Notify::new());
        tokio::spawn(supervise(
            child,
            pid,
            [stdout, stderr].into_iter().flatten().collect(),
            kill.clone(),
            exit_tx,
        ));

        Ok(Self {
            pid,
            exit: exit_rx,
            kill,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait for the process (and its output) to finish.
    ///
    /// Returns whether it exited successfully.
    pub async fn wait(&self) -> bool {
        let mut rx = self.exit.clone();
        match rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => (*exit).unwrap_or(false),
            // Supervisor task is gone without reporting; treat as failure.
            Err(_) => false,
        }
    }

    /// Whether the process has finished.
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Forcefully kill the process and everything in its process group.
    ///
    /// Returns immediately; use [`Process::wait`] to observe the exit.
    pub fn kill_tree(&self) {
        self.kill.notify_one();
    }
}

type Forwarder = tokio::task::JoinHandle<io::Result<u64>>;

async fn supervise(
    mut child: Child,
    pid: u32,
    forwarders: Vec<Forwarder>,
    kill: Arc<Notify>,
    exit: watch::Sender<Option<bool>>,
) {
    let mut killed = false;
    let success = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(status) => {
                        tracing::debug!(pid, %status, "process exited");
                        status.success()
                    }
                    Err(e) => {
                        tracing::error!(pid, error = %e, "failed to wait for process");
                        false
                    }
                };
            }
            _ = kill.notified() => {
                killed = true;
                kill_group(pid);
                let _ = child.start_kill();
            }
        }
    };

    for mut forwarder in forwarders {
        let res = loop {
            if killed {
                match tokio::time::timeout(OUTPUT_GRACE, &mut forwarder).await {
                    Ok(res) => break Some(res),
                    Err(_) => {
                        tracing::warn!(pid, "output still open after kill, detaching forwarder");
                        forwarder.abort();
                        break None;
                    }
                }
            }
            tokio::select! {
                res = &mut forwarder => break Some(res),
                // Descendants may hold the pipes open; a kill takes them down too.
                _ = kill.notified() => {
                    killed = true;
                    kill_group(pid);
                }
            }
        };
        match res {
            Some(Ok(Err(e))) => tracing::warn!(pid, error = %e, "failed to forward process output"),
            Some(Err(e)) => tracing::warn!(pid, error = %e, "output forwarder panicked"),
            Some(Ok(Ok(_))) | None => {}
        }
    }

    exit.send_replace(Some(success));
}

/// Send SIGKILL to the process group led by `pid`.
pub fn kill_group(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match signal::killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, error = %e, "failed to kill process group"),
    }
}

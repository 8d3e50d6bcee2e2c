//! Interactive shells attached to a running sandbox.
//!
//! A shell runs one extra command as the sandbox user, next to the primary
//! process. Without a terminal the command gets plain pipes; with one it runs
//! on a pseudo-terminal and standard error is merged into standard output.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, NativePtySystem, PtySize, PtySystem};
use taskbox_types::{EngineError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, watch};
use uuid::Uuid;

use crate::system::{User, kill_group};

/// Read end of a shell's output.
pub type ShellReader = Pin<Box<dyn AsyncRead + Send>>;

/// Write end of a shell's input.
pub type ShellWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Command started when a shell is requested without one.
const DEFAULT_COMMAND: &str = "sh";

/// Buffer between the pseudo-terminal threads and async readers/writers.
const PTY_BUFFER: usize = 64 * 1024;

const DEFAULT_SIZE: PtySize = PtySize {
    rows: 24,
    cols: 80,
    pixel_width: 0,
    pixel_height: 0,
};

/// How a shell ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellExit {
    /// The command exited on its own; `true` on success.
    Exited(bool),
    /// The shell was aborted.
    Aborted,
}

pub(crate) struct ShellOptions<'a> {
    pub command: &'a [String],
    pub tty: bool,
    pub environment: &'a HashMap<String, String>,
    pub working_folder: &'a Path,
    pub owner: &'a User,
}

// ─────────────────────────────────────────────────────────────────────────────
// Shell handle
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to an interactive shell. Clones refer to the same shell.
#[derive(Clone)]
pub struct Shell {
    inner: Arc<ShellInner>,
}

struct ShellInner {
    id: Uuid,
    command: Vec<String>,
    tty: bool,
    stdin: Mutex<Option<ShellWriter>>,
    stdout: Mutex<Option<ShellReader>>,
    stderr: Mutex<Option<ShellReader>>,
    master: Option<Mutex<Box<dyn MasterPty + Send>>>,
    exit: watch::Receiver<Option<ShellExit>>,
    abort: Arc<Notify>,
    aborted: Arc<AtomicBool>,
}

/// Shared by both backends: how to stop the command and report its end.
struct Control {
    exit: watch::Sender<Option<ShellExit>>,
    abort: Arc<Notify>,
    aborted: Arc<AtomicBool>,
    on_done: Box<dyn FnOnce(Uuid, ShellExit) + Send>,
    id: Uuid,
}

impl Control {
    fn finish(self, success: bool) {
        let exit = if self.aborted.load(Ordering::Acquire) {
            ShellExit::Aborted
        } else {
            ShellExit::Exited(success)
        };
        self.exit.send_replace(Some(exit));
        (self.on_done)(self.id, exit);
    }
}

impl Shell {
    /// Start a shell. `on_done` runs once, after the command has exited.
    pub(crate) fn spawn<F>(options: ShellOptions<'_>, on_done: F) -> io::Result<Self>
    where
        F: FnOnce(Uuid, ShellExit) + Send + 'static,
    {
        let command: Vec<String> = if options.command.is_empty() {
            vec![DEFAULT_COMMAND.to_string()]
        } else {
            options.command.to_vec()
        };

        let id = Uuid::new_v4();
        let (exit_tx, exit_rx) = watch::channel(None);
        let abort = Arc::new(Notify::new());
        let aborted = Arc::new(AtomicBool::new(false));
        let control = Control {
            exit: exit_tx,
            abort: abort.clone(),
            aborted: aborted.clone(),
            on_done: Box::new(on_done),
            id,
        };

        let streams = if options.tty {
            spawn_pty(&command, &options, control, exit_rx.clone())?
        } else {
            spawn_pipes(&command, &options, control)?
        };

        Ok(Self {
            inner: Arc::new(ShellInner {
                id,
                command,
                tty: options.tty,
                stdin: Mutex::new(Some(streams.stdin)),
                stdout: Mutex::new(Some(streams.stdout)),
                stderr: Mutex::new(streams.stderr),
                master: streams.master.map(Mutex::new),
                exit: exit_rx,
                abort,
                aborted,
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn command(&self) -> &[String] {
        &self.inner.command
    }

    /// Whether the shell runs on a pseudo-terminal.
    pub fn is_tty(&self) -> bool {
        self.inner.tty
    }

    /// Take the shell's standard input. Returns `None` once taken.
    ///
    /// Dropping the writer closes standard input.
    pub fn take_stdin(&self) -> Option<ShellWriter> {
        self.inner.stdin.lock().take()
    }

    /// Take the shell's standard output. Returns `None` once taken.
    pub fn take_stdout(&self) -> Option<ShellReader> {
        self.inner.stdout.lock().take()
    }

    /// Take the shell's standard error. Always `None` for tty shells.
    pub fn take_stderr(&self) -> Option<ShellReader> {
        self.inner.stderr.lock().take()
    }

    /// Resize the terminal. Does nothing for shells without one.
    pub fn set_size(&self, cols: u16, rows: u16) -> Result<()> {
        let Some(master) = &self.inner.master else {
            return Ok(());
        };
        master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| EngineError::infrastructure(format!("Failed to resize terminal: {}", e)))
    }

    /// Wait for the shell to end.
    ///
    /// Returns whether the command succeeded, or
    /// [`EngineError::SandboxAborted`] if the shell was aborted.
    pub async fn wait(&self) -> Result<bool> {
        let mut rx = self.inner.exit.clone();
        let exit = match rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => *exit,
            Err(_) => None,
        };
        match exit {
            Some(ShellExit::Exited(success)) => Ok(success),
            Some(ShellExit::Aborted) => Err(EngineError::SandboxAborted),
            None => Err(EngineError::infrastructure("shell supervisor vanished")),
        }
    }

    /// Kill the shell and everything it started. Does not wait.
    pub fn abort(&self) {
        if self.is_finished() {
            return;
        }
        self.inner.aborted.store(true, Ordering::Release);
        self.inner.abort.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.exit.borrow().is_some()
    }
}

impl std::fmt::Debug for Shell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shell")
            .field("id", &self.inner.id)
            .field("command", &self.inner.command)
            .field("tty", &self.inner.tty)
            .field("exit", &*self.inner.exit.borrow())
            .finish()
    }
}

struct Streams {
    stdin: ShellWriter,
    stdout: ShellReader,
    stderr: Option<ShellReader>,
    master: Option<Box<dyn MasterPty + Send>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipe backend
// ─────────────────────────────────────────────────────────────────────────────

fn spawn_pipes(command: &[String], options: &ShellOptions<'_>, control: Control) -> io::Result<Streams> {
    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..])
        .env_clear()
        .envs(options.environment)
        .current_dir(options.working_folder)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    options.owner.apply_to(&mut cmd)?;

    let mut child = cmd.spawn()?;
    let pid = child
        .id()
        .ok_or_else(|| io::Error::other("shell exited before its pid was read"))?;
    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        kill_group(pid);
        return Err(io::Error::other("shell pipes unavailable"));
    };

    tokio::spawn(supervise_pipes(child, pid, control));

    Ok(Streams {
        stdin: Box::pin(stdin),
        stdout: Box::pin(stdout),
        stderr: Some(Box::pin(stderr)),
        master: None,
    })
}

async fn supervise_pipes(mut child: Child, pid: u32, control: Control) {
    let success = loop {
        tokio::select! {
            status = child.wait() => {
                break status.map(|s| s.success()).unwrap_or_else(|e| {
                    tracing::warn!(pid, error = %e, "failed to wait for shell");
                    false
                });
            }
            _ = control.abort.notified() => {
                kill_group(pid);
                let _ = child.start_kill();
            }
        }
    };
    tracing::debug!(pid, success, "shell exited");
    control.finish(success);
}

// ─────────────────────────────────────────────────────────────────────────────
// Pseudo-terminal backend
// ─────────────────────────────────────────────────────────────────────────────

fn pty_err(what: &str, e: impl std::fmt::Display) -> io::Error {
    io::Error::other(format!("{}: {}", what, e))
}

/// Kill and reap a pty child whose shell could not be set up.
fn abandon_pty_child(mut child: Box<dyn portable_pty::Child + Send + Sync>, pid: Option<u32>) {
    if let Some(pid) = pid {
        kill_group(pid);
    }
    let _ = child.kill();
    tokio::task::spawn_blocking(move || child.wait());
}

fn spawn_pty(
    command: &[String],
    options: &ShellOptions<'_>,
    control: Control,
    exit: watch::Receiver<Option<ShellExit>>,
) -> io::Result<Streams> {
    let pair = NativePtySystem::default()
        .openpty(DEFAULT_SIZE)
        .map_err(|e| pty_err("Failed to open PTY", e))?;

    // The pty crate cannot switch users itself.
    let mut cmd = if options.owner.is_current() {
        let mut cmd = CommandBuilder::new(&command[0]);
        cmd.args(&command[1..]);
        cmd
    } else {
        let mut cmd = CommandBuilder::new("runuser");
        cmd.args(["-u", options.owner.name(), "--"]);
        cmd.args(command);
        cmd
    };
    cmd.env_clear();
    for (key, value) in options.environment {
        cmd.env(key, value);
    }
    cmd.cwd(options.working_folder);

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| pty_err("Failed to spawn PTY command", e))?;
    // Drop the slave so reads see EOF once the child exits.
    drop(pair.slave);

    let mut killer = child.clone_killer();
    let pid = child.process_id();
    let ends = pair
        .master
        .try_clone_reader()
        .map_err(|e| pty_err("Failed to clone PTY reader", e))
        .and_then(|reader| {
            let writer = pair
                .master
                .take_writer()
                .map_err(|e| pty_err("Failed to take PTY writer", e))?;
            Ok((reader, writer))
        });
    let (reader, writer) = match ends {
        Ok(ends) => ends,
        Err(e) => {
            abandon_pty_child(child, pid);
            return Err(e);
        }
    };

    let (pty_out, caller_out) = tokio::io::duplex(PTY_BUFFER);
    let handle = tokio::runtime::Handle::current();
    std::thread::spawn(move || pump_output(reader, pty_out, handle));

    let (caller_in, pty_in) = tokio::io::duplex(PTY_BUFFER);
    let (tx, rx) = std::sync::mpsc::channel::<Vec<u8>>();
    std::thread::spawn(move || pump_input(rx, writer));
    tokio::spawn(forward_input(pty_in, tx, exit));

    let waiter = tokio::task::spawn_blocking(move || child.wait());
    tokio::spawn(async move {
        tokio::pin!(waiter);
        let success = loop {
            tokio::select! {
                status = &mut waiter => {
                    break match status {
                        Ok(Ok(status)) => status.success(),
                        Ok(Err(e)) => {
                            tracing::warn!(?pid, error = %e, "failed to wait for tty shell");
                            false
                        }
                        Err(e) => {
                            tracing::warn!(?pid, error = %e, "tty shell waiter panicked");
                            false
                        }
                    };
                }
                _ = control.abort.notified() => {
                    // The pty child leads its own session and process group.
                    if let Some(pid) = pid {
                        kill_group(pid);
                    }
                    let _ = killer.kill();
                }
            }
        };
        tracing::debug!(?pid, success, "tty shell exited");
        control.finish(success);
    });

    Ok(Streams {
        stdin: Box::pin(caller_in),
        stdout: Box::pin(caller_out),
        stderr: None,
        master: Some(pair.master),
    })
}

fn pump_output(mut reader: Box<dyn Read + Send>, mut out: DuplexStream, handle: tokio::runtime::Handle) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            // Linux reports EIO once the slave side is gone.
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if handle.block_on(out.write_all(&buf[..n])).is_err() {
                    break;
                }
            }
        }
    }
}

fn pump_input(rx: std::sync::mpsc::Receiver<Vec<u8>>, mut writer: Box<dyn Write + Send>) {
    for chunk in rx {
        if writer.write_all(&chunk).and_then(|()| writer.flush()).is_err() {
            break;
        }
    }
}

async fn forward_input(
    mut input: DuplexStream,
    tx: std::sync::mpsc::Sender<Vec<u8>>,
    mut exit: watch::Receiver<Option<ShellExit>>,
) {
    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            read = input.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            },
            _ = exit.wait_for(|exit| exit.is_some()) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn env() -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert(
            "PATH".to_string(),
            std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string()),
        );
        env
    }

    fn spawn(command: &[&str], tty: bool, dir: &Path) -> (Shell, tokio::sync::oneshot::Receiver<ShellExit>) {
        let command: Vec<String> = command.iter().map(|s| s.to_string()).collect();
        let env = env();
        let owner = User::current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let shell = Shell::spawn(
            ShellOptions {
                command: &command,
                tty,
                environment: &env,
                working_folder: dir,
                owner: &owner,
            },
            move |_, exit| {
                let _ = tx.send(exit);
            },
        )
        .unwrap();
        (shell, rx)
    }

    #[tokio::test]
    async fn test_pipe_shell_echoes_input() {
        let dir = tempfile::tempdir().unwrap();
        let (shell, done) = spawn(&["cat"], false, dir.path());
        assert!(!shell.is_tty());

        let mut stdin = shell.take_stdin().unwrap();
        assert!(shell.take_stdin().is_none());
        let mut stdout = shell.take_stdout().unwrap();

        stdin.write_all(b"hello shell\n").await.unwrap();
        drop(stdin);

        let mut output = String::new();
        stdout.read_to_string(&mut output).await.unwrap();
        assert_eq!(output, "hello shell\n");

        assert!(shell.wait().await.unwrap());
        assert_eq!(done.await.unwrap(), ShellExit::Exited(true));
    }

    #[tokio::test]
    async fn test_pipe_shell_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (shell, _done) = spawn(&["sh", "-c", "echo oops >&2; exit 2"], false, dir.path());

        let mut stderr = shell.take_stderr().unwrap();
        let mut output = String::new();
        stderr.read_to_string(&mut output).await.unwrap();
        assert_eq!(output, "oops\n");
        assert!(!shell.wait().await.unwrap());
    }

    #[tokio::test]
    async fn test_abort_reports_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let (shell, done) = spawn(&["sleep", "60"], false, dir.path());

        shell.abort();
        let result = tokio::time::timeout(Duration::from_secs(5), shell.wait())
            .await
            .unwrap();
        assert!(matches!(result, Err(EngineError::SandboxAborted)));
        assert_eq!(done.await.unwrap(), ShellExit::Aborted);

        // Aborting a finished shell changes nothing.
        shell.abort();
        assert!(matches!(shell.wait().await, Err(EngineError::SandboxAborted)));
    }

    #[tokio::test]
    async fn test_tty_shell_merges_output() {
        let dir = tempfile::tempdir().unwrap();
        let (shell, _done) = spawn(&["sh", "-c", "echo out; echo err >&2"], true, dir.path());
        assert!(shell.is_tty());
        assert!(shell.take_stderr().is_none());
        shell.set_size(120, 40).unwrap();

        let mut stdout = shell.take_stdout().unwrap();
        let mut output = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stdout.read_to_end(&mut output))
            .await
            .unwrap()
            .unwrap();
        let output = String::from_utf8_lossy(&output);
        assert!(output.contains("out"));
        assert!(output.contains("err"));
        assert!(shell.wait().await.unwrap());
    }

    #[tokio::test]
    async fn test_set_size_without_tty_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (shell, _done) = spawn(&["true"], false, dir.path());
        shell.set_size(100, 30).unwrap();
        assert!(shell.wait().await.unwrap());
    }

    #[tokio::test]
    async fn test_abandoned_pty_child_is_killed_and_reaped() {
        let pair = NativePtySystem::default().openpty(DEFAULT_SIZE).unwrap();
        let mut cmd = CommandBuilder::new("sleep");
        cmd.arg("60");
        let child = pair.slave.spawn_command(cmd).unwrap();
        let pid = child.process_id().unwrap();

        abandon_pty_child(child, Some(pid));

        let target = nix::unistd::Pid::from_raw(pid as i32);
        tokio::time::timeout(Duration::from_secs(5), async {
            while nix::sys::signal::kill(target, None).is_ok() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }
}

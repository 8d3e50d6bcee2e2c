//! Waiting for QEMU's control sockets to appear.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};

use crate::arguments::{QMP_SOCKET, VNC_SOCKET};
use crate::error::{VmError, VmResult};

/// How the wait for the sockets ended, short of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    /// Both sockets exist.
    Ready,
    /// The machine finished before both sockets showed up.
    Stopped,
}

/// A watch on a socket folder, armed before QEMU is spawned so no creation
/// event can be missed.
pub(crate) struct SocketWatch {
    // Dropping the watcher stops the notification thread.
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    folder: PathBuf,
}

impl SocketWatch {
    pub fn arm(folder: &Path) -> VmResult<Self> {
        let (tx, events) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .map_err(|e| VmError::Watch(format!("Failed to set up file system monitoring: {}", e)))?;
        watcher
            .watch(folder, RecursiveMode::NonRecursive)
            .map_err(|e| VmError::Watch(format!("Failed to monitor socket folder: {}", e)))?;

        Ok(Self {
            _watcher: watcher,
            events,
            folder: folder.to_path_buf(),
        })
    }

    /// Wait until both sockets exist, `timeout` passes, or `done` fires.
    pub async fn ready(mut self, timeout: Duration, mut done: watch::Receiver<bool>) -> VmResult<Readiness> {
        let mut vnc = self.folder.join(VNC_SOCKET).exists();
        let mut qmp = self.folder.join(QMP_SOCKET).exists();

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        while !(vnc && qmp) {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(Ok(event)) => {
                        if !matches!(event.kind, EventKind::Create(_)) {
                            continue;
                        }
                        for path in &event.paths {
                            match path.file_name().and_then(|name| name.to_str()) {
                                Some(VNC_SOCKET) => vnc = true,
                                Some(QMP_SOCKET) => qmp = true,
                                _ => {}
                            }
                        }
                    }
                    Some(Err(e)) => return Err(VmError::Watch(e.to_string())),
                    None => return Err(VmError::Watch("file system monitoring stopped".to_string())),
                },
                // Stop promptly if QEMU dies first.
                _ = done.wait_for(|done| *done) => return Ok(Readiness::Stopped),
                _ = &mut deadline => return Err(VmError::SocketTimeout(timeout)),
            }
        }
        Ok(Readiness::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_after_both_sockets() {
        let dir = tempfile::tempdir().unwrap();
        let watch = SocketWatch::arm(dir.path()).unwrap();
        let (_done_tx, done) = watch::channel(false);

        let folder = dir.path().to_path_buf();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::write(folder.join(VNC_SOCKET), b"").unwrap();
            std::fs::write(folder.join("unrelated"), b"").unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::write(folder.join(QMP_SOCKET), b"").unwrap();
        });

        let readiness = watch.ready(Duration::from_secs(10), done).await.unwrap();
        assert_eq!(readiness, Readiness::Ready);
    }

    #[tokio::test]
    async fn test_existing_sockets_count() {
        let dir = tempfile::tempdir().unwrap();
        let watch = SocketWatch::arm(dir.path()).unwrap();
        std::fs::write(dir.path().join(VNC_SOCKET), b"").unwrap();
        std::fs::write(dir.path().join(QMP_SOCKET), b"").unwrap();
        let (_done_tx, done) = watch::channel(false);

        let readiness = watch.ready(Duration::from_secs(10), done).await.unwrap();
        assert_eq!(readiness, Readiness::Ready);
    }

    #[tokio::test]
    async fn test_one_socket_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let watch = SocketWatch::arm(dir.path()).unwrap();
        std::fs::write(dir.path().join(VNC_SOCKET), b"").unwrap();
        let (_done_tx, done) = watch::channel(false);

        let err = watch
            .ready(Duration::from_millis(200), done)
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::SocketTimeout(t) if t == Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn test_done_stops_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let watch = SocketWatch::arm(dir.path()).unwrap();
        let (done_tx, done) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            done_tx.send_replace(true);
        });

        let readiness = watch.ready(Duration::from_secs(10), done).await.unwrap();
        assert_eq!(readiness, Readiness::Stopped);
    }

    #[test]
    fn test_missing_folder_fails_to_arm() {
        let dir = tempfile::tempdir().unwrap();
        let result = SocketWatch::arm(&dir.path().join("missing"));
        assert!(matches!(result, Err(VmError::Watch(_))));
    }
}

//! Task log sinks.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};

/// A write destination for the task log.
///
/// Sinks are shared between every stream a task produces (process output,
/// engine messages), so writes take `&self` and must be atomic per chunk.
pub trait LogSink: Send + Sync + 'static {
    /// Append a chunk to the log.
    fn write(&self, chunk: &[u8]) -> io::Result<()>;
}

/// Shared handle to a log sink.
pub type SharedLogSink = Arc<dyn LogSink>;

/// Copy everything from `reader` into `sink` until EOF.
///
/// This is how a child process's standard output becomes part of the task
/// log. Returns the number of bytes forwarded.
pub async fn drain_into<R>(mut reader: R, sink: &dyn LogSink) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8192];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        sink.write(&buf[..n])?;
        total += n as u64;
    }
}

/// In-memory log, mostly useful for tests and short-lived tasks.
#[derive(Debug, Default)]
pub struct MemoryLog {
    buf: Mutex<Vec<u8>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().clone()
    }

    /// Log contents decoded lossily as UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock()).into_owned()
    }
}

impl LogSink for MemoryLog {
    fn write(&self, chunk: &[u8]) -> io::Result<()> {
        self.buf.lock().extend_from_slice(chunk);
        Ok(())
    }
}

/// Log appended to a file on disk.
#[derive(Debug)]
pub struct FileLog {
    file: Mutex<File>,
}

impl FileLog {
    /// Create (or truncate) the log file at `path`.
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: Mutex::new(File::create(path)?),
        })
    }
}

impl LogSink for FileLog {
    fn write(&self, chunk: &[u8]) -> io::Result<()> {
        self.file.lock().write_all(chunk)
    }
}

/// Log forwarded to the worker's own standard output.
#[derive(Debug, Default)]
pub struct StdoutLog;

impl LogSink for StdoutLog {
    fn write(&self, chunk: &[u8]) -> io::Result<()> {
        let mut out = io::stdout().lock();
        out.write_all(chunk)?;
        out.flush()
    }
}

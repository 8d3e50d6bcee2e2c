//! Shared types for taskbox execution engines.
//!
//! Engines (native processes, QEMU virtual machines) consume a small set of
//! collaborator interfaces from the worker: temporary storage, a task log
//! sink, a component logger and the task context tying them together. The
//! error taxonomy shared by every engine also lives here, so callers can tell
//! a broken payload apart from a broken worker.

pub mod context;
pub mod error;
pub mod log;
pub mod monitor;
pub mod storage;

pub use context::TaskContext;
pub use error::{EngineError, Result};
pub use log::{FileLog, LogSink, MemoryLog, SharedLogSink, StdoutLog, drain_into};
pub use monitor::Monitor;
pub use storage::{DiskStorage, TemporaryFolder, TemporaryStorage};

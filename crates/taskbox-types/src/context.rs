//! Per-task execution context.

use std::io;

use tokio_util::sync::CancellationToken;

use crate::log::SharedLogSink;

/// Everything an engine needs to know about the task it is running.
///
/// Cloning is cheap; clones share the log sink and cancellation scope.
#[derive(Clone)]
pub struct TaskContext {
    task_id: String,
    log: SharedLogSink,
    cancel: CancellationToken,
}

impl TaskContext {
    /// Create a context for `task_id` logging to `log`.
    pub fn new(task_id: impl Into<String>, log: SharedLogSink) -> Self {
        Self {
            task_id: task_id.into(),
            log,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an existing cancellation scope (e.g. a child of the worker's).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// The task log.
    pub fn log_drain(&self) -> &SharedLogSink {
        &self.log
    }

    /// Write a line to the task log.
    pub fn log(&self, message: &str) -> io::Result<()> {
        let mut line = String::with_capacity(message.len() + 1);
        line.push_str(message);
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.log.write(line.as_bytes())
    }

    /// Cancellation scope of the task.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel the task; engines abort whatever they are running for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

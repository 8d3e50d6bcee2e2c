//! Error taxonomy shared by all execution engines.

use thiserror::Error;

/// Result type alias using the engine error type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by execution engines.
///
/// The variants fall into three families that callers treat differently:
///
/// - **Malformed input** ([`EngineError::MalformedPayload`]): the task itself
///   is broken. Never retried; the task fails permanently.
/// - **Infrastructure** ([`EngineError::Infrastructure`], [`EngineError::Io`],
///   [`EngineError::Fatal`]): the worker failed to acquire or release a local
///   resource. The task is typically retried elsewhere.
/// - **Sandbox state** ([`EngineError::SandboxTerminated`],
///   [`EngineError::SandboxAborted`]): the sandbox was resolved by a kill or
///   an abort rather than by its payload.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The task payload or a resource it referenced is invalid.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// A local OS resource could not be acquired.
    #[error("{message}")]
    Infrastructure {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The sandbox has been terminated; no further interaction is possible.
    #[error("Sandbox terminated")]
    SandboxTerminated,

    /// The sandbox was aborted before a result became available.
    #[error("Sandbox aborted")]
    SandboxAborted,

    /// Teardown left the worker in an unsafe state and it should stop
    /// accepting tasks.
    #[error("Fatal worker error: {0}")]
    Fatal(String),

    /// A file or folder requested from a result does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Build a malformed-payload error from anything printable.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedPayload(message.into())
    }

    /// Build an infrastructure error without an underlying cause.
    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::Infrastructure {
            message: message.into(),
            source: None,
        }
    }

    /// Build an infrastructure error wrapping its cause.
    pub fn infrastructure_with<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Infrastructure {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether the task payload is at fault.
    pub fn is_malformed_payload(&self) -> bool {
        matches!(self, Self::MalformedPayload(_))
    }

    /// Whether the worker is at fault.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Infrastructure { .. } | Self::Io(_) | Self::Fatal(_))
    }

    /// Whether the error reports how the sandbox was resolved.
    pub fn is_sandbox_state(&self) -> bool {
        matches!(self, Self::SandboxTerminated | Self::SandboxAborted)
    }
}

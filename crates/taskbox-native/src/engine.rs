//! Engine entry point: turning payloads into sandboxes.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use taskbox_types::{EngineError, Monitor, Result, TaskContext, TemporaryStorage};

use crate::config::NativeConfig;
use crate::sandbox::{Sandbox, SandboxSetup};

/// What a task asks the native engine to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    /// Program and arguments.
    pub command: Vec<String>,

    /// URL of an archive unpacked into the working folder before the
    /// command starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl Payload {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            context: None,
        }
    }

    pub fn with_context(mut self, url: impl Into<String>) -> Self {
        self.context = Some(url.into());
        self
    }
}

/// Runs task payloads as OS processes.
#[derive(Clone)]
pub struct NativeEngine {
    config: NativeConfig,
    storage: Arc<dyn TemporaryStorage>,
    monitor: Monitor,
}

impl NativeEngine {
    pub fn new(config: NativeConfig, storage: Arc<dyn TemporaryStorage>, monitor: Monitor) -> Self {
        Self {
            config,
            storage,
            monitor,
        }
    }

    pub fn config(&self) -> &NativeConfig {
        &self.config
    }

    /// Prepare a sandbox for `payload`. Nothing runs until
    /// [`SandboxBuilder::start_sandbox`].
    pub fn new_sandbox_builder(&self, payload: Payload, context: TaskContext) -> SandboxBuilder {
        SandboxBuilder {
            engine: self.clone(),
            payload,
            context,
            environment: HashMap::new(),
        }
    }
}

impl std::fmt::Debug for NativeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeEngine")
            .field("config", &self.config)
            .field("monitor", &self.monitor.to_string())
            .finish()
    }
}

/// Collects environment variables for a sandbox before starting it.
#[derive(Debug)]
pub struct SandboxBuilder {
    engine: NativeEngine,
    payload: Payload,
    context: TaskContext,
    environment: HashMap<String, String>,
}

impl SandboxBuilder {
    /// Set an environment variable for the task.
    ///
    /// Names must be non-empty, must not start with a digit and must not
    /// contain `=` or NUL. Each name may be set once.
    pub fn set_env(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let name = name.into();
        let value = value.into();
        if name.is_empty()
            || name.starts_with(|c: char| c.is_ascii_digit())
            || name.contains(['=', '\0'])
        {
            return Err(EngineError::malformed(format!(
                "Environment variable name '{}' is not valid",
                name.escape_debug()
            )));
        }
        if value.contains('\0') {
            return Err(EngineError::malformed(format!(
                "Environment variable '{}' contains a NUL byte",
                name
            )));
        }
        if self.environment.contains_key(&name) {
            return Err(EngineError::malformed(format!(
                "Environment variable '{}' is already set",
                name
            )));
        }
        self.environment.insert(name, value);
        Ok(())
    }

    /// Allocate resources, fetch the context and start the command.
    pub async fn start_sandbox(self) -> Result<Sandbox> {
        if self.payload.command.is_empty() {
            return Err(EngineError::malformed("Payload has an empty command"));
        }
        Sandbox::start(SandboxSetup {
            config: &self.engine.config,
            storage: self.engine.storage.as_ref(),
            monitor: self.engine.monitor.clone(),
            context: self.context,
            command: self.payload.command,
            context_url: self.payload.context,
            environment: self.environment,
        })
        .await
    }
}

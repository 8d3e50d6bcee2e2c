//! Native execution engine: task commands as plain OS processes.
//!
//! Each task gets a [`Sandbox`]. With [`NativeConfig::create_user`] set the
//! sandbox runs its command as a throwaway OS user whose home is a fresh
//! temporary folder, so "everything the task started" is simply "every
//! process of that user". Otherwise the command runs as the worker's own
//! user.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use taskbox_native::{NativeConfig, NativeEngine, Payload};
//! use taskbox_types::{DiskStorage, Monitor, StdoutLog, TaskContext};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = Arc::new(DiskStorage::new("/tmp/taskbox")?);
//!     let engine = NativeEngine::new(NativeConfig::new(), storage, Monitor::new("native"));
//!
//!     let payload = Payload::new(vec!["echo".into(), "hello".into()]);
//!     let context = TaskContext::new("task-1", Arc::new(StdoutLog));
//!     let sandbox = engine.new_sandbox_builder(payload, context).start_sandbox().await?;
//!
//!     let result = sandbox.wait_for_result().await?;
//!     println!("success: {}", result.success());
//!     result.dispose().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod engine;
pub mod fetch;
mod once;
mod reclaim;
pub mod registry;
mod result;
mod sandbox;
mod shell;
pub mod system;

pub use config::NativeConfig;
pub use engine::{NativeEngine, Payload, SandboxBuilder};
pub use once::ResolveOnce;
pub use registry::{Draining, RegistryState, SessionRegistry};
pub use result::ResultSet;
pub use sandbox::Sandbox;
pub use shell::{Shell, ShellExit, ShellReader, ShellWriter};

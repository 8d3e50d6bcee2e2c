//! CLI command handlers.

pub mod run;
pub mod vm;

use taskbox_config::WorkerConfig;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Loaded worker configuration.
    pub config: WorkerConfig,
    /// Verbose output enabled.
    pub verbose: bool,
}

//! `taskbox run`: run a command in a native sandbox.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use taskbox_native::{NativeConfig, NativeEngine, Payload};
use taskbox_types::{DiskStorage, EngineError, Monitor, StdoutLog, TaskContext};

use super::Context;

/// Exit code when the task was aborted by an interrupt.
const EXIT_INTERRUPTED: u8 = 130;

/// Arguments for the run command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Environment variable for the task (repeatable)
    #[arg(short, long = "env", value_name = "NAME=VALUE", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// URL of an archive to unpack into the working folder
    #[arg(long, value_name = "URL")]
    pub context: Option<String>,

    /// Identifier used for the task in logs
    #[arg(long, default_value = "local")]
    pub task_id: String,

    /// Command and arguments to run
    #[arg(required = true, last = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

fn parse_env(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) => Ok((name.to_string(), value.to_string())),
        None => Err(format!("expected NAME=VALUE, got '{}'", s)),
    }
}

/// Run the command; the exit code reflects whether the task succeeded.
pub async fn run(args: RunArgs, ctx: &Context) -> Result<ExitCode> {
    let storage = DiskStorage::new(&ctx.config.storage.root).with_context(|| {
        format!(
            "failed to prepare storage root {}",
            ctx.config.storage.root.display()
        )
    })?;
    let native = NativeConfig::new()
        .with_create_user(ctx.config.native.create_user)
        .with_groups(ctx.config.native.groups.clone());
    let engine = NativeEngine::new(native, Arc::new(storage), Monitor::new("native-engine"));

    if ctx.verbose {
        tracing::debug!(command = ?args.command, context = ?args.context, "Starting task");
    }

    let mut payload = Payload::new(args.command);
    if let Some(url) = args.context {
        payload = payload.with_context(url);
    }
    let task = TaskContext::new(args.task_id, Arc::new(StdoutLog));

    let mut builder = engine.new_sandbox_builder(payload, task.clone());
    for (name, value) in args.env {
        builder.set_env(name, value)?;
    }
    let sandbox = builder.start_sandbox().await?;

    let result = tokio::select! {
        result = sandbox.wait_for_result() => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted, aborting task");
            task.cancel();
            sandbox.wait_for_result().await
        }
    };

    let result = match result {
        Ok(result) => result,
        Err(EngineError::SandboxAborted) => return Ok(ExitCode::from(EXIT_INTERRUPTED)),
        Err(e) => bail!(e),
    };

    let success = result.success();
    result.dispose().await.context("failed to clean up task")?;
    tracing::info!(success, "Task finished");

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

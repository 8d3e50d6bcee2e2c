//! The native sandbox: one task command running as a (usually throwaway)
//! OS user, plus any shells attached to it.
//!
//! A sandbox resolves exactly once, by whichever comes first of
//!
//! - its command exiting on its own (after every attached shell has ended),
//! - [`Sandbox::kill`], which leaves a [`ResultSet`] to inspect, or
//! - [`Sandbox::abort`], which throws everything away.
//!
//! The losing triggers observe the winner's outcome and do no teardown of
//! their own.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use taskbox_types::{EngineError, Monitor, Result, TaskContext, TemporaryStorage};

use crate::config::NativeConfig;
use crate::fetch::fetch_context;
use crate::once::ResolveOnce;
use crate::reclaim::Resources;
use crate::registry::SessionRegistry;
use crate::result::ResultSet;
use crate::shell::{Shell, ShellOptions};
use crate::system::{Process, ProcessOptions, User};

/// PATH handed to tasks when neither the payload nor the worker has one.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// A running native sandbox. Clones refer to the same sandbox.
#[derive(Clone)]
pub struct Sandbox {
    inner: Arc<SandboxInner>,
}

struct SandboxInner {
    monitor: Monitor,
    context: TaskContext,
    resources: Arc<Resources>,
    environment: HashMap<String, String>,
    process: Process,
    resolve: ResolveOnce,
    resolution: Mutex<Option<Resolution>>,
    sessions: SessionRegistry,
    shells: Mutex<Vec<Shell>>,
}

#[derive(Debug, Clone)]
enum Resolution {
    /// Finished or killed; the result may be inspected.
    Completed(ResultSet),
    /// Aborted; `fatal` is set if the task user could not be removed.
    Aborted { fatal: Option<String> },
}

/// Everything needed to bring up a sandbox.
pub(crate) struct SandboxSetup<'a> {
    pub config: &'a NativeConfig,
    pub storage: &'a dyn TemporaryStorage,
    pub monitor: Monitor,
    pub context: TaskContext,
    pub command: Vec<String>,
    pub context_url: Option<String>,
    pub environment: HashMap<String, String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Construction
// ─────────────────────────────────────────────────────────────────────────────

impl Sandbox {
    pub(crate) async fn start(setup: SandboxSetup<'_>) -> Result<Self> {
        let monitor = setup.monitor.with_tag("taskId", setup.context.task_id());
        let resources = Arc::new(acquire(setup.config, setup.storage, &monitor).await?);

        if let Some(url) = &setup.context_url {
            monitor.debug(format!("Fetching task context from {}", url));
            if let Err(e) = fetch_context(url, resources.working_folder(), resources.user()).await {
                unwind(&resources, &monitor).await;
                return Err(EngineError::malformed(format!("Error downloading {}: {}", url, e)));
            }
        }

        let environment = task_environment(setup.environment, resources.user());

        let process = Process::start(ProcessOptions {
            arguments: &setup.command,
            environment: &environment,
            working_folder: resources.working_folder(),
            owner: Some(resources.user()),
            stdout: setup.context.log_drain().clone(),
        });
        let process = match process {
            Ok(process) => process,
            Err(e) => {
                unwind(&resources, &monitor).await;
                return Err(EngineError::malformed(format!(
                    "Unable to start specified command {:?}: {}",
                    setup.command, e
                )));
            }
        };
        monitor.info(format!(
            "Started {:?} as '{}' (pid {})",
            setup.command,
            resources.user().name(),
            process.pid()
        ));

        let inner = Arc::new(SandboxInner {
            monitor,
            context: setup.context,
            resources,
            environment,
            process,
            resolve: ResolveOnce::new(),
            resolution: Mutex::new(None),
            sessions: SessionRegistry::new(),
            shells: Mutex::new(Vec::new()),
        });

        tokio::spawn(watch_exit(inner.clone()));
        tokio::spawn(watch_cancellation(inner.clone()));

        Ok(Self { inner })
    }
}

/// Allocate the working folder and task user, or fall back to the worker's
/// own account when users are not created.
async fn acquire(config: &NativeConfig, storage: &dyn TemporaryStorage, monitor: &Monitor) -> Result<Resources> {
    if !config.create_user {
        let user = User::current()
            .map_err(|e| EngineError::infrastructure_with("Failed to look up current user", e))?;
        return Ok(Resources::ambient(user));
    }

    let folder = storage
        .new_folder()
        .map_err(|e| EngineError::infrastructure_with("Failed to create temporary folder", e))?;
    match User::create(folder.path(), &config.groups).await {
        Ok(user) => {
            monitor.debug(format!("Created task user '{}'", user.name()));
            Ok(Resources::owned(user, folder))
        }
        Err(e) => {
            if let Err(re) = folder.remove() {
                monitor.error(format!("Failed to remove temporary folder: {}", re));
            }
            Err(EngineError::infrastructure_with("Failed to create temporary user", e))
        }
    }
}

/// Undo [`acquire`] after a failed start.
async fn unwind(resources: &Resources, monitor: &Monitor) {
    resources.kill_processes(monitor).await;
    if let Err(e) = resources.remove_user().await {
        monitor.error(format!(
            "Failed to remove task user '{}': {}",
            resources.user().name(),
            e
        ));
    }
    if let Err(e) = resources.release_folder() {
        monitor.error(format!("Failed to remove temporary folder: {}", e));
    }
}

fn task_environment(mut environment: HashMap<String, String>, user: &User) -> HashMap<String, String> {
    environment.insert("HOME".to_string(), user.home().display().to_string());
    environment.insert("USER".to_string(), user.name().to_string());
    environment.insert("LOGNAME".to_string(), user.name().to_string());
    if !environment.contains_key("PATH") {
        let path = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());
        environment.insert("PATH".to_string(), path);
    }
    environment
}

// ─────────────────────────────────────────────────────────────────────────────
// Background watchers
// ─────────────────────────────────────────────────────────────────────────────

async fn watch_exit(inner: Arc<SandboxInner>) {
    let success = inner.process.wait().await;
    inner.monitor.debug(format!("Command exited, success: {}", success));
    // No new shells from here on; running ones hold up the result.
    inner.sessions.wait_and_drain().await;

    inner
        .resolve
        .run(|| async {
            inner.resources.kill_processes(&inner.monitor).await;
            let result = ResultSet::new(success, false, inner.resources.clone(), inner.monitor.clone());
            inner.set_resolution(Resolution::Completed(result));
        })
        .await;
}

async fn watch_cancellation(inner: Arc<SandboxInner>) {
    let token = inner.context.cancellation().clone();
    let cancelled = tokio::select! {
        _ = token.cancelled() => true,
        _ = inner.resolve.wait() => false,
    };
    if !cancelled {
        return;
    }
    inner.monitor.info("Task cancelled, aborting sandbox");
    let sandbox = Sandbox { inner };
    if let Err(e) = sandbox.abort().await
        && !e.is_sandbox_state()
    {
        sandbox.inner.monitor.error(format!("Abort after cancellation failed: {}", e));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Operations
// ─────────────────────────────────────────────────────────────────────────────

impl Sandbox {
    /// Attach a new shell running `command` as the task user.
    ///
    /// Fails with [`EngineError::SandboxTerminated`] once the sandbox has
    /// started resolving.
    pub fn new_shell(&self, command: &[String], tty: bool) -> Result<Shell> {
        let mut shells = self.inner.shells.lock();
        if self.inner.sessions.add().is_err() {
            return Err(EngineError::SandboxTerminated);
        }

        let weak = Arc::downgrade(&self.inner);
        let spawned = Shell::spawn(
            ShellOptions {
                command,
                tty,
                environment: &self.inner.environment,
                working_folder: self.inner.resources.working_folder(),
                owner: self.inner.resources.user(),
            },
            move |id, exit| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.shells.lock().retain(|shell| shell.id() != id);
                inner.monitor.debug(format!("Shell {} finished: {:?}", id, exit));
                inner.sessions.done();
            },
        );

        match spawned {
            Ok(shell) => {
                self.inner
                    .monitor
                    .debug(format!("Started shell {} with {:?}", shell.id(), shell.command()));
                shells.push(shell.clone());
                Ok(shell)
            }
            Err(e) => {
                self.inner.sessions.done();
                Err(EngineError::malformed(format!(
                    "Unable to start shell {:?}: {}",
                    command, e
                )))
            }
        }
    }

    /// Wait for the sandbox to resolve and return its result.
    ///
    /// Every caller sees the same outcome; after [`Sandbox::abort`] that is
    /// [`EngineError::SandboxAborted`].
    pub async fn wait_for_result(&self) -> Result<ResultSet> {
        self.inner.resolve.wait().await;
        match self.inner.resolution()? {
            Resolution::Completed(result) => Ok(result),
            Resolution::Aborted { .. } => Err(EngineError::SandboxAborted),
        }
    }

    /// Kill the command, every shell and every process of the task user.
    ///
    /// The result stays available from [`Sandbox::wait_for_result`]. Returns
    /// [`EngineError::SandboxAborted`] if the sandbox was aborted first.
    pub async fn kill(&self) -> Result<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner
                .resolve
                .run(|| async {
                    inner.monitor.debug("Killing sandbox");
                    inner.process.kill_tree();
                    inner.abort_shells().await;
                    inner.resources.kill_processes(&inner.monitor).await;
                    inner.process.wait().await;
                    let result = ResultSet::new(false, true, inner.resources.clone(), inner.monitor.clone());
                    inner.set_resolution(Resolution::Completed(result));
                })
                .await
        })
        .await
        .map_err(|e| EngineError::infrastructure_with("Sandbox teardown panicked", e))?;

        match self.inner.resolution()? {
            Resolution::Completed(_) => Ok(()),
            Resolution::Aborted { .. } => Err(EngineError::SandboxAborted),
        }
    }

    /// Kill everything, delete the task user and the working folder.
    ///
    /// Returns [`EngineError::SandboxTerminated`] if the sandbox already
    /// finished or was killed, and [`EngineError::Fatal`] if the task user
    /// could not be removed.
    pub async fn abort(&self) -> Result<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner
                .resolve
                .run(|| async {
                    inner.monitor.debug("Aborting sandbox");
                    inner.process.kill_tree();
                    inner.abort_shells().await;
                    inner.resources.kill_processes(&inner.monitor).await;
                    inner.process.wait().await;

                    let mut fatal = None;
                    if let Err(e) = inner.resources.remove_user().await {
                        let message = format!(
                            "Failed to remove task user '{}': {}",
                            inner.resources.user().name(),
                            e
                        );
                        inner.monitor.error(&message);
                        fatal = Some(message);
                    }
                    if let Err(e) = inner.resources.release_folder() {
                        inner
                            .monitor
                            .error(format!("Failed to remove temporary folder: {}", e));
                    }
                    inner.set_resolution(Resolution::Aborted { fatal });
                })
                .await
        })
        .await
        .map_err(|e| EngineError::infrastructure_with("Sandbox teardown panicked", e))?;

        match self.inner.resolution()? {
            Resolution::Aborted { fatal: None } => Ok(()),
            Resolution::Aborted { fatal: Some(message) } => Err(EngineError::Fatal(message)),
            Resolution::Completed(_) => Err(EngineError::SandboxTerminated),
        }
    }

    /// Process id of the task command.
    pub fn pid(&self) -> u32 {
        self.inner.process.pid()
    }

    /// Folder the task runs in.
    pub fn working_folder(&self) -> &std::path::Path {
        self.inner.resources.working_folder()
    }

    /// Shells currently attached.
    pub fn shells(&self) -> Vec<Shell> {
        self.inner.shells.lock().clone()
    }

    /// Number of shells that have not finished yet.
    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.active()
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.resolve.is_done()
    }
}

impl SandboxInner {
    fn set_resolution(&self, resolution: Resolution) {
        let mut slot = self.resolution.lock();
        debug_assert!(slot.is_none(), "sandbox resolved twice");
        *slot = Some(resolution);
    }

    fn resolution(&self) -> Result<Resolution> {
        self.resolution
            .lock()
            .clone()
            .ok_or_else(|| EngineError::infrastructure("sandbox has no resolution"))
    }

    /// Stop accepting shells, abort the attached ones and wait for them.
    async fn abort_shells(&self) {
        let shells = {
            let mut shells = self.shells.lock();
            self.sessions.drain();
            std::mem::take(&mut *shells)
        };
        for shell in &shells {
            shell.abort();
        }
        self.sessions.wait().await;
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("task_id", &self.inner.context.task_id())
            .field("pid", &self.inner.process.pid())
            .field("user", &self.inner.resources.user().name())
            .field("resolved", &self.inner.resolve.is_done())
            .finish()
    }
}

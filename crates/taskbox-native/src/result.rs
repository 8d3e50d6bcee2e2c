//! Inspecting what a finished task left behind.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use taskbox_types::{EngineError, Monitor, Result};

use crate::reclaim::Resources;

/// Outcome of a sandbox that ran to completion or was killed.
///
/// Keeps the working folder (and the task user, if one was created) alive
/// until [`ResultSet::dispose`] is called. Clones share the same resources.
#[derive(Debug, Clone)]
pub struct ResultSet {
    inner: Arc<ResultInner>,
}

#[derive(Debug)]
struct ResultInner {
    success: bool,
    killed: bool,
    resources: Arc<Resources>,
    monitor: Monitor,
}

impl ResultSet {
    pub(crate) fn new(success: bool, killed: bool, resources: Arc<Resources>, monitor: Monitor) -> Self {
        Self {
            inner: Arc::new(ResultInner {
                success,
                killed,
                resources,
                monitor,
            }),
        }
    }

    /// Whether the task's command exited successfully.
    pub fn success(&self) -> bool {
        self.inner.success
    }

    /// Whether the sandbox was killed rather than left to finish.
    pub fn killed(&self) -> bool {
        self.inner.killed
    }

    /// Open a file from the task's working folder.
    ///
    /// `path` is relative to the working folder.
    pub async fn extract_file(&self, path: impl AsRef<Path>) -> Result<tokio::fs::File> {
        let path = path.as_ref();
        let full = self.resolve(path).await?;
        let meta = tokio::fs::metadata(&full).await.map_err(|e| not_found(path, e))?;
        if !meta.is_file() {
            return Err(EngineError::NotFound(path.display().to_string()));
        }
        tokio::fs::File::open(&full)
            .await
            .map_err(|e| not_found(path, e))
    }

    /// List the regular files below a folder of the working folder.
    ///
    /// Returned paths are relative to the working folder, ready for
    /// [`ResultSet::extract_file`].
    pub async fn extract_folder(&self, path: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let path = path.as_ref();
        let full = self.resolve(path).await?;
        let meta = tokio::fs::metadata(&full).await.map_err(|e| not_found(path, e))?;
        if !meta.is_dir() {
            return Err(EngineError::NotFound(path.display().to_string()));
        }

        let root = tokio::fs::canonicalize(self.inner.resources.working_folder()).await?;
        let files = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<PathBuf>> {
            let mut files = Vec::new();
            for entry in walkdir::WalkDir::new(&full).follow_links(false).sort_by_file_name() {
                let entry = entry.map_err(std::io::Error::other)?;
                if entry.file_type().is_file()
                    && let Ok(relative) = entry.path().strip_prefix(&root)
                {
                    files.push(relative.to_path_buf());
                }
            }
            Ok(files)
        })
        .await
        .map_err(|e| EngineError::infrastructure_with("Failed to list result folder", e))??;
        Ok(files)
    }

    /// Kill leftover processes, delete the task user and its working folder.
    ///
    /// Safe to call more than once.
    pub async fn dispose(&self) -> Result<()> {
        let resources = &self.inner.resources;
        resources.kill_processes(&self.inner.monitor).await;
        if let Err(e) = resources.remove_user().await {
            let message = format!("Failed to remove task user '{}': {}", resources.user().name(), e);
            self.inner.monitor.error(&message);
            return Err(EngineError::Fatal(message));
        }
        resources.release_folder().map_err(|e| {
            EngineError::infrastructure_with("Failed to remove working folder", e)
        })
    }

    /// Map `path` into the working folder, refusing anything that leaves it.
    async fn resolve(&self, path: &Path) -> Result<PathBuf> {
        if path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(EngineError::malformed(format!(
                "result path '{}' must be relative to the working folder",
                path.display()
            )));
        }

        let root = self.inner.resources.working_folder();
        let full = root.join(path);
        // Symlinks left by the task must not lead outside its folder.
        let (Ok(canonical_root), Ok(canonical)) = (
            tokio::fs::canonicalize(root).await,
            tokio::fs::canonicalize(&full).await,
        ) else {
            return Err(EngineError::NotFound(path.display().to_string()));
        };
        if !canonical.starts_with(&canonical_root) {
            return Err(EngineError::malformed(format!(
                "result path '{}' leads outside the working folder",
                path.display()
            )));
        }
        Ok(canonical)
    }
}

fn not_found(path: &Path, e: std::io::Error) -> EngineError {
    if e.kind() == std::io::ErrorKind::NotFound {
        EngineError::NotFound(path.display().to_string())
    } else {
        EngineError::Io(e)
    }
}

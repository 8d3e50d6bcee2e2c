//! OS resources held on behalf of one task, and their teardown.
//!
//! Teardown order is fixed: kill everything the task user owns, then delete
//! the user, then delete its working folder. Each step is idempotent, so the
//! sandbox and its result set can both drive it without coordinating.

use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use taskbox_types::{Monitor, TemporaryFolder};

use crate::system::{User, kill_by_owner};

/// The account a task runs as.
#[derive(Debug)]
pub(crate) enum Identity {
    /// Created for this task; ours to kill and delete.
    Owned(User),
    /// The worker's own account. Never killed or deleted.
    Ambient(User),
}

#[derive(Debug)]
pub(crate) struct Resources {
    identity: Identity,
    working_folder: PathBuf,
    folder: Mutex<Option<Box<dyn TemporaryFolder>>>,
    user_removed: tokio::sync::Mutex<bool>,
}

impl Resources {
    /// Resources of a task running as a freshly created user in `folder`.
    pub fn owned(user: User, folder: Box<dyn TemporaryFolder>) -> Self {
        Self {
            working_folder: folder.path().to_path_buf(),
            identity: Identity::Owned(user),
            folder: Mutex::new(Some(folder)),
            user_removed: tokio::sync::Mutex::new(false),
        }
    }

    /// Resources of a task running as the worker's user in its home folder.
    pub fn ambient(user: User) -> Self {
        Self {
            working_folder: user.home().to_path_buf(),
            identity: Identity::Ambient(user),
            folder: Mutex::new(None),
            user_removed: tokio::sync::Mutex::new(false),
        }
    }

    #[cfg(test)]
    pub fn with_working_folder(mut self, path: &Path) -> Self {
        self.working_folder = path.to_path_buf();
        self
    }

    pub fn user(&self) -> &User {
        match &self.identity {
            Identity::Owned(user) | Identity::Ambient(user) => user,
        }
    }

    /// The user, if it was created for this task.
    pub fn owned_user(&self) -> Option<&User> {
        match &self.identity {
            Identity::Owned(user) => Some(user),
            Identity::Ambient(_) => None,
        }
    }

    pub fn working_folder(&self) -> &Path {
        &self.working_folder
    }

    /// Kill every process of the owned user. Failures are logged only.
    pub async fn kill_processes(&self, monitor: &Monitor) {
        let Some(user) = self.owned_user() else {
            return;
        };
        // Once the user is gone its uid may belong to someone else.
        let removed = self.user_removed.lock().await;
        if *removed {
            return;
        }
        if let Err(e) = kill_by_owner(user).await {
            monitor.error(format!(
                "Failed to kill processes owned by '{}': {}",
                user.name(),
                e
            ));
        }
    }

    /// Delete the owned user. Harmless to call again once it succeeded.
    pub async fn remove_user(&self) -> io::Result<()> {
        let Some(user) = self.owned_user() else {
            return Ok(());
        };
        let mut removed = self.user_removed.lock().await;
        if *removed {
            return Ok(());
        }
        user.remove().await?;
        *removed = true;
        Ok(())
    }

    /// Delete the owned working folder, at most once.
    pub fn release_folder(&self) -> io::Result<()> {
        let folder = self.folder.lock().take();
        match folder {
            Some(folder) => folder.remove(),
            None => Ok(()),
        }
    }
}

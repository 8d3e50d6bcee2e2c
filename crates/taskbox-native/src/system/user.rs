//! OS user accounts.

use std::ffi::CString;
use std::io;
use std::path::{Path, PathBuf};

use nix::unistd::{self, Gid, Uid};
use tokio::process::Command;
use uuid::Uuid;

/// Prefix of every account created for a task.
const USER_PREFIX: &str = "task_";

/// An OS user account tasks can run as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    name: String,
    uid: Uid,
    gid: Gid,
    home: PathBuf,
}

impl User {
    /// The account the worker itself runs as.
    pub fn current() -> io::Result<Self> {
        let uid = unistd::getuid();
        let entry = unistd::User::from_uid(uid)
            .map_err(io::Error::from)?
            .ok_or_else(|| io::Error::other(format!("no passwd entry for uid {}", uid)))?;
        Ok(Self {
            name: entry.name,
            uid,
            gid: entry.gid,
            home: entry.dir,
        })
    }

    /// Create a fresh account whose home is `home`.
    ///
    /// The account gets a private group of the same name and is added to
    /// `groups`. Ownership of `home` is handed to the new account. On any
    /// failure after the account exists it is removed again.
    pub async fn create(home: &Path, groups: &[String]) -> io::Result<Self> {
        let name = format!("{}{}", USER_PREFIX, &Uuid::new_v4().simple().to_string()[..12]);

        let mut cmd = Command::new("useradd");
        cmd.arg("--no-create-home")
            .arg("--home-dir")
            .arg(home)
            .arg("--shell")
            .arg("/bin/bash")
            .arg("--user-group");
        if !groups.is_empty() {
            cmd.arg("--groups").arg(groups.join(","));
        }
        cmd.arg(&name);
        run(cmd, "useradd").await?;

        let entry = match unistd::User::from_name(&name) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                let _ = delete(&name).await;
                return Err(io::Error::other(format!(
                    "user '{}' missing right after creation",
                    name
                )));
            }
            Err(e) => {
                let _ = delete(&name).await;
                return Err(e.into());
            }
        };

        let user = Self {
            name,
            uid: entry.uid,
            gid: entry.gid,
            home: home.to_path_buf(),
        };
        if let Err(e) = change_owner(home, &user) {
            let _ = delete(&user.name).await;
            return Err(e);
        }

        tracing::debug!(user = %user.name, uid = %user.uid, "created task user");
        Ok(user)
    }

    /// Delete the account. Its home folder is left alone.
    pub async fn remove(&self) -> io::Result<()> {
        delete(&self.name).await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Whether this is the account the worker runs as.
    pub fn is_current(&self) -> bool {
        self.uid == unistd::getuid()
    }

    /// Make `cmd` run as this account, supplementary groups included.
    ///
    /// `Command::uid` alone drops every supplementary group when the worker
    /// is root, so the switch is done by hand in the child. No-op for the
    /// current user.
    pub fn apply_to(&self, cmd: &mut Command) -> io::Result<()> {
        if self.is_current() {
            return Ok(());
        }
        let name = CString::new(self.name.as_str())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let groups = unistd::getgrouplist(&name, self.gid).map_err(io::Error::from)?;
        let (uid, gid) = (self.uid, self.gid);
        // SAFETY: the hook only makes async-signal-safe syscalls.
        unsafe {
            cmd.pre_exec(move || {
                unistd::setgroups(&groups)?;
                unistd::setgid(gid)?;
                unistd::setuid(uid)?;
                Ok(())
            });
        }
        Ok(())
    }
}

/// Hand ownership of `path` to `user`.
pub fn change_owner(path: &Path, user: &User) -> io::Result<()> {
    if user.is_current() {
        return Ok(());
    }
    std::os::unix::fs::chown(path, Some(user.uid.as_raw()), Some(user.gid.as_raw()))
}

/// Hand ownership of `root` and everything below it to `user`.
pub fn change_owner_recursive(root: &Path, user: &User) -> io::Result<()> {
    if user.is_current() {
        return Ok(());
    }
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        // lchown: never follow a symlink out of the tree.
        std::os::unix::fs::lchown(
            entry.path(),
            Some(user.uid.as_raw()),
            Some(user.gid.as_raw()),
        )?;
    }
    Ok(())
}

/// Kill every process owned by `user`.
pub async fn kill_by_owner(user: &User) -> io::Result<()> {
    if user.is_current() {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "refusing to kill every process of the worker's own user",
        ));
    }
    let output = Command::new("pkill")
        .arg("-KILL")
        .arg("-U")
        .arg(user.uid.to_string())
        .output()
        .await?;
    // pkill exits 1 when nothing matched.
    match output.status.code() {
        Some(0) | Some(1) => Ok(()),
        _ => Err(io::Error::other(format!(
            "pkill failed for user '{}': {}",
            user.name,
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
    }
}

async fn delete(name: &str) -> io::Result<()> {
    let mut cmd = Command::new("userdel");
    cmd.arg(name);
    run(cmd, "userdel").await
}

async fn run(mut cmd: Command, what: &str) -> io::Result<()> {
    let output = cmd.output().await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!(
            "{} failed ({}): {}",
            what,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

//! Temporary storage allocation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use uuid::Uuid;

/// Allocator for scratch folders owned by a single task.
pub trait TemporaryStorage: Send + Sync + 'static {
    /// Allocate a fresh, empty folder.
    fn new_folder(&self) -> io::Result<Box<dyn TemporaryFolder>>;
}

/// A scratch folder handed out by a [`TemporaryStorage`].
pub trait TemporaryFolder: Send + Sync + std::fmt::Debug {
    /// Location of the folder.
    fn path(&self) -> &Path;

    /// Delete the folder and everything below it.
    ///
    /// Calling this more than once is harmless.
    fn remove(&self) -> io::Result<()>;
}

/// Temporary storage below a root directory on local disk.
#[derive(Debug, Clone)]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    /// Create storage rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl TemporaryStorage for DiskStorage {
    fn new_folder(&self) -> io::Result<Box<dyn TemporaryFolder>> {
        let path = self.root.join(Uuid::new_v4().simple().to_string());
        fs::create_dir(&path)?;
        tracing::trace!(path = %path.display(), "allocated temporary folder");
        Ok(Box::new(DiskFolder {
            path,
            removed: Mutex::new(false),
        }))
    }
}

#[derive(Debug)]
struct DiskFolder {
    path: PathBuf,
    removed: Mutex<bool>,
}

impl TemporaryFolder for DiskFolder {
    fn path(&self) -> &Path {
        &self.path
    }

    fn remove(&self) -> io::Result<()> {
        let mut removed = self.removed.lock();
        if *removed {
            return Ok(());
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        *removed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_folder_is_unique() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(dir.path().join("tmp")).unwrap();

        let a = storage.new_folder().unwrap();
        let b = storage.new_folder().unwrap();

        assert_ne!(a.path(), b.path());
        assert!(a.path().is_dir());
        assert!(a.path().starts_with(storage.root()));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(dir.path()).unwrap();

        let folder = storage.new_folder().unwrap();
        fs::write(folder.path().join("file.txt"), b"data").unwrap();

        folder.remove().unwrap();
        assert!(!folder.path().exists());
        folder.remove().unwrap();
    }
}

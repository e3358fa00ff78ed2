//! Exclusive stack-root file lock (spec §5): attempting to start a second run
//! in the same root yields `LockError` immediately, never blocks.

use crate::error::{Error, Result};
use fd_lock::{RwLock as FileLock, RwLockWriteGuard};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Held for the lifetime of a run. The lock is released (and the backing
/// file descriptor closed) when this value drops, or at process exit.
pub struct StackLock {
    path: PathBuf,
    // Leaked once per acquisition: the lock's lifetime is the run's lifetime,
    // which for this CLI is bounded by the process anyway.
    _guard: RwLockWriteGuard<'static, File>,
}

impl StackLock {
    /// Non-blocking: fails immediately with `Error::Lock` if another run
    /// already holds the lock, rather than waiting.
    pub fn acquire(stack_root: &Path) -> Result<Self> {
        let dir = stack_root.join(".ktl");
        fs::create_dir_all(&dir)?;
        let path = dir.join("stack.lock");
        let file = OpenOptions::new().create(true).write(true).open(&path)?;

        let lock: &'static mut FileLock<File> = Box::leak(Box::new(FileLock::new(file)));
        let guard = lock
            .try_write()
            .map_err(|_| Error::Lock { path: path.clone(), message: "another run holds the stack lock".into() })?;

        Ok(StackLock { path, _guard: guard })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

//! Cross-process file lock guarding one network's allocation directory.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use tracing::{debug, warn};

use crate::error::{CniError, Result};

/// An advisory `flock(2)` lock on a file.
///
/// Every acquisition opens its own file description, so two guards in the
/// same process contend exactly like two separate plugin processes do.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

/// Held lock. Released when dropped.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is held exclusively.
    pub fn exclusive(&self) -> Result<LockGuard> {
        self.acquire(FlockArg::LockExclusive)
    }

    /// Block until the lock is held shared with other readers.
    pub fn shared(&self) -> Result<LockGuard> {
        self.acquire(FlockArg::LockShared)
    }

    fn acquire(&self, arg: FlockArg) -> Result<LockGuard> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| self.lock_error(e.to_string()))?;

        loop {
            match flock(file.as_raw_fd(), arg) {
                Ok(()) => break,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(self.lock_error(errno.desc())),
            }
        }

        debug!(path = %self.path.display(), ?arg, "acquired lock");
        Ok(LockGuard { file, path: self.path.clone() })
    }

    fn lock_error(&self, reason: impl Into<String>) -> CniError {
        CniError::Lock { path: self.path.clone(), reason: reason.into() }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Closing the descriptor drops the lock too; unlock first so a
        // failure shows up in the logs.
        if let Err(errno) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            warn!(path = %self.path.display(), "failed to unlock: {}", errno);
        }
    }
}

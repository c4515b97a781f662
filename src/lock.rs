//! Single-instance advisory lock.
//!
//! Only one daemon may serve a given socket path. The lock lives on a
//! separate file rather than the socket itself because the socket file is
//! unlinked and recreated on every start, which would silently drop a lock
//! held on the old inode.

use std::fs::File;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::DaemonError;

/// RAII holder of the exclusive instance lock.
///
/// The flock is released when the handle is dropped; the field is never
/// read, it exists solely to keep the lock alive for the daemon's lifetime.
pub struct InstanceLock {
    path: PathBuf,
    _lock_file: File,
}

impl InstanceLock {
    /// Acquire `flock(LOCK_EX | LOCK_NB)` on `path`.
    ///
    /// Returns [`DaemonError::AlreadyRunning`] when another instance holds
    /// the lock; callers are expected to exit 0 on that variant.
    pub fn acquire(path: &Path) -> Result<Self, DaemonError> {
        let lock_file = File::create(path).map_err(|source| DaemonError::Lock {
            path: path.to_path_buf(),
            source,
        })?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| DaemonError::AlreadyRunning {
                path: path.to_path_buf(),
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Path of the lock file, for shutdown cleanup.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

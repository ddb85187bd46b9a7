//! Cross-process advisory file locks.
//!
//! Locks are `flock`-style (via `fs4`), so the kernel releases them when the
//! holding process exits. A holder that crashed therefore never wedges later
//! callers; the only stale state left behind is the lock file itself, which
//! carries the last holder's pid and start time for diagnostics.
//!
//! Lock files are never deleted. Unlinking one while another process has it
//! open would let that process and a newcomer lock different inodes.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs4::FileExt;
use thiserror::Error;
use tracing::{debug, trace};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for lock {path} (held by {holder})")]
    Timeout {
        path: PathBuf,
        waited: Duration,
        holder: String,
    },

    #[error("Lock IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// An exclusive lock on a file, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Try to take the lock without waiting.
    ///
    /// Returns `Ok(None)` if another handle holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        // No truncate here: that would wipe the current holder's details.
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(io_err)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                let mut lock = Self {
                    file,
                    path: path.to_path_buf(),
                };
                lock.write_holder().map_err(io_err)?;
                Ok(Some(lock))
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            #[cfg(windows)]
            Err(err) if matches!(err.raw_os_error(), Some(32 | 33)) => Ok(None),
            Err(err) => Err(io_err(err)),
        }
    }

    /// Wait for the lock, polling until `timeout` elapses.
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let start = Instant::now();
        let mut logged = false;
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                trace!(path = %path.display(), "lock acquired");
                return Ok(lock);
            }
            let waited = start.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited,
                    holder: holder(path).unwrap_or_else(|| "unknown".to_string()),
                });
            }
            if !logged {
                debug!(path = %path.display(), holder = ?holder(path), "waiting for lock");
                logged = true;
            }
            tokio::time::sleep(POLL_INTERVAL.min(timeout - waited)).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_holder(&mut self) -> std::io::Result<()> {
        self.file.set_len(0)?;
        writeln!(
            self.file,
            "pid={} since={}",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        )?;
        self.file.flush()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// The holder line recorded in a lock file, if any.
pub fn holder(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Returns true if some live handle currently holds the lock at `path`.
///
/// Never creates the file or rewrites its holder line.
pub fn is_held(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.unlock();
            false
        }
        Err(err) => {
            err.kind() == ErrorKind::WouldBlock
                || (cfg!(windows) && matches!(err.raw_os_error(), Some(32 | 33)))
        }
    }
}

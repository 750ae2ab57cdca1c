// src/transaction/lock.rs

//! Exclusive lock for operations that modify the system
//!
//! Only one equo process may install or remove packages at a time. The lock
//! is an advisory `flock` on the lock file, which also records the holder's
//! PID for diagnostics.
//!
//! # Example
//!
//! ```ignore
//! use equo::transaction::PidLock;
//!
//! let lock = PidLock::acquire("/var/lib/equo/equo.lock")?;
//! // ... run transactions ...
//! // Lock automatically released on drop
//! ```

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts made after the first one fails
const MAX_RETRIES: u32 = 5;

/// Delay before the first retry; doubled after each attempt
const BASE_DELAY: Duration = Duration::from_millis(100);

/// Held exclusive lock
pub struct PidLock {
    file: File,
    path: PathBuf,
}

impl PidLock {
    /// Acquire the lock, retrying with exponential backoff
    ///
    /// Returns [`Error::LockTimeout`] when another process still holds it
    /// after the last retry.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::acquire_with(path, MAX_RETRIES, BASE_DELAY)
    }

    /// [`PidLock::acquire`] with an explicit retry budget
    pub fn acquire_with<P: AsRef<Path>>(path: P, max_retries: u32, base_delay: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut attempt = 0;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if attempt >= max_retries {
                        warn!(
                            "Lock {} still held by PID {:?}",
                            path.display(),
                            Self::holder_pid(&path)
                        );
                        return Err(Error::LockTimeout {
                            path: path.display().to_string(),
                            attempts: attempt + 1,
                        });
                    }
                    let delay = base_delay * (1 << attempt);
                    debug!(
                        "Lock {} is busy, retrying in {:?} ({})",
                        path.display(),
                        delay,
                        e
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Error::IoError(format!(
                        "Failed to lock {}: {}",
                        path.display(),
                        e
                    )));
                }
            }
        }

        let mut lock = Self { file, path };
        lock.write_pid()?;
        info!("Acquired lock {}", lock.path.display());
        Ok(lock)
    }

    /// Get the path to the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID recorded in a lock file, if any
    pub fn holder_pid<P: AsRef<Path>>(path: P) -> Option<u32> {
        fs::read_to_string(path.as_ref())
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    fn write_pid(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.write_all(std::process::id().to_string().as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        } else {
            debug!("Released lock {}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_writes_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("equo.lock");

        let lock = PidLock::acquire(&path).unwrap();
        assert_eq!(lock.path(), path.as_path());
        assert_eq!(PidLock::holder_pid(&path), Some(std::process::id()));

        drop(lock);
        assert_eq!(PidLock::holder_pid(&path), None);
    }

    #[test]
    fn test_second_holder_times_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/equo.lock");

        let _held = PidLock::acquire(&path).unwrap();
        let err = PidLock::acquire_with(&path, 2, Duration::from_millis(1)).err().unwrap();
        match err {
            Error::LockTimeout { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected LockTimeout, got {:?}", other),
        }
    }

    #[test]
    fn test_lock_is_reusable_after_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("equo.lock");

        drop(PidLock::acquire(&path).unwrap());
        assert!(PidLock::acquire_with(&path, 0, Duration::from_millis(1)).is_ok());
    }
}

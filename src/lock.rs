//! Cross-process file lock guarding the persisted state.
//!
//! Concurrent invocations (different terminals, cron) serialize through an
//! advisory `flock` on a dedicated lock file. Acquisition waits up to a
//! bound and then fails with `LockTimeout`; release happens on drop, on
//! every exit path.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::error::{KongError, Result};

const RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Holds the lock for as long as it is alive.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
}

impl LockGuard {
    /// Acquires an exclusive lock on `path`, retrying non-blocking attempts
    /// until `timeout` elapses.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<LockGuard> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        let deadline = Instant::now() + timeout;
        loop {
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc == 0 {
                return Ok(LockGuard { file });
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EWOULDBLOCK) {
                return Err(err.into());
            }
            if Instant::now() >= deadline {
                return Err(KongError::LockTimeout(path.to_path_buf()));
            }
            std::thread::sleep(RETRY_INTERVAL.min(deadline - Instant::now()));
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

//! Machine-wide mutual exclusion for one authentication at a time.
//!
//! The lock is a whole-file advisory `flock` on a fixed path. The holder's PID
//! is written into the file after acquisition for diagnostics only; the file
//! itself is never removed.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::errors::{AuthError, AuthResult};

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Held lock; released when dropped.
#[derive(Debug)]
pub struct SystemLock {
    file: File,
    path: PathBuf,
}

impl SystemLock {
    /// Waits as long as it takes for the lock.
    pub fn acquire(path: &Path) -> AuthResult<Self> {
        let file = open_lock_file(path)?;
        loop {
            let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if result == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(AuthError::LockFailed {
                path: path.to_path_buf(),
                source: err,
            });
        }
        Ok(Self::held(file, path))
    }

    /// Polls every [`POLL_INTERVAL`] until `timeout` has passed.
    pub fn acquire_timeout(path: &Path, timeout: Duration) -> AuthResult<Self> {
        let file = open_lock_file(path)?;
        let started = Instant::now();
        loop {
            if try_flock_exclusive(&file).map_err(|source| AuthError::LockFailed {
                path: path.to_path_buf(),
                source,
            })? {
                return Ok(Self::held(file, path));
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(AuthError::LockTimeout {
                    path: path.to_path_buf(),
                    waited,
                });
            }
            thread::sleep(POLL_INTERVAL.min(timeout - waited));
        }
    }

    pub fn try_acquire(path: &Path) -> AuthResult<Option<Self>> {
        let file = open_lock_file(path)?;
        let acquired = try_flock_exclusive(&file).map_err(|source| AuthError::LockFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(acquired.then(|| Self::held(file, path)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn held(mut file: File, path: &Path) -> Self {
        if let Err(err) = write_holder_pid(&mut file) {
            warn!(target: "kagami::lock", path = %path.display(), error = %err, "failed to record lock holder");
        }
        debug!(target: "kagami::lock", path = %path.display(), pid = std::process::id(), "system lock acquired");
        Self {
            file,
            path: path.to_path_buf(),
        }
    }
}

impl Drop for SystemLock {
    fn drop(&mut self) {
        let result = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if result != 0 {
            warn!(
                target: "kagami::lock",
                path = %self.path.display(),
                error = %io::Error::last_os_error(),
                "failed to release system lock"
            );
        } else {
            debug!(target: "kagami::lock", path = %self.path.display(), "system lock released");
        }
    }
}

/// PID last written by a holder. The value may be stale once the lock is free.
pub fn holder_pid(path: &Path) -> Option<u32> {
    let mut contents = String::new();
    File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

/// Whether some open file description currently holds the lock. Probes with
/// a shared non-blocking `flock` on a read-only descriptor, so the file is
/// neither created nor rewritten.
pub fn is_held(path: &Path) -> AuthResult<bool> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(source) => {
            return Err(AuthError::LockOpen {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_SH | libc::LOCK_NB) };
    if result == 0 {
        unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        return Ok(false);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(true);
    }
    Err(AuthError::LockFailed {
        path: path.to_path_buf(),
        source: err,
    })
}

fn open_lock_file(path: &Path) -> AuthResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o644)
        .open(path)
        .map_err(|source| AuthError::LockOpen {
            path: path.to_path_buf(),
            source,
        })
}

fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}

fn write_holder_pid(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()
}

//! Host-level run lock
//!
//! Only one pipeline may run against a host at a time. The lock is a PID
//! file that appears with its content already written: the PID goes to a
//! private temp file which is then hard-linked into place, so another
//! process can never observe an empty lock. A lock left behind by a
//! process that no longer exists is taken over.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::error::PreconditionError;

/// Lock file name inside the state directory
const LOCK_FILE_NAME: &str = "hostguard.lock";

/// Lock path for a state directory
pub fn lock_path(state_dir: &Path) -> PathBuf {
    state_dir.join(LOCK_FILE_NAME)
}

/// Per-process file the PID is written to before it becomes the lock
fn staged_lock_path(path: &Path, pid: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}.tmp", pid));
    PathBuf::from(name)
}

/// Read the PID recorded in a lock file
///
/// Returns `Ok(None)` if the file doesn't exist.
pub fn read_lock_pid(path: &Path) -> io::Result<Option<u32>> {
    match fs::File::open(path) {
        Ok(mut file) => {
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            let pid = contents
                .trim()
                .parse::<u32>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            Ok(Some(pid))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if a process with the given PID is still alive
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    // EPERM means the process exists but belongs to someone else
    unsafe {
        let result = libc::kill(pid as libc::pid_t, 0);
        if result == 0 {
            return true;
        }
        let err = std::io::Error::last_os_error();
        err.raw_os_error() == Some(libc::EPERM)
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}

/// Held for the duration of a run; removes the lock file when dropped
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Take the lock at `path` for process `pid`
    pub fn acquire(path: PathBuf, pid: u32) -> Result<Self, PreconditionError> {
        let lock_err = |source: io::Error| PreconditionError::Lock {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(lock_err)?;
        }

        let staged = staged_lock_path(&path, pid);
        fs::write(&staged, format!("{}\n", pid)).map_err(lock_err)?;
        let result = Self::link_into_place(&staged, &path, pid);
        if let Err(e) = fs::remove_file(&staged) {
            tracing::warn!("Failed to remove {:?}: {}", staged, e);
        }
        result
    }

    fn link_into_place(staged: &Path, path: &Path, pid: u32) -> Result<Self, PreconditionError> {
        let lock_err = |source: io::Error| PreconditionError::Lock {
            path: path.to_path_buf(),
            source,
        };

        // one retry after clearing a stale lock
        for _ in 0..2 {
            match fs::hard_link(staged, path) {
                Ok(()) => {
                    tracing::debug!("Acquired run lock {:?}", path);
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    match read_lock_pid(path) {
                        Ok(Some(holder)) if holder != pid && is_process_alive(holder) => {
                            return Err(PreconditionError::Locked {
                                pid: holder,
                                path: path.to_path_buf(),
                            });
                        }
                        Ok(holder) => {
                            tracing::warn!(
                                "Removing stale run lock {:?} (pid {:?} is not running)",
                                path,
                                holder
                            );
                        }
                        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                            tracing::warn!("Removing unreadable run lock {:?}", path);
                        }
                        Err(e) => return Err(lock_err(e)),
                    }
                    match fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(lock_err(e)),
                    }
                }
                Err(e) => return Err(lock_err(e)),
            }
        }

        Err(lock_err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "lock file reappeared while replacing a stale lock",
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove run lock {:?}: {}", self.path, e),
        }
    }
}

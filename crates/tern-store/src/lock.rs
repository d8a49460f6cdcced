//! Single-harness-per-project lock file.
//!
//! The lock file holds the owner's PID. A lock whose PID no longer exists
//! is considered stale and is taken over.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another harness (pid {pid}) is already running for this project; lock file: {path}")]
    Held { pid: u32, path: PathBuf },

    #[error("failed to manage lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Guard for the run lock. The file is removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock at `path`, replacing it if the recorded owner is dead.
    ///
    /// The PID is written to a private file first and then hard-linked into
    /// place, so the lock file never exists without its owner.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        let pid = std::process::id();
        let staged = staging_path(path, pid);
        write_pid(&staged, pid).map_err(io_err)?;

        let result = Self::link(path, &staged, pid);
        let _ = fs::remove_file(&staged);
        result
    }

    fn link(path: &Path, staged: &Path, pid: u32) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        // Two passes: the second runs after a stale lock was removed.
        for _ in 0..2 {
            match fs::hard_link(staged, path) {
                Ok(()) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let owner = read_owner(path);
                    match owner {
                        Some(owner) if owner != pid && process_alive(owner) => {
                            return Err(LockError::Held {
                                pid: owner,
                                path: path.to_path_buf(),
                            });
                        }
                        _ => {
                            // Someone else may have taken over in the meantime.
                            if read_owner(path) != owner {
                                continue;
                            }
                            tracing::warn!(path = %path.display(), owner = ?owner, "removing stale run lock");
                            match fs::remove_file(path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                                Err(e) => return Err(io_err(e)),
                            }
                        }
                    }
                }
                Err(e) => return Err(io_err(e)),
            }
        }

        Err(LockError::Io {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::WouldBlock, "lock contended"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// `<lock>.<pid>.tmp` next to the lock file.
fn staging_path(path: &Path, pid: u32) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{pid}.tmp"));
    path.with_file_name(name)
}

fn write_pid(path: &Path, pid: u32) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    write!(file, "{pid}")?;
    file.sync_all()
}

/// PID recorded in a lock file, if readable.
pub fn read_owner(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether a process with this PID exists. PID 0 never names an owner.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // kill(0, _) signals our own process group and would always succeed.
    if pid == 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let ret = unsafe { libc::kill(pid, 0) };
    if ret == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to someone else.
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(pid: u32) -> bool {
    pid != 0
}

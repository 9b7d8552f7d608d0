//! Singleton enforcement for one endpoint directory (I4, A5).

use crate::error::InterchangeError;
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

pub struct EndpointLock {
    lock_path: PathBuf,
    pid_path: PathBuf,
}

impl EndpointLock {
    /// Acquires the lock, or returns `InterchangeError::LockHeld` if a live
    /// owner already holds it. A lock file left behind by a process that is
    /// no longer alive is reclaimed rather than treated as contention.
    pub fn acquire(lock_path: &Path, pid_path: &Path) -> Result<Self, InterchangeError> {
        match OpenOptions::new().write(true).create_new(true).open(lock_path) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if let Some(owner) = read_owner_pid(pid_path) {
                    if process_is_alive(owner) {
                        return Err(InterchangeError::LockHeld(owner));
                    }
                }
                // stale lock: no readable/alive owner, reclaim it.
                fs::remove_file(lock_path).ok();
                OpenOptions::new().write(true).create_new(true).open(lock_path)?;
            }
            Err(e) => return Err(e.into()),
        }

        let mut pid_file = fs::File::create(pid_path)?;
        write!(pid_file, "{}", std::process::id())?;

        Ok(Self {
            lock_path: lock_path.to_path_buf(),
            pid_path: pid_path.to_path_buf(),
        })
    }

    /// Exposed for the `status` CLI subcommand's liveness probe.
    pub fn pid_is_alive(pid: u32) -> bool {
        process_is_alive(pid)
    }
}

impl Drop for EndpointLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
        let _ = fs::remove_file(&self.pid_path);
    }
}

fn read_owner_pid(pid_path: &Path) -> Option<u32> {
    fs::read_to_string(pid_path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    // Signal 0 performs no-op error checking: ESRCH means the process is
    // gone, EPERM means it's alive but owned by someone else.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM) }
}

#[cfg(not(unix))]
fn process_is_alive(_pid: u32) -> bool {
    // Conservative default off Unix: assume alive so we never steal a lock
    // we can't actually verify.
    true
}

//! Single-instance guard for a state directory.
//!
//! Two runs against the same checkpoint would race each other's cursor, so
//! the pipeline takes `msgrelay.lock` (holding its PID) before touching any
//! state. A lock naming a dead process is taken over.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{ReplError, ReplResult};

/// Lock file name inside the state directory.
pub const LOCK_FILE_NAME: &str = "msgrelay.lock";

/// Held lock; released on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    pid: u32,
}

impl InstanceLock {
    /// Take the lock in `state_dir`, creating the directory if needed.
    pub fn acquire(state_dir: &Path) -> ReplResult<Self> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join(LOCK_FILE_NAME);
        let pid = std::process::id();
        // One takeover attempt: a racing instance that wins the second
        // create_new is reported as running.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(pid.to_string().as_bytes())?;
                    file.sync_all()?;
                    debug!(path = %path.display(), pid, "instance lock acquired");
                    return Ok(Self { path, pid });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    match read_pid(&path)? {
                        Some(holder) if process_alive(holder) => {
                            return Err(ReplError::AlreadyRunning { pid: holder });
                        }
                        holder => {
                            warn!(
                                path = %path.display(),
                                stale_pid = ?holder,
                                "removing stale instance lock"
                            );
                            match fs::remove_file(&path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                                Err(e) => return Err(e.into()),
                            }
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        let holder = read_pid(&path)?.unwrap_or_default();
        Err(ReplError::AlreadyRunning { pid: holder })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID written into the lock.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// PID recorded in a lock file, when one exists and parses.
    pub fn holder(state_dir: &Path) -> ReplResult<Option<u32>> {
        read_pid(&state_dir.join(LOCK_FILE_NAME))
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // Only remove a lock that still names us.
        if matches!(read_pid(&self.path), Ok(Some(pid)) if pid == self.pid) {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to release instance lock");
            }
        }
    }
}

fn read_pid(path: &Path) -> ReplResult<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents.trim().parse().ok()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    pid != 0 && Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn process_alive(pid: u32) -> bool {
    pid != 0
        && std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .output()
            .map(|out| out.status.success())
            .unwrap_or(true)
}

#[cfg(not(unix))]
fn process_alive(pid: u32) -> bool {
    pid != 0
}

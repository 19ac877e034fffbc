//! Single-instance lock beside the database.
//!
//! `codexcord.lock` holds `{pid, token, startedAt, cwd}`. A lock whose pid is
//! no longer alive, or whose content cannot be read, is stale and reclaimed.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

const MAX_ACQUIRE_ATTEMPTS: usize = 5;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another codexcord instance is running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("could not acquire lock {path} after {attempts} attempts")]
    Contended { path: PathBuf, attempts: usize },

    #[error("lock file io: {0}")]
    Io(#[from] io::Error),

    #[error("lock file encode: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockOwner {
    pub pid: u32,
    pub token: String,
    pub started_at: String,
    pub cwd: String,
}

impl LockOwner {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            token: uuid::Uuid::new_v4().to_string(),
            started_at: chrono::Utc::now().to_rfc3339(),
            cwd: std::env::current_dir()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }

    pub fn is_alive(&self) -> bool {
        process_alive(self.pid)
    }
}

/// Held for the life of the process; removes the file on drop if it is
/// still ours.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    owner: LockOwner,
}

impl InstanceLock {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let owner = LockOwner::current();
        let body = serde_json::to_vec_pretty(&owner)?;

        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            match OpenOptions::new().create_new(true).write(true).open(path) {
                Ok(mut file) => {
                    file.write_all(&body)?;
                    file.sync_all()?;
                    info!(
                        component = "lock",
                        event = "lock.acquired",
                        path = %path.display(),
                        pid = owner.pid,
                        "Instance lock acquired"
                    );
                    return Ok(Self {
                        path: path.to_path_buf(),
                        owner,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    let Ok(observed) = fs::read(path) else {
                        continue;
                    };
                    let existing = serde_json::from_slice::<LockOwner>(&observed).ok();
                    match existing {
                        Some(existing) if existing.pid == owner.pid => {
                            // A previous run that reused our pid (common in containers).
                            remove_stale(path, &observed, Some(&existing));
                        }
                        Some(existing) if existing.is_alive() => {
                            return Err(LockError::AlreadyRunning { pid: existing.pid });
                        }
                        existing => remove_stale(path, &observed, existing.as_ref()),
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(LockError::Contended {
            path: path.to_path_buf(),
            attempts: MAX_ACQUIRE_ATTEMPTS,
        })
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let ours = read_owner(&self.path).is_some_and(|current| current.token == self.owner.token);
        if !ours {
            return;
        }
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(
                component = "lock",
                event = "lock.release_failed",
                path = %self.path.display(),
                error = %err,
                "Failed removing instance lock"
            );
        }
    }
}

/// Current holder of the lock at `path`, if the file is readable.
pub fn read_owner(path: &Path) -> Option<LockOwner> {
    let raw = fs::read(path).ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Remove the lock at `path` only if it still holds the `observed` bytes.
///
/// The file is renamed aside first, so of two starters reclaiming the same
/// stale lock only one moves it; if what was moved is a fresh lock written in
/// between, it is linked back into place.
fn remove_stale(path: &Path, observed: &[u8], owner: Option<&LockOwner>) {
    let aside = path.with_extension(format!("stale-{}", uuid::Uuid::new_v4()));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return,
        Err(err) => {
            warn!(
                component = "lock",
                event = "lock.stale_remove_failed",
                path = %path.display(),
                error = %err,
                "Failed moving stale lock aside"
            );
            return;
        }
    }

    let moved = fs::read(&aside).unwrap_or_default();
    if moved == observed {
        warn!(
            component = "lock",
            event = "lock.stale_removed",
            path = %path.display(),
            stale_pid = owner.map(|o| o.pid),
            "Removing stale instance lock"
        );
    } else if let Err(err) = fs::hard_link(&aside, path) {
        warn!(
            component = "lock",
            event = "lock.restore_failed",
            path = %path.display(),
            error = %err,
            "Failed restoring a lock taken while reclaiming"
        );
    }

    if let Err(err) = fs::remove_file(&aside) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(
                component = "lock",
                event = "lock.stale_remove_failed",
                path = %aside.display(),
                error = %err,
                "Failed removing stale lock"
            );
        }
    }
}

pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // kill -0 checks for existence without delivering a signal; EPERM means
    // the process exists under another user.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

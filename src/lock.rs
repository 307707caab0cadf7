//! Serializes runs that publish to the same target.
//!
//! A lock is a file created exclusively under the lock directory, named after
//! the publish target. Overlapping runs wait for it instead of racing to push.
//! The file is removed when the guard drops; a lock left behind by a killed
//! process must be deleted by hand.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::contract::PublishTarget;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSettings {
    #[serde(default = "default_lock_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            dir: default_lock_dir(),
            wait_secs: default_wait_secs(),
        }
    }
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("./work/locks")
}

fn default_wait_secs() -> u64 {
    600
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {waited_secs}s waiting for {path} (remove it if no run is active)")]
    Timeout { path: PathBuf, waited_secs: u64 },
    #[error("lock file error: {0}")]
    Io(#[from] io::Error),
}

/// Held for the duration of a run; releases on drop.
#[derive(Debug)]
pub struct TargetLock {
    path: PathBuf,
}

impl TargetLock {
    pub async fn acquire(
        dir: &Path,
        target: &PublishTarget,
        run_id: Uuid,
        wait: Duration,
    ) -> Result<Self, LockError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.lock", target.key()));
        let start = Instant::now();
        let mut announced = false;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    let lock = Self { path }.stamped(file, run_id)?;
                    info!(target = %target, path = %lock.path.display(), "Acquired publish target lock");
                    return Ok(lock);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if start.elapsed() >= wait {
                        warn!(path = %path.display(), "Gave up waiting for publish target lock");
                        return Err(LockError::Timeout {
                            path,
                            waited_secs: start.elapsed().as_secs(),
                        });
                    }
                    if !announced {
                        info!(target = %target, "Another run holds the publish target, waiting");
                        announced = true;
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Record the owner in the lock file. On failure the guard drops and the
    /// file is removed, so a half-written lock never outlives this call.
    fn stamped<W: Write>(self, mut out: W, run_id: Uuid) -> Result<Self, LockError> {
        writeln!(out, "run_id={run_id}\npid={}", std::process::id())?;
        out.flush()?;
        Ok(self)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Released publish target lock"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to release lock"),
        }
    }
}

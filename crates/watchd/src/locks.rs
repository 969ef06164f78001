//! File-based lock coordination between test-runner processes.
//!
//! Three named locks gate the suite: `execution` (one test run at a time),
//! `queue` (one queue drainer), `browser` (one live browser session).
//! A lock file records its holder's pid and acquisition time; a lock whose
//! holder is no longer alive is stale and is silently reclaimed — the mere
//! existence of a lock file never proves exclusivity.
//!
//! Callers depend on the [`LockStore`] trait; [`FsLockStore`] is the
//! single-host filesystem implementation. A lock-service-backed
//! implementation can slot in behind the same trait for multi-host
//! deployments without touching callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::process::pid_alive;

/// Lock gating test execution.
pub const EXECUTION_LOCK: &str = "execution";
/// Lock gating queue draining.
pub const QUEUE_LOCK: &str = "queue";
/// Lock gating the browser session.
pub const BROWSER_LOCK: &str = "browser";

/// Every lock name the coordinator manages.
pub const ALL_LOCKS: [&str; 3] = [EXECUTION_LOCK, QUEUE_LOCK, BROWSER_LOCK];

#[derive(Debug, Error)]
pub enum LockError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock {name} held by live process {pid}")]
    Held { name: String, pid: u32 },
}

pub type Result<T> = std::result::Result<T, LockError>;

/// Contents of a lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Capability interface for named mutual-exclusion locks.
pub trait LockStore {
    /// Acquire `name` for `pid`. Denied only when the lock is held by a
    /// process that is currently alive; stale locks are overwritten.
    fn acquire(&self, name: &str, pid: u32) -> Result<()>;

    /// Release `name`. Releasing an unheld lock is a no-op.
    fn release(&self, name: &str) -> Result<()>;

    /// Whether `name` exists but its holder is no longer alive.
    fn is_stale(&self, name: &str) -> bool;

    /// Delete every stale lock; returns the names reclaimed.
    fn reclaim_stale(&self) -> Result<Vec<String>>;
}

/// Filesystem-backed lock store for single-host deployments.
#[derive(Debug, Clone)]
pub struct FsLockStore {
    dir: PathBuf,
}

impl FsLockStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.lock"))
    }

    /// Read the holder of a lock, if the file exists and parses.
    pub fn holder(&self, name: &str) -> Option<LockInfo> {
        let content = std::fs::read_to_string(self.lock_path(name)).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn write_lock(&self, path: &Path, info: &LockInfo) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(path, serde_json::to_string_pretty(info).map_err(std::io::Error::other)?)?;
        Ok(())
    }
}

impl LockStore for FsLockStore {
    fn acquire(&self, name: &str, pid: u32) -> Result<()> {
        let path = self.lock_path(name);

        if let Some(holder) = self.holder(name) {
            if holder.pid != pid && pid_alive(holder.pid) {
                return Err(LockError::Held {
                    name: name.to_string(),
                    pid: holder.pid,
                });
            }
            // Stale (or unreadable, handled below) lock: the previous
            // holder crashed without releasing. Self-heal by overwriting.
            if holder.pid != pid {
                info!(name, stale_pid = holder.pid, "reclaiming stale lock");
            }
        }

        let info = LockInfo {
            pid,
            acquired_at: Utc::now(),
        };
        self.write_lock(&path, &info)?;
        debug!(name, pid, "lock acquired");
        Ok(())
    }

    fn release(&self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.lock_path(name)) {
            Ok(()) => {
                debug!(name, "lock released");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_stale(&self, name: &str) -> bool {
        let path = self.lock_path(name);
        if !path.exists() {
            return false;
        }
        match self.holder(name) {
            Some(holder) => !pid_alive(holder.pid),
            // Unreadable lock files count as stale: nobody provably holds them.
            None => true,
        }
    }

    fn reclaim_stale(&self) -> Result<Vec<String>> {
        let mut reclaimed = Vec::new();
        for name in ALL_LOCKS {
            if self.is_stale(name) {
                self.release(name)?;
                info!(name, "reclaimed stale lock at startup");
                reclaimed.push(name.to_string());
            }
        }
        Ok(reclaimed)
    }
}

//! PID-file helpers and process liveness checks.
//!
//! Shared by the supervisor (worker PID file) and the lock coordinator
//! (holder-PID staleness). A PID or lock file is only ever evidence; the
//! live process table is the authority.

use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid pid file contents: {0}")]
    InvalidPid(String),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// Check whether a process with the given pid is currently alive.
///
/// Signal 0 probes existence without delivering anything. Pid 0 and
/// out-of-range values are rejected up front: passed to `kill` they would
/// address a process group, not a process.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Read a pid from a PID file.
pub fn read_pid_file(path: &Path) -> Result<u32> {
    let content = std::fs::read_to_string(path)?;
    content
        .trim()
        .parse::<u32>()
        .map_err(|_| ProcessError::InvalidPid(content.trim().to_string()))
}

/// Write the given pid to a PID file.
pub fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{pid}\n"))?;
    Ok(())
}

/// Remove a PID file if present.
pub fn remove_pid_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Validate an existing PID file against the live process table.
///
/// Returns the pid when the file names a live process. A file naming a dead
/// process, or one that cannot be parsed, is deleted and `None` returned.
pub fn validate_pid_file(path: &Path) -> Result<Option<u32>> {
    if !path.exists() {
        return Ok(None);
    }

    match read_pid_file(path) {
        Ok(pid) if pid_alive(pid) => Ok(Some(pid)),
        Ok(pid) => {
            info!(pid, path = %path.display(), "removing stale pid file");
            remove_pid_file(path)?;
            Ok(None)
        }
        Err(ProcessError::InvalidPid(content)) => {
            info!(content, path = %path.display(), "removing unparseable pid file");
            remove_pid_file(path)?;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

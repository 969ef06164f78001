//! Persisted test queue and the watcher that drains it.
//!
//! The dashboard requests a test run by appending the test name to a small
//! JSON queue document. The watcher polls that document, claims the queue
//! lock, and runs each entry through the configured runner command. The
//! queue file is rewritten after every entry so a crash mid-drain loses at
//! most the test that was in flight; the supervisor resets the queue at
//! startup anyway, so a wedged run never persists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::locks::{LockError, LockStore, QUEUE_LOCK};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("empty runner command")]
    EmptyRunnerCommand,
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// The queue document as persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestQueue {
    #[serde(default)]
    pub queue: Vec<String>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Read the queue document. A missing or corrupt file reads as empty;
/// the queue is advisory state, never worth failing over.
pub fn read_queue(path: &Path) -> TestQueue {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "corrupt queue document, treating as empty");
            TestQueue::default()
        }),
        Err(_) => TestQueue::default(),
    }
}

/// Write the queue document, stamping `last_updated`.
pub fn write_queue(path: &Path, queue: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let doc = TestQueue {
        queue: queue.to_vec(),
        last_updated: Some(Utc::now()),
    };
    std::fs::write(path, serde_json::to_string_pretty(&doc)?)?;
    Ok(())
}

/// Reset the queue to empty. Called at supervisor startup so a crash
/// during a test run never leaves the system wedged on stale entries.
pub fn reset_queue(path: &Path) -> Result<()> {
    write_queue(path, &[])
}

/// Append a test name to the queue.
pub fn enqueue(path: &Path, test_name: &str) -> Result<()> {
    let mut doc = read_queue(path);
    doc.queue.push(test_name.to_string());
    write_queue(path, &doc.queue)
}

/// Background loop that drains the queue by running each requested test.
pub struct QueueWatcher<L: LockStore> {
    queue_file: PathBuf,
    locks: L,
    /// Runner command line; `{test}` is substituted with the test name.
    runner_cmd: Vec<String>,
    poll_interval: Duration,
}

impl<L: LockStore> std::fmt::Debug for QueueWatcher<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWatcher")
            .field("queue_file", &self.queue_file)
            .field("runner_cmd", &self.runner_cmd)
            .finish()
    }
}

impl<L: LockStore> QueueWatcher<L> {
    pub fn new(
        queue_file: PathBuf,
        locks: L,
        runner_cmd: Vec<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue_file,
            locks,
            runner_cmd,
            poll_interval,
        }
    }

    /// Watch the queue until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if self.runner_cmd.is_empty() {
            return Err(QueueError::EmptyRunnerCommand);
        }

        info!(queue = %self.queue_file.display(), "queue watcher started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("queue watcher shutting down");
                    self.locks.release(QUEUE_LOCK)?;
                    return Ok(());
                }
                () = tokio::time::sleep(self.poll_interval) => {}
            }

            if let Err(err) = self.drain(&cancel).await {
                warn!(error = %err, "queue drain failed");
            }
        }
    }

    /// Drain the current queue under the queue lock.
    async fn drain(&self, cancel: &CancellationToken) -> Result<()> {
        let mut doc = read_queue(&self.queue_file);
        if doc.queue.is_empty() {
            return Ok(());
        }

        match self.locks.acquire(QUEUE_LOCK, std::process::id()) {
            Ok(()) => {}
            Err(LockError::Held { pid, .. }) => {
                // Another drainer is live; back off and let it finish.
                tracing::debug!(holder = pid, "queue lock held, skipping drain");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        let result = async {
            while let Some(test_name) = doc.queue.first().cloned() {
                if cancel.is_cancelled() {
                    break;
                }
                self.run_test(&test_name).await;
                doc.queue.remove(0);
                write_queue(&self.queue_file, &doc.queue)?;
            }
            Ok(())
        }
        .await;

        self.locks.release(QUEUE_LOCK)?;
        result
    }

    /// Run one queued test via the runner command. A failing test is an
    /// outcome, not a watcher error.
    async fn run_test(&self, test_name: &str) {
        let argv: Vec<String> = self
            .runner_cmd
            .iter()
            .map(|part| part.replace("{test}", test_name))
            .collect();
        info!(test = test_name, command = ?argv, "running queued test");

        let mut command = tokio::process::Command::new(&argv[0]);
        command.args(&argv[1..]);

        match command.status().await {
            Ok(status) => {
                info!(test = test_name, code = status.code(), "queued test finished");
            }
            Err(err) => {
                warn!(test = test_name, error = %err, "failed to spawn runner");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::FsLockStore;
    use tempfile::TempDir;

    #[test]
    fn queue_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".test_queue.json");

        enqueue(&path, "test_t1_01").unwrap();
        enqueue(&path, "test_t1_02").unwrap();

        let doc = read_queue(&path);
        assert_eq!(doc.queue, vec!["test_t1_01", "test_t1_02"]);
        assert!(doc.last_updated.is_some());
    }

    #[test]
    fn missing_queue_reads_empty() {
        let dir = TempDir::new().unwrap();
        let doc = read_queue(&dir.path().join("absent.json"));
        assert!(doc.queue.is_empty());
    }

    #[test]
    fn corrupt_queue_reads_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".test_queue.json");
        std::fs::write(&path, "{{{{").unwrap();
        assert!(read_queue(&path).queue.is_empty());
    }

    #[test]
    fn reset_empties_queue() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".test_queue.json");
        enqueue(&path, "test_t1_01").unwrap();
        reset_queue(&path).unwrap();
        assert!(read_queue(&path).queue.is_empty());
    }

    #[tokio::test]
    async fn drain_runs_entries_and_empties_queue() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".test_queue.json");
        enqueue(&path, "test_a").unwrap();
        enqueue(&path, "test_b").unwrap();

        let marker_dir = dir.path().join("ran");
        std::fs::create_dir_all(&marker_dir).unwrap();
        let watcher = QueueWatcher::new(
            path.clone(),
            FsLockStore::new(dir.path().join("locks")),
            vec![
                "touch".to_string(),
                marker_dir.join("{test}").to_string_lossy().to_string(),
            ],
            Duration::from_millis(10),
        );

        watcher.drain(&CancellationToken::new()).await.unwrap();

        assert!(read_queue(&path).queue.is_empty());
        assert!(marker_dir.join("test_a").exists());
        assert!(marker_dir.join("test_b").exists());
    }

    #[tokio::test]
    async fn drain_backs_off_when_lock_held_by_live_process() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".test_queue.json");
        enqueue(&path, "test_a").unwrap();

        let locks = FsLockStore::new(dir.path().join("locks"));
        let mut holder = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        locks.acquire(QUEUE_LOCK, holder.id()).unwrap();

        let watcher = QueueWatcher::new(
            path.clone(),
            locks,
            vec!["true".to_string()],
            Duration::from_millis(10),
        );
        watcher.drain(&CancellationToken::new()).await.unwrap();

        // Entry still queued; the other holder owns the drain.
        assert_eq!(read_queue(&path).queue.len(), 1);

        holder.kill().unwrap();
        holder.wait().unwrap();
    }

    #[tokio::test]
    async fn empty_runner_command_is_rejected() {
        let dir = TempDir::new().unwrap();
        let watcher = QueueWatcher::new(
            dir.path().join("q.json"),
            FsLockStore::new(dir.path().join("locks")),
            Vec::new(),
            Duration::from_millis(10),
        );
        let result = watcher.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(QueueError::EmptyRunnerCommand)));
    }
}

//! watchd - QA log-history daemon.
//!
//! Library components for the daemon process: the history store, the
//! aggregation HTTP API, the worker supervisor, and the lock/queue
//! coordinator.

pub mod history;
pub mod locks;
pub mod process;
pub mod queue;
pub mod server;
pub mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use history::HistoryStore;
use locks::{FsLockStore, LockStore};
use queue::QueueWatcher;
use server::AppState;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use watch_core::{Config, ModuleRegistry};

/// Daemon state: the API server plus its background queue watcher.
pub struct Daemon {
    config: Config,
    state: Arc<AppState>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon").finish_non_exhaustive()
    }
}

impl Daemon {
    /// Build a daemon from resolved configuration.
    pub fn new(config: Config) -> Self {
        let registry = ModuleRegistry::from_config(&config);
        let store = Arc::new(HistoryStore::new(config.history_dir.clone()));
        let state = Arc::new(AppState {
            registry,
            store,
            update_timeout: Duration::from_secs(config.update_timeout_sec),
        });
        Self { config, state }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Run the API server (and the queue watcher when configured) until
    /// cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> eyre::Result<()> {
        info!("watchd starting on port {}", self.config.port);
        info!("history dir: {}", self.config.history_dir.display());
        info!("modules: {}", self.config.modules.len());

        let mut watcher_handle = None;
        if !self.config.queue.runner_cmd.is_empty() {
            let watcher = QueueWatcher::new(
                self.config.queue.queue_file.clone(),
                FsLockStore::new(self.config.queue.lock_dir.clone()),
                self.config.queue.runner_cmd.clone(),
                Duration::from_millis(self.config.queue.poll_interval_ms),
            );
            let watcher_cancel = cancel.clone();
            watcher_handle = Some(tokio::spawn(async move {
                if let Err(e) = watcher.run(watcher_cancel).await {
                    warn!("queue watcher error: {}", e);
                }
            }));
        }

        server::start_server(Arc::clone(&self.state), self.config.port, cancel)
            .await
            .map_err(|e| eyre::eyre!("HTTP server error: {e}"))?;

        if let Some(handle) = watcher_handle {
            let _ = handle.await;
        }

        Ok(())
    }
}

/// Startup recovery shared by the supervisor and `reset-locks`: reclaim
/// every stale lock and reset the persisted queue, so a crash during a
/// test run never leaves the system permanently wedged.
pub fn recover_stale_state(config: &Config) -> eyre::Result<Vec<String>> {
    let lock_store = FsLockStore::new(config.queue.lock_dir.clone());
    let reclaimed = lock_store.reclaim_stale()?;
    queue::reset_queue(&config.queue.queue_file)?;
    info!(
        reclaimed = reclaimed.len(),
        queue = %config.queue.queue_file.display(),
        "stale state recovered"
    );
    Ok(reclaimed)
}

/// Default config file location: `./watch.toml`, falling back to the
/// user data dir.
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from("watch.toml");
    if local.exists() {
        return local;
    }
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("watchd")
        .join("watch.toml")
}

/// Load configuration, tolerating a missing file by using defaults.
pub fn load_config(path: &std::path::Path, port_override: Option<u16>) -> eyre::Result<Config> {
    let mut config = if path.exists() {
        Config::from_file(path)?
    } else {
        warn!(path = %path.display(), "config file not found, using defaults");
        Config::default()
    };

    let root = std::env::current_dir()?;
    config.resolve_paths(&root);

    if let Some(port) = port_override {
        config.port = port;
        config.supervisor.port = port;
    }
    Ok(config)
}

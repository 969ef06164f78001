//! Configuration for the daemon, supervisor and queue watcher.
//!
//! Everything is loaded once at startup into an immutable [`Config`] and
//! handed to each component; nothing reads ambient global state afterwards.
//! Precedence: CLI flags > `--config` file > defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("duplicate module id: {0}")]
    DuplicateModule(String),
    #[error("module with empty id")]
    EmptyModuleId,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// One named functional area of the system under test.
///
/// Each module owns a log file and a set of test source files. The source
/// files are scanned for declared test cases so that tests which have never
/// run still show up on the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Stable identifier used in API paths and history filenames.
    pub id: String,
    /// Display name for the dashboard.
    pub name: String,
    /// Log file this module's test runs append to.
    pub log_file: PathBuf,
    /// Test source files scanned for declared test case names.
    #[serde(default)]
    pub test_files: Vec<PathBuf>,
}

/// Supervisor settings for the 24/7 keep-alive loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Port the supervised worker must answer on.
    pub port: u16,
    /// Seconds between health checks.
    pub check_interval_sec: u64,
    /// Seconds to wait after spawning before the first health check.
    pub startup_grace_sec: u64,
    /// Consecutive failed checks before a restart is attempted.
    pub failure_threshold: u32,
    /// Maximum restarts within the restart window before giving up.
    pub max_restarts: usize,
    /// Restart accounting window in seconds.
    pub restart_window_sec: u64,
    /// PID file recording the current worker process.
    pub pid_file: PathBuf,
    /// Worker command line; defaults to serving the API in-process tree.
    pub worker_cmd: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            port: 5001,
            check_interval_sec: 5,
            startup_grace_sec: 3,
            failure_threshold: 2,
            max_restarts: 5,
            restart_window_sec: 3600,
            pid_file: PathBuf::from(".watchd.pid"),
            worker_cmd: vec!["watchd".to_string(), "serve".to_string()],
        }
    }
}

/// Queue watcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Persisted queue document.
    pub queue_file: PathBuf,
    /// Directory holding the named lock files.
    pub lock_dir: PathBuf,
    /// Milliseconds between queue polls.
    pub poll_interval_ms: u64,
    /// Runner command line; `{test}` is replaced with the queued test name.
    /// Empty disables the watcher.
    pub runner_cmd: Vec<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_file: PathBuf::from(".test_queue.json"),
            lock_dir: PathBuf::from("locks"),
            poll_interval_ms: 500,
            runner_cmd: Vec::new(),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP API port (bound to 127.0.0.1).
    pub port: u16,
    /// Directory holding one history document per module.
    pub history_dir: PathBuf,
    /// Budget for a synchronous parse+merge before the caller gets a
    /// retryable error.
    pub update_timeout_sec: u64,
    /// Search-index collection name used by the sync-verification tests.
    /// Injected here because the deployments disagree on the name.
    pub search_collection: Option<String>,
    pub supervisor: SupervisorConfig,
    pub queue: QueueConfig,
    pub modules: Vec<ModuleConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5001,
            history_dir: PathBuf::from("logs/history"),
            update_timeout_sec: 10,
            search_collection: None,
            supervisor: SupervisorConfig::default(),
            queue: QueueConfig::default(),
            modules: Vec::new(),
        }
    }
}

impl Config {
    /// Load config from a TOML file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML content.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for module in &self.modules {
            if module.id.is_empty() {
                return Err(ConfigError::EmptyModuleId);
            }
            if !seen.insert(module.id.as_str()) {
                return Err(ConfigError::DuplicateModule(module.id.clone()));
            }
        }
        Ok(())
    }

    /// Look up a module by id.
    pub fn module(&self, id: &str) -> Option<&ModuleConfig> {
        self.modules.iter().find(|m| m.id == id)
    }

    /// Resolve relative paths against a project root.
    pub fn resolve_paths(&mut self, root: &Path) {
        fn resolve(path: &mut PathBuf, root: &Path) {
            if path.is_relative() {
                *path = root.join(&*path);
            }
        }

        resolve(&mut self.history_dir, root);
        resolve(&mut self.supervisor.pid_file, root);
        resolve(&mut self.queue.queue_file, root);
        resolve(&mut self.queue.lock_dir, root);
        for module in &mut self.modules {
            resolve(&mut module.log_file, root);
            for test_file in &mut module.test_files {
                resolve(test_file, root);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.port, 5001);
        assert_eq!(config.history_dir, PathBuf::from("logs/history"));
        assert_eq!(config.update_timeout_sec, 10);
        assert!(config.search_collection.is_none());
        assert!(config.modules.is_empty());
        assert_eq!(config.supervisor.check_interval_sec, 5);
        assert_eq!(config.supervisor.max_restarts, 5);
        assert_eq!(config.queue.poll_interval_ms, 500);
    }

    #[test]
    fn parse_full_config() {
        let content = r#"
port = 8080
history_dir = "data/history"
search_collection = "jobs_v2"

[supervisor]
port = 8080
check_interval_sec = 2
pid_file = ".server.pid"
worker_cmd = ["watchd", "serve", "--port", "8080"]

[queue]
queue_file = ".queue.json"
runner_cmd = ["pytest", "-k", "{test}"]

[[modules]]
id = "employer"
name = "Employer"
log_file = "logs/employer.log"
test_files = ["tests/employer/test_employer_test_cases.py"]

[[modules]]
id = "jobseeker"
name = "JobSeeker"
log_file = "logs/jobseeker.log"
"#;
        let config = Config::from_toml(content).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.search_collection.as_deref(), Some("jobs_v2"));
        assert_eq!(config.supervisor.check_interval_sec, 2);
        assert_eq!(config.modules.len(), 2);
        assert_eq!(config.module("employer").unwrap().name, "Employer");
        assert!(config.module("jobseeker").unwrap().test_files.is_empty());
        assert!(config.module("missing").is_none());
    }

    #[test]
    fn duplicate_module_id_is_rejected() {
        let content = r#"
[[modules]]
id = "employer"
name = "Employer"
log_file = "logs/employer.log"

[[modules]]
id = "employer"
name = "Employer Again"
log_file = "logs/employer2.log"
"#;
        let result = Config::from_toml(content);
        assert!(matches!(result, Err(ConfigError::DuplicateModule(id)) if id == "employer"));
    }

    #[test]
    fn empty_module_id_is_rejected() {
        let content = r#"
[[modules]]
id = ""
name = "Nameless"
log_file = "logs/x.log"
"#;
        assert!(matches!(
            Config::from_toml(content),
            Err(ConfigError::EmptyModuleId)
        ));
    }

    #[test]
    fn resolve_paths_anchors_relative_paths() {
        let content = r#"
history_dir = "logs/history"

[[modules]]
id = "employer"
name = "Employer"
log_file = "logs/employer.log"
test_files = ["tests/test_a.py", "/abs/test_b.py"]
"#;
        let mut config = Config::from_toml(content).unwrap();
        config.resolve_paths(Path::new("/project"));
        assert_eq!(config.history_dir, PathBuf::from("/project/logs/history"));
        let module = config.module("employer").unwrap();
        assert_eq!(module.log_file, PathBuf::from("/project/logs/employer.log"));
        assert_eq!(module.test_files[0], PathBuf::from("/project/tests/test_a.py"));
        assert_eq!(module.test_files[1], PathBuf::from("/abs/test_b.py"));
    }
}

//! History store: per-module 7-day execution history.
//!
//! One JSON document per module under the history directory, keyed by test
//! name. Merges are idempotent on (test_name, timestamp) and every merge
//! prunes records older than the retention window. Persistence is
//! write-temp-then-rename with a `.backup` copy of the previous document,
//! so a crash mid-write never leaves a half-written main file.
//!
//! Corruption is a recoverable data-loss event, not an error: a document
//! that fails to parse falls back to its backup, and failing that the
//! module restarts from an empty history with a warning the API surfaces.

use chrono::{Duration, NaiveDateTime};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use watch_core::ExecutionRecord;

/// Trailing window of history retained per test case, in days.
pub const RETENTION_DAYS: i64 = 7;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HistoryError>;

/// In-memory form of one module's history document.
pub type ModuleHistory = BTreeMap<String, Vec<ExecutionRecord>>;

/// A loaded history plus the recovery warning, if loading degraded.
#[derive(Debug, Default)]
pub struct LoadedHistory {
    pub tests: ModuleHistory,
    pub warning: Option<String>,
}

/// Counts reported by one merge call.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct MergeReport {
    /// Records newly inserted.
    pub added: usize,
    /// Records already present under the same (test_name, timestamp).
    pub duplicates: usize,
    /// Records evicted for falling outside the retention window.
    pub pruned: usize,
    /// Newly inserted records per test case.
    pub per_test: BTreeMap<String, usize>,
}

/// File-backed store of per-module history documents.
pub struct HistoryStore {
    dir: PathBuf,
    /// One merge gate per module id; unrelated modules update concurrently,
    /// merges into the same module never interleave.
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore").field("dir", &self.dir).finish()
    }
}

impl HistoryStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn history_path(&self, module: &str) -> PathBuf {
        self.dir.join(format!("{module}_history.json"))
    }

    fn backup_path(&self, module: &str) -> PathBuf {
        self.dir.join(format!("{module}_history.json.backup"))
    }

    /// The per-module merge gate. Callers hold the guard across
    /// parse+merge so concurrent update requests for one module serialize.
    pub async fn merge_gate(&self, module: &str) -> Arc<Mutex<()>> {
        let mut gates = self.gates.lock().await;
        Arc::clone(
            gates
                .entry(module.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Load a module's history document.
    ///
    /// Never fails: corruption degrades to the backup, then to an empty
    /// history with a warning.
    pub fn load(&self, module: &str) -> LoadedHistory {
        let main = self.history_path(module);
        match read_document(&main) {
            Ok(Some(tests)) => {
                return LoadedHistory {
                    tests,
                    warning: None,
                }
            }
            Ok(None) => {
                return LoadedHistory::default();
            }
            Err(err) => {
                warn!(module, error = %err, "history document unreadable, trying backup");
            }
        }

        match read_document(&self.backup_path(module)) {
            Ok(Some(tests)) => {
                info!(module, "recovered history from backup");
                LoadedHistory {
                    tests,
                    warning: Some(format!("history for {module} recovered from backup")),
                }
            }
            Ok(None) => LoadedHistory {
                tests: ModuleHistory::new(),
                warning: Some(format!(
                    "history for {module} was corrupt and has been reset"
                )),
            },
            Err(err) => {
                warn!(module, error = %err, "backup also unreadable, starting empty");
                LoadedHistory {
                    tests: ModuleHistory::new(),
                    warning: Some(format!(
                        "history for {module} was corrupt and has been reset"
                    )),
                }
            }
        }
    }

    /// Merge parsed records into a module's history.
    ///
    /// Deduplicates on (test_name, timestamp), prunes everything older than
    /// [`RETENTION_DAYS`] relative to `now`, keeps each test's sequence in
    /// timestamp order, and persists before returning.
    pub fn merge(
        &self,
        module: &str,
        records: &[ExecutionRecord],
        now: NaiveDateTime,
    ) -> Result<MergeReport> {
        let mut history = self.load(module).tests;
        let mut report = MergeReport::default();

        for record in records {
            let entries = history.entry(record.test_name.clone()).or_default();
            if entries.iter().any(|e| e.datetime == record.datetime) {
                report.duplicates += 1;
            } else {
                entries.push(record.clone());
                report.added += 1;
                *report.per_test.entry(record.test_name.clone()).or_default() += 1;
            }
        }

        let cutoff = now - Duration::days(RETENTION_DAYS);
        history.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| e.datetime >= cutoff);
            entries.sort_by(|a, b| a.datetime.cmp(&b.datetime));
            report.pruned += before - entries.len();
            !entries.is_empty()
        });

        self.persist(module, &history)?;
        Ok(report)
    }

    /// Ordered history for one test case; empty if the test has never run.
    /// The warning reflects any recovery that happened on load.
    pub fn get_history(&self, module: &str, test_name: &str) -> (Vec<ExecutionRecord>, Option<String>) {
        let loaded = self.load(module);
        let mut entries = loaded.tests.get(test_name).cloned().unwrap_or_default();
        entries.sort_by(|a, b| a.datetime.cmp(&b.datetime));
        (entries, loaded.warning)
    }

    /// Test names present in the persisted history for a module.
    pub fn test_names(&self, module: &str) -> BTreeSet<String> {
        self.load(module).tests.into_keys().collect()
    }

    /// Persist a module's document atomically, keeping a backup of the
    /// previous version. A transient write failure is retried once before
    /// surfacing.
    fn persist(&self, module: &str, history: &ModuleHistory) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let main = self.history_path(module);
        if main.exists() {
            std::fs::copy(&main, self.backup_path(module))?;
        }

        match self.write_atomic(&main, history) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(module, error = %err, "history write failed, retrying once");
                self.write_atomic(&main, history)
            }
        }
    }

    fn write_atomic(&self, path: &Path, history: &ModuleHistory) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(history)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Read and parse a history document. `Ok(None)` means the file does not
/// exist; a parse failure is an error so the caller can fall back.
fn read_document(path: &Path) -> Result<Option<ModuleHistory>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let tests: ModuleHistory = serde_json::from_str(&content)?;
    Ok(Some(tests))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;
    use watch_core::TestStatus;

    fn ts(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn record(name: &str, status: TestStatus, datetime: NaiveDateTime) -> ExecutionRecord {
        ExecutionRecord::new(name, status, datetime, Some("00:01:20".to_string()))
    }

    fn store() -> (HistoryStore, TempDir) {
        let dir = TempDir::new().unwrap();
        (HistoryStore::new(dir.path().join("history")), dir)
    }

    #[test]
    fn merge_is_idempotent() {
        let (store, _dir) = store();
        let now = ts(2025, 1, 10, 12);
        let records = vec![
            record("test_t1_01", TestStatus::Pass, ts(2025, 1, 10, 9)),
            record("test_t1_02", TestStatus::Fail, ts(2025, 1, 10, 9)),
        ];

        let first = store.merge("employer", &records, now).unwrap();
        assert_eq!(first.added, 2);
        assert_eq!(first.duplicates, 0);
        assert_eq!(first.per_test.get("test_t1_01"), Some(&1));
        assert_eq!(first.per_test.get("test_t1_02"), Some(&1));

        let second = store.merge("employer", &records, now).unwrap();
        assert_eq!(second.added, 0);
        assert_eq!(second.duplicates, 2);

        let (history, warning) = store.get_history("employer", "test_t1_01");
        assert!(warning.is_none());
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn same_test_multiple_runs_per_day_are_distinct() {
        let (store, _dir) = store();
        let now = ts(2025, 1, 10, 12);
        let records = vec![
            record("test_t1_01", TestStatus::Fail, ts(2025, 1, 10, 9)),
            record("test_t1_01", TestStatus::Pass, ts(2025, 1, 10, 11)),
        ];
        store.merge("employer", &records, now).unwrap();

        let (history, _) = store.get_history("employer", "test_t1_01");
        assert_eq!(history.len(), 2);
        // Ordered by timestamp.
        assert_eq!(history[0].status, TestStatus::Fail);
        assert_eq!(history[1].status, TestStatus::Pass);
    }

    #[test]
    fn merge_prunes_outside_retention_window() {
        let (store, _dir) = store();

        // First merge at t0 stores a record that is 6 days old.
        let t0 = ts(2025, 1, 10, 12);
        let old = record("test_t1_01", TestStatus::Pass, ts(2025, 1, 4, 9));
        store.merge("employer", &[old.clone()], t0).unwrap();

        // Second merge five minutes later; by now a record from Jan 2 is
        // beyond the window and must be dropped, while the new one stays.
        let t1 = t0 + Duration::minutes(5);
        let stale = record("test_t1_01", TestStatus::Fail, ts(2025, 1, 2, 9));
        let fresh = record("test_t1_01", TestStatus::Pass, ts(2025, 1, 10, 11));
        let report = store.merge("employer", &[stale, fresh], t1).unwrap();
        assert_eq!(report.added, 2);
        assert_eq!(report.pruned, 1);

        let (history, _) = store.get_history("employer", "test_t1_01");
        let dates: Vec<_> = history.iter().map(|r| r.date.to_string()).collect();
        assert_eq!(dates, vec!["2025-01-04", "2025-01-10"]);
    }

    #[test]
    fn pruning_drops_emptied_tests_entirely() {
        let (store, _dir) = store();
        let old = record("test_gone", TestStatus::Pass, ts(2025, 1, 1, 9));
        store.merge("employer", &[old], ts(2025, 1, 1, 12)).unwrap();

        // A later merge with nothing new prunes the test out of the map.
        store.merge("employer", &[], ts(2025, 1, 20, 12)).unwrap();
        assert!(store.test_names("employer").is_empty());
    }

    #[test]
    fn history_survives_reload_from_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history");
        let now = ts(2025, 1, 10, 12);
        {
            let store = HistoryStore::new(path.clone());
            store
                .merge(
                    "employer",
                    &[record("test_t1_01", TestStatus::Pass, ts(2025, 1, 10, 9))],
                    now,
                )
                .unwrap();
        }

        let store = HistoryStore::new(path);
        let (history, _) = store.get_history("employer", "test_t1_01");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].running_time.as_deref(), Some("00:01:20"));
    }

    #[test]
    fn corrupt_document_falls_back_to_backup() {
        let (store, _dir) = store();
        let now = ts(2025, 1, 10, 12);
        store
            .merge(
                "employer",
                &[record("test_t1_01", TestStatus::Pass, ts(2025, 1, 10, 9))],
                now,
            )
            .unwrap();
        // Second merge creates the backup of the first document.
        store
            .merge(
                "employer",
                &[record("test_t1_02", TestStatus::Fail, ts(2025, 1, 10, 10))],
                now,
            )
            .unwrap();

        std::fs::write(store.history_path("employer"), "{ not json").unwrap();

        let loaded = store.load("employer");
        assert!(loaded.warning.is_some());
        assert!(loaded.tests.contains_key("test_t1_01"));
    }

    #[test]
    fn corrupt_document_without_backup_resets_empty() {
        let (store, _dir) = store();
        std::fs::create_dir_all(store.dir()).unwrap();
        std::fs::write(store.history_path("employer"), "garbage").unwrap();

        let (history, warning) = store.get_history("employer", "test_t1_01");
        assert!(history.is_empty());
        assert!(warning.unwrap().contains("corrupt"));
    }

    #[test]
    fn unknown_test_has_empty_history_without_warning() {
        let (store, _dir) = store();
        let (history, warning) = store.get_history("employer", "test_never_ran");
        assert!(history.is_empty());
        assert!(warning.is_none());
    }

    #[tokio::test]
    async fn merge_gate_is_shared_per_module() {
        let (store, _dir) = store();
        let a = store.merge_gate("employer").await;
        let b = store.merge_gate("employer").await;
        let c = store.merge_gate("jobseeker").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}

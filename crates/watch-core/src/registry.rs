//! Module registry: the read-only view of configured modules.
//!
//! Built once from [`Config`] at startup. Besides plain lookups it scans a
//! module's test source files for declared test cases, so the dashboard can
//! show tests that exist but have never run.

use crate::config::{Config, ModuleConfig};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::warn;

/// Read-only mapping from module id to log source and test declarations.
#[derive(Debug, Clone)]
pub struct ModuleRegistry {
    modules: Vec<ModuleConfig>,
    test_decl: Regex,
}

impl ModuleRegistry {
    pub fn from_config(config: &Config) -> Self {
        Self {
            modules: config.modules.clone(),
            // The suites under watch are pytest files; a test case is any
            // `def test_*` declaration.
            test_decl: Regex::new(r"(?m)^\s*def\s+(test_[A-Za-z0-9_]+)")
                .expect("static regex"),
        }
    }

    pub fn modules(&self) -> &[ModuleConfig] {
        &self.modules
    }

    pub fn get(&self, id: &str) -> Option<&ModuleConfig> {
        self.modules.iter().find(|m| m.id == id)
    }

    /// Test case names declared in the module's test source files.
    ///
    /// Missing or unreadable files are skipped with a warning; declaration
    /// scanning is best-effort and never fails a request.
    pub fn declared_tests(&self, id: &str) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        let Some(module) = self.get(id) else {
            return names;
        };

        for test_file in &module.test_files {
            match std::fs::read_to_string(test_file) {
                Ok(content) => {
                    for capture in self.test_decl.captures_iter(&content) {
                        names.insert(capture[1].to_string());
                    }
                }
                Err(err) => {
                    warn!(
                        module = %module.id,
                        file = %test_file.display(),
                        error = %err,
                        "skipping unreadable test source file"
                    );
                }
            }
        }

        names
    }

    /// Log file path for a module, if the module exists.
    pub fn log_path(&self, id: &str) -> Option<&Path> {
        self.get(id).map(|m| m.log_file.as_path())
    }
}

//! Log parser: raw test log text to execution records.
//!
//! The logs are append-only text written by the suite's own logger in a
//! Robot-Framework-ish shape. The interesting lines:
//!
//! ```text
//! TEST test_t1_01
//! Start: 20250110 09:00:00.123
//! Start / End / Elapsed: 20250110 09:00:00.123 / 20250110 09:01:20.456 / 00:01:20
//! TEST test_t1_01: PASS
//! Runtime for test_t1_01: 12.3 seconds
//! ```
//!
//! Parsing is a single forward pass holding a little pending state (last
//! seen start timestamp and elapsed value). Each line shape has its own
//! matcher; anything that looks like one of them but fails to parse is
//! skipped and counted, never fatal. Re-parsing the same text yields the
//! same records.

use crate::types::{ExecutionRecord, TestStatus};
use chrono::NaiveDateTime;
use regex::Regex;
use std::collections::BTreeSet;
use tracing::debug;

/// Known timestamp layouts, tried in order.
///
/// `Compact` is the logger's native `YYYYMMDD HH:MM:SS[.mmm]`; `Iso` covers
/// the ISO-8601 lines some launchers emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampFormat {
    Compact,
    Iso,
}

impl TimestampFormat {
    pub const ALL: [Self; 2] = [Self::Compact, Self::Iso];

    /// Parse a timestamp string in this layout.
    pub fn parse(self, s: &str) -> Option<NaiveDateTime> {
        let s = s.trim();
        match self {
            Self::Compact => NaiveDateTime::parse_from_str(s, "%Y%m%d %H:%M:%S%.f").ok(),
            Self::Iso => NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
                .ok(),
        }
    }
}

/// Try every known timestamp layout in order.
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    TimestampFormat::ALL.iter().find_map(|f| f.parse(s))
}

/// Result of one parsing pass.
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub records: Vec<ExecutionRecord>,
    /// Lines that matched a known shape but failed to parse.
    pub skipped: usize,
}

/// Parser for one module's log text.
///
/// `fallback` is the timestamp used for records with no parseable `Start:`
/// line nearby; callers pass the log file's modification time.
#[derive(Debug)]
pub struct LogParser {
    fallback: NaiveDateTime,
    /// Declared test names, used to resolve short-name references.
    known_tests: BTreeSet<String>,
    header: Regex,
    result: Regex,
    start: Regex,
    elapsed_triple: Regex,
    runtime_secs: Regex,
    elapsed_inline: Regex,
}

impl LogParser {
    pub fn new(fallback: NaiveDateTime) -> Self {
        Self {
            fallback,
            known_tests: BTreeSet::new(),
            header: Regex::new(r"^TEST\s+(\S+)\s*$").expect("static regex"),
            result: Regex::new(r"TEST\s+([^:]+):\s*([A-Za-z_]+)").expect("static regex"),
            start: Regex::new(r"(?i)Start:\s*(.+)$").expect("static regex"),
            elapsed_triple: Regex::new(
                r"(?i)Start\s*/\s*End\s*/\s*Elapsed:\s*([^/]+)/\s*[^/]+/\s*([0-9:.]+)",
            )
            .expect("static regex"),
            runtime_secs: Regex::new(r"(?i)Runtime for .*?:\s*([0-9.]+)\s+seconds")
                .expect("static regex"),
            elapsed_inline: Regex::new(r"(?i)Elapsed:?\s+([0-9]+:[0-9]{2}:[0-9]{2}(?:\.[0-9]+)?)")
                .expect("static regex"),
        }
    }

    /// Supply declared test names (from the module's source-file scan) so
    /// that log lines referencing a test by short name resolve to the full
    /// declared name.
    pub fn with_known_tests(mut self, known_tests: BTreeSet<String>) -> Self {
        self.known_tests = known_tests;
        self
    }

    /// Resolve a possibly-short test reference against the declared names.
    ///
    /// Used when a log line says `TEST t1_01: PASS` but the suite declares
    /// `test_t1_01_login`. Only an unambiguous match is taken; otherwise
    /// the raw name is kept as observed.
    fn resolve_name(&self, raw: &str) -> String {
        if raw.starts_with("test_") || self.known_tests.contains(raw) {
            return raw.to_string();
        }
        let mut candidates = self
            .known_tests
            .iter()
            .filter(|t| t.as_str() == format!("test_{raw}") || t.contains(raw));
        match (candidates.next(), candidates.next()) {
            (Some(full), None) => full.clone(),
            _ => raw.to_string(),
        }
    }

    /// Parse the full log text into execution records.
    pub fn parse(&self, text: &str) -> ParseOutcome {
        let mut outcome = ParseOutcome::default();
        let mut pending_start: Option<NaiveDateTime> = None;
        let mut pending_elapsed: Option<String> = None;

        for line in text.lines() {
            let line = line.trim_end();

            // `Start / End / Elapsed` carries both a timestamp and timing;
            // it must run before the inline `Elapsed` matcher, which would
            // otherwise grab the trailing field alone.
            if let Some(caps) = self.elapsed_triple.captures(line) {
                match parse_timestamp(&caps[1]) {
                    Some(ts) => pending_start = Some(ts),
                    None => outcome.skipped += 1,
                }
                pending_elapsed = Some(caps[2].trim().to_string());
                continue;
            }

            if let Some(caps) = self.start.captures(line) {
                match parse_timestamp(&caps[1]) {
                    Some(ts) => pending_start = Some(ts),
                    None => {
                        debug!(line, "unparseable Start: timestamp");
                        outcome.skipped += 1;
                    }
                }
                continue;
            }

            if let Some(caps) = self.runtime_secs.captures(line) {
                pending_elapsed = Some(format!("{} seconds", caps[1].trim()));
                continue;
            }

            if let Some(caps) = self.result.captures(line) {
                let name = self.resolve_name(caps[1].trim());
                match TestStatus::parse_token(&caps[2]) {
                    Some(status) => {
                        outcome.records.push(ExecutionRecord::new(
                            name,
                            status,
                            pending_start.unwrap_or(self.fallback),
                            pending_elapsed.take(),
                        ));
                        pending_start = None;
                    }
                    None => {
                        debug!(line, "unknown status token");
                        outcome.skipped += 1;
                    }
                }
                continue;
            }

            if self.header.is_match(line) {
                // Test header opens a fresh context; timing from a previous
                // test must not bleed into this one.
                pending_start = None;
                pending_elapsed = None;
                continue;
            }

            if let Some(caps) = self.elapsed_inline.captures(line) {
                pending_elapsed = Some(caps[1].to_string());
            }

            // Everything else is suite chatter; ignore.
        }

        outcome
    }
}

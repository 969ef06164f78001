//! Core types for the test history suite.
//!
//! The data model is deliberately small: a test execution is a single
//! immutable record, and everything else (history windows, dashboards)
//! is derived from sequences of them.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Outcome of a single test execution.
///
/// `NotRun` is never produced by the log parser; it is synthesized for
/// test cases that are declared in a module's test sources but absent
/// from every log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Pass,
    Fail,
    Error,
    NotRun,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
            Self::NotRun => "NOT_RUN",
        }
    }

    /// Parse a status token from log text (case-insensitive).
    ///
    /// Only tokens a test run can actually emit are accepted; `NOT_RUN`
    /// never appears in logs.
    pub fn parse_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "PASS" => Some(Self::Pass),
            "FAIL" => Some(Self::Fail),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed run of one test case.
///
/// Immutable once created; the history store only ever supersedes records
/// by pruning. `date` is derived from `datetime` and kept denormalized
/// because the persisted documents and the dashboard group by day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub test_name: String,
    pub status: TestStatus,
    pub date: NaiveDate,
    pub datetime: NaiveDateTime,
    /// Elapsed wall-clock as logged (`00:01:20` or `12.3 seconds`).
    /// None when the run was aborted or the log carried no timing.
    pub running_time: Option<String>,
}

impl ExecutionRecord {
    pub fn new(
        test_name: impl Into<String>,
        status: TestStatus,
        datetime: NaiveDateTime,
        running_time: Option<String>,
    ) -> Self {
        Self {
            test_name: test_name.into(),
            status,
            date: datetime.date(),
            datetime,
            running_time,
        }
    }

    /// Composite key on which history merges deduplicate.
    pub fn dedupe_key(&self) -> (&str, NaiveDateTime) {
        (&self.test_name, self.datetime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn status_token_parsing_is_case_insensitive() {
        assert_eq!(TestStatus::parse_token("PASS"), Some(TestStatus::Pass));
        assert_eq!(TestStatus::parse_token("fail"), Some(TestStatus::Fail));
        assert_eq!(TestStatus::parse_token(" Error "), Some(TestStatus::Error));
        assert_eq!(TestStatus::parse_token("SKIP"), None);
        assert_eq!(TestStatus::parse_token("NOT_RUN"), None);
    }

    #[test]
    fn status_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&TestStatus::NotRun).unwrap(),
            "\"NOT_RUN\""
        );
        assert_eq!(serde_json::to_string(&TestStatus::Pass).unwrap(), "\"PASS\"");
    }

    #[test]
    fn record_derives_date_from_datetime() {
        let record = ExecutionRecord::new(
            "test_t1_01",
            TestStatus::Pass,
            ts(2025, 1, 10, 9, 0, 0),
            Some("00:01:20".to_string()),
        );
        assert_eq!(record.date, NaiveDate::from_ymd_opt(2025, 1, 10).unwrap());
        assert_eq!(record.dedupe_key().0, "test_t1_01");
    }

    #[test]
    fn record_round_trips_through_json() {
        let record = ExecutionRecord::new(
            "test_login",
            TestStatus::Fail,
            ts(2025, 1, 10, 9, 0, 0),
            None,
        );
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"date\":\"2025-01-10\""));
        let back: ExecutionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}

//! Task definitions and run records.
//!
//! [`TaskDefinition`]s are owned by the external task store and are
//! read-only here. [`RunRecord`]s are produced once per triggered run and
//! never mutated after they are committed.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::TemplateValue;
use crate::outcome::RunOutcome;

/// Elasticsearch operation performed by a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Search,
    Update,
    BulkUpdate,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Update => "update",
            Self::BulkUpdate => "bulk-update",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "search" => Ok(Self::Search),
            "update" => Ok(Self::Update),
            "bulk-update" | "bulk_update" => Ok(Self::BulkUpdate),
            other => Err(format!("Invalid operation kind: {other}")),
        }
    }
}

/// Accepted hit count for a search task.
///
/// Written as `N` (exactly N), `N-M` (inclusive range), `N-` (at least N)
/// or `-M` (at most M).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExpectedResults {
    pub min: Option<u64>,
    pub max: Option<u64>,
}

impl ExpectedResults {
    pub fn contains(&self, count: u64) -> bool {
        self.min.map_or(true, |min| count >= min) && self.max.map_or(true, |max| count <= max)
    }
}

impl FromStr for ExpectedResults {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parse = |part: &str| -> Result<Option<u64>, String> {
            let part = part.trim();
            if part.is_empty() {
                return Ok(None);
            }
            part.parse::<u64>()
                .map(Some)
                .map_err(|_| format!("invalid expected results bound: '{part}'"))
        };

        let (min, max) = match s.split_once('-') {
            Some((lo, hi)) => (parse(lo)?, parse(hi)?),
            None => {
                let exact = parse(s)?;
                (exact, exact)
            }
        };

        if min.is_none() && max.is_none() {
            return Err(format!("invalid expected results: '{s}'"));
        }
        if let (Some(lo), Some(hi)) = (min, max) {
            if lo > hi {
                return Err(format!("expected results range is inverted: '{s}'"));
            }
        }
        Ok(Self { min, max })
    }
}

impl TryFrom<String> for ExpectedResults {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ExpectedResults> for String {
    fn from(value: ExpectedResults) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ExpectedResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.min, self.max) {
            (Some(lo), Some(hi)) if lo == hi => write!(f, "{lo}"),
            (Some(lo), Some(hi)) => write!(f, "{lo}-{hi}"),
            (Some(lo), None) => write!(f, "{lo}-"),
            (None, Some(hi)) => write!(f, "-{hi}"),
            (None, None) => f.write_str("-"),
        }
    }
}

/// A scheduled Elasticsearch task, as stored by the administration side.
///
/// Field defaults mirror the task file: enabled, no index, no variables.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefinition {
    pub id: String,
    /// Target index or pattern. Falls back to the connection's default index.
    pub index: Option<String>,
    pub operation: OperationKind,
    /// Request body template (JSON with `{{name}}` placeholders).
    pub body: String,
    /// Opaque to the executor; interpreted by the external scheduler.
    pub schedule: Option<String>,
    pub enabled: bool,
    pub expected_results: Option<ExpectedResults>,
    pub log_fields: Vec<String>,
    /// Target document for `update` tasks (template). Without it an update
    /// runs as update-by-query.
    pub document_id: Option<String>,
    /// Static typed variables available to the body template.
    pub variables: BTreeMap<String, TemplateValue>,
}

impl TaskDefinition {
    pub fn new(id: impl Into<String>, operation: OperationKind, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            index: None,
            operation,
            body: body.into(),
            schedule: None,
            enabled: true,
            expected_results: None,
            log_fields: Vec::new(),
            document_id: None,
            variables: BTreeMap::new(),
        }
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }
}

/// Final status persisted for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
    Partial,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Partial => "partial",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "partial" => Ok(Self::Partial),
            other => Err(format!("Invalid run status: {other}")),
        }
    }
}

/// Wall-clock bounds of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTiming {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunTiming {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// Append-only execution record of one triggered run.
///
/// `error_kind` and `error_detail` are present iff `status != Success`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub task_id: String,
    pub triggered_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub error_kind: Option<String>,
    pub error_detail: Option<String>,
    pub affected_documents: u64,
    pub report: Option<String>,
}

impl RunRecord {
    pub fn from_outcome(
        task_id: &str,
        triggered_at: DateTime<Utc>,
        outcome: &RunOutcome,
        timing: RunTiming,
    ) -> Self {
        let status = outcome.status();
        let (error_kind, error_detail) = match (&status, &outcome.error) {
            (RunStatus::Success, _) => (None, None),
            (_, Some(err)) => (Some(err.kind().to_string()), Some(err.to_string())),
            // A non-success outcome always carries an error; keep the
            // record invariant even if one slipped through.
            (_, None) => (
                Some("internal".to_string()),
                Some("run failed without error detail".to_string()),
            ),
        };

        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            triggered_at,
            started_at: timing.started_at,
            finished_at: timing.finished_at,
            status,
            error_kind,
            error_detail,
            affected_documents: outcome.affected_documents,
            report: outcome.report.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, RunError};
    use chrono::TimeZone;

    #[test]
    fn test_operation_kind_serde() {
        let json = serde_json::to_string(&OperationKind::BulkUpdate).unwrap();
        assert_eq!(json, "\"bulk-update\"");
        assert_eq!(
            "bulk-update".parse::<OperationKind>().unwrap(),
            OperationKind::BulkUpdate
        );
        assert!("delete".parse::<OperationKind>().is_err());
    }

    #[test]
    fn test_expected_results_forms() {
        let exact: ExpectedResults = "0".parse().unwrap();
        assert!(exact.contains(0));
        assert!(!exact.contains(1));

        let range: ExpectedResults = "10-20".parse().unwrap();
        assert!(range.contains(10));
        assert!(range.contains(20));
        assert!(!range.contains(21));

        let at_least: ExpectedResults = "5-".parse().unwrap();
        assert!(at_least.contains(500));
        assert!(!at_least.contains(4));

        let at_most: ExpectedResults = "-3".parse().unwrap();
        assert!(at_most.contains(0));
        assert!(!at_most.contains(4));

        assert!("".parse::<ExpectedResults>().is_err());
        assert!("-".parse::<ExpectedResults>().is_err());
        assert!("9-2".parse::<ExpectedResults>().is_err());
        assert!("many".parse::<ExpectedResults>().is_err());
    }

    #[test]
    fn test_expected_results_display_roundtrip() {
        for text in ["7", "1-4", "3-", "-9"] {
            let parsed: ExpectedResults = text.parse().unwrap();
            assert_eq!(parsed.to_string(), text);
        }
    }

    #[test]
    fn test_failed_record_carries_error() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 5, 3, 0, 0).unwrap();
        let timing = RunTiming {
            started_at: t0,
            finished_at: t0 + chrono::Duration::milliseconds(250),
        };
        let outcome = RunOutcome::failed(RunError::from(ConfigError::MissingOption(
            "hosts".into(),
        )));
        let record = RunRecord::from_outcome("nightly", t0, &outcome, timing);

        assert_eq!(record.status, RunStatus::Failure);
        assert_eq!(record.error_kind.as_deref(), Some("config.missing_option"));
        assert!(record.error_detail.unwrap().contains("hosts"));
        assert_eq!(timing.duration_ms(), 250);
    }

    #[test]
    fn test_success_record_has_no_error() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 5, 3, 0, 0).unwrap();
        let timing = RunTiming {
            started_at: t0,
            finished_at: t0,
        };
        let record =
            RunRecord::from_outcome("nightly", t0, &RunOutcome::succeeded(12, None), timing);
        assert_eq!(record.status, RunStatus::Success);
        assert!(record.error_kind.is_none());
        assert!(record.error_detail.is_none());
        assert_eq!(record.affected_documents, 12);
    }
}

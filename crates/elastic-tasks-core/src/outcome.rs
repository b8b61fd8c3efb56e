//! Run state machine and outcome classification.
//!
//! ```text
//! Pending ──Dispatch──▶ Dispatched ──Succeed──────────▶ Succeeded
//!    │                      │────PartiallySucceed──▶ PartiallySucceeded
//!    │                      └────Fail──────────────▶ Failed
//!    └──────────────Fail───────────────────────────▶ Failed
//! ```
//!
//! A run fails from `Pending` when configuration or template resolution
//! breaks before anything is sent to Elasticsearch.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{BulkItemFailure, ExecutionError, RunError};
use crate::models::RunStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Pending,
    Dispatched,
    Succeeded,
    PartiallySucceeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    Dispatch,
    Succeed,
    PartiallySucceed,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid run transition from {from} on {event:?}")]
pub struct InvalidTransition {
    pub from: RunState,
    pub event: RunEvent,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::PartiallySucceeded | Self::Failed
        )
    }

    /// Apply `event`, returning the next state.
    pub fn transition(self, event: RunEvent) -> Result<RunState, InvalidTransition> {
        let next = match (self, event) {
            (Self::Pending, RunEvent::Dispatch) => Self::Dispatched,
            (Self::Pending, RunEvent::Fail) => Self::Failed,
            (Self::Dispatched, RunEvent::Succeed) => Self::Succeeded,
            (Self::Dispatched, RunEvent::PartiallySucceed) => Self::PartiallySucceeded,
            (Self::Dispatched, RunEvent::Fail) => Self::Failed,
            (from, event) => return Err(InvalidTransition { from, event }),
        };
        Ok(next)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Succeeded => "succeeded",
            Self::PartiallySucceeded => "partially_succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Terminal result of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub state: RunState,
    /// Present iff `state != Succeeded`.
    pub error: Option<RunError>,
    pub affected_documents: u64,
    /// Free-form execution report (e.g. logged hit fields).
    pub report: Option<String>,
}

impl RunOutcome {
    pub fn succeeded(affected_documents: u64, report: Option<String>) -> Self {
        Self {
            state: RunState::Succeeded,
            error: None,
            affected_documents,
            report,
        }
    }

    pub fn failed(error: impl Into<RunError>) -> Self {
        Self {
            state: RunState::Failed,
            error: Some(error.into()),
            affected_documents: 0,
            report: None,
        }
    }

    pub fn partially_succeeded(affected_documents: u64, error: ExecutionError) -> Self {
        Self {
            state: RunState::PartiallySucceeded,
            error: Some(error.into()),
            affected_documents,
            report: None,
        }
    }

    pub fn with_report(mut self, report: Option<String>) -> Self {
        self.report = report;
        self
    }

    pub fn status(&self) -> RunStatus {
        match self.state {
            RunState::Succeeded => RunStatus::Success,
            RunState::PartiallySucceeded => RunStatus::Partial,
            _ => RunStatus::Failure,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status() == RunStatus::Failure
    }
}

/// Result of a single item in a bulk response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemResult {
    pub id: String,
    pub status: u16,
    /// `None` when the item succeeded.
    pub error: Option<String>,
}

/// Classify a bulk response.
///
/// `Succeeded` iff every item succeeded, `PartiallySucceeded` when at least
/// one succeeded and one failed, `Failed` when all failed. An empty batch
/// succeeds with zero affected documents.
pub fn aggregate_bulk(items: &[BulkItemResult]) -> RunOutcome {
    let failures: Vec<BulkItemFailure> = items
        .iter()
        .filter_map(|item| {
            item.error.as_ref().map(|reason| BulkItemFailure {
                id: item.id.clone(),
                status: item.status,
                reason: reason.clone(),
            })
        })
        .collect();

    let succeeded = (items.len() - failures.len()) as u64;
    if failures.is_empty() {
        return RunOutcome::succeeded(succeeded, None);
    }

    let error = ExecutionError::BulkItemsFailed {
        total: items.len(),
        failures,
    };
    if succeeded == 0 {
        RunOutcome::failed(error)
    } else {
        RunOutcome::partially_succeeded(succeeded, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(id: &str) -> BulkItemResult {
        BulkItemResult {
            id: id.to_string(),
            status: 200,
            error: None,
        }
    }

    fn failed(id: &str) -> BulkItemResult {
        BulkItemResult {
            id: id.to_string(),
            status: 404,
            error: Some(format!("document_missing_exception: [{id}]: document missing")),
        }
    }

    #[test]
    fn test_transitions() {
        let state = RunState::default();
        assert_eq!(state, RunState::Pending);
        let state = state.transition(RunEvent::Dispatch).unwrap();
        assert_eq!(state, RunState::Dispatched);
        assert_eq!(
            state.transition(RunEvent::PartiallySucceed).unwrap(),
            RunState::PartiallySucceeded
        );
        assert_eq!(
            RunState::Pending.transition(RunEvent::Fail).unwrap(),
            RunState::Failed
        );
    }

    #[test]
    fn test_terminal_states_reject_events() {
        for terminal in [
            RunState::Succeeded,
            RunState::PartiallySucceeded,
            RunState::Failed,
        ] {
            assert!(terminal.is_terminal());
            assert!(terminal.transition(RunEvent::Dispatch).is_err());
            assert!(terminal.transition(RunEvent::Fail).is_err());
        }
        assert!(RunState::Pending.transition(RunEvent::Succeed).is_err());
    }

    #[test]
    fn test_bulk_all_succeed() {
        let outcome = aggregate_bulk(&[ok("1"), ok("2"), ok("3")]);
        assert_eq!(outcome.state, RunState::Succeeded);
        assert_eq!(outcome.affected_documents, 3);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_bulk_one_of_five_fails_is_partial() {
        let outcome = aggregate_bulk(&[ok("1"), ok("2"), failed("3"), ok("4"), ok("5")]);
        assert_eq!(outcome.state, RunState::PartiallySucceeded);
        assert_eq!(outcome.status(), RunStatus::Partial);
        assert_eq!(outcome.affected_documents, 4);

        match outcome.error {
            Some(RunError::Execution(ExecutionError::BulkItemsFailed { total, failures })) => {
                assert_eq!(total, 5);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].id, "3");
                assert!(failures[0].reason.contains("document missing"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_bulk_all_fail() {
        let outcome = aggregate_bulk(&[failed("a"), failed("b")]);
        assert_eq!(outcome.state, RunState::Failed);
        assert_eq!(outcome.affected_documents, 0);
        assert_eq!(outcome.error.unwrap().kind(), "execution.bulk_items");
    }

    #[test]
    fn test_bulk_empty_batch_succeeds() {
        let outcome = aggregate_bulk(&[]);
        assert_eq!(outcome.state, RunState::Succeeded);
        assert_eq!(outcome.affected_documents, 0);
    }
}

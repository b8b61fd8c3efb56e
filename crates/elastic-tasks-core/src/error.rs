//! Error taxonomy for task runs.
//!
//! Every failure a run can hit maps onto one of these types, and every type
//! exposes a stable dotted `kind()` string that is persisted on the
//! [`RunRecord`](crate::models::RunRecord):
//!
//! | Type | Kinds |
//! |------|-------|
//! | [`ConfigError`] | `config.certificate`, `config.missing_option`, `config.invalid_option` |
//! | [`TemplateError`] | `template.unknown_variable`, `template.invalid_format`, `template.malformed_body` |
//! | [`ExecutionError`] | `execution.connection_failed`, `execution.upstream`, `execution.timeout`, `execution.unexpected_results`, `execution.invalid_response`, `execution.bulk_items` |
//! | [`RunError::Internal`] | `internal` |
//!
//! [`RecordingFault`] is not part of [`RunError`]: it never
//! reaches a record, only the log.

use serde::Serialize;
use thiserror::Error;

/// Failure to assemble a client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// CA bundle or client identity missing, unreadable, or unparsable.
    #[error("certificate error: {0}")]
    CertificateError(String),

    /// A required option has no value in any layer.
    #[error("missing option: {0}")]
    MissingOption(String),

    /// An option name is unknown or its value cannot be interpreted.
    #[error("invalid option `{name}`: {reason}")]
    InvalidOption { name: String, reason: String },
}

impl ConfigError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CertificateError(_) => "config.certificate",
            Self::MissingOption(_) => "config.missing_option",
            Self::InvalidOption { .. } => "config.invalid_option",
        }
    }

    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Failure to turn a body template into a request payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unknown template variable `{name}`")]
    UnknownVariable { name: String },

    #[error("invalid template format at offset {offset}: {reason}")]
    InvalidFormat { offset: usize, reason: String },

    /// The template resolved, but the result is not a valid request body.
    #[error("resolved body is malformed: {0}")]
    MalformedBody(String),
}

impl TemplateError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownVariable { .. } => "template.unknown_variable",
            Self::InvalidFormat { .. } => "template.invalid_format",
            Self::MalformedBody(_) => "template.malformed_body",
        }
    }

    pub(crate) fn invalid_format(offset: usize, reason: impl Into<String>) -> Self {
        Self::InvalidFormat {
            offset,
            reason: reason.into(),
        }
    }
}

/// One failed item of a bulk request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkItemFailure {
    /// Document `_id` of the failed item.
    pub id: String,
    /// Per-item HTTP status reported by Elasticsearch.
    pub status: u16,
    /// `error.type: error.reason` as reported by Elasticsearch.
    pub reason: String,
}

/// Failure while talking to Elasticsearch or interpreting its answer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Non-2xx response; `message` is the upstream body, verbatim.
    #[error("upstream error {status}: {message}")]
    UpstreamError { status: u16, message: String },

    #[error("timed out: {0}")]
    Timeout(String),

    /// A search returned a hit count outside the task's expected range.
    #[error("unexpected result count {count}, expected {expected}")]
    UnexpectedResults { count: u64, expected: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("{} of {total} bulk items failed: {}", .failures.len(), format_failures(.failures))]
    BulkItemsFailed {
        total: usize,
        failures: Vec<BulkItemFailure>,
    },
}

fn format_failures(failures: &[BulkItemFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({}): {}", f.id, f.status, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ExecutionError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionFailed(_) => "execution.connection_failed",
            Self::UpstreamError { .. } => "execution.upstream",
            Self::Timeout(_) => "execution.timeout",
            Self::UnexpectedResults { .. } => "execution.unexpected_results",
            Self::InvalidResponse(_) => "execution.invalid_response",
            Self::BulkItemsFailed { .. } => "execution.bulk_items",
        }
    }
}

/// Any error that ends up in a run record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// The run aborted for a reason outside the taxonomy (e.g. a panic).
    #[error("internal error: {0}")]
    Internal(String),
}

impl RunError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(e) => e.kind(),
            Self::Template(e) => e.kind(),
            Self::Execution(e) => e.kind(),
            Self::Internal(_) => "internal",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::Timeout(_)))
    }
}

/// The run record could not be persisted.
///
/// Only ever logged; never propagated to the trigger loop.
#[derive(Debug, Clone, Error)]
#[error("failed to record run of task `{task_id}`: {reason}")]
pub struct RecordingFault {
    pub task_id: String,
    pub reason: String,
}

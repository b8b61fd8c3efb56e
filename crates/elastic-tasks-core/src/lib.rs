//! # Elastic Tasks Core
//!
//! Pure logic for Elastic Tasks: task and run models, the body template
//! resolver, the run state machine, and the run store abstraction.
//!
//! This crate contains no tokio, sqlx, HTTP client, or filesystem I/O.
//! Everything here can be unit tested without an Elasticsearch cluster.

pub mod context;
pub mod error;
pub mod models;
pub mod outcome;
pub mod store;
pub mod template;

pub use context::{RunContext, TemplateValue};
pub use error::{ConfigError, ExecutionError, RecordingFault, RunError, TemplateError};
pub use models::{OperationKind, RunRecord, RunStatus, RunTiming, TaskDefinition};
pub use outcome::{RunOutcome, RunState};
pub use template::{resolve, resolve_task, ResolvedRequest, Template};

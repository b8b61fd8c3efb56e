//! Run record storage abstraction.
//!
//! The [`RunStore`] trait is the interface the executor core needs from the
//! external persistence layer: append-only run records written inside a
//! scoped transaction, plus a per-task run cursor that feeds the
//! `last_run` template variable.
//!
//! Implementations must be `Send + Sync`: a single store is shared by all
//! concurrently running tasks.
//!
//! # Transactions
//!
//! ```text
//! let mut tx = store.begin().await?;
//! tx.append_record(&record).await?;
//! tx.advance_cursor(task_id, trigger).await?;   // non-failed runs only
//! tx.commit().await?;
//! ```
//!
//! A [`RunTransaction`] that is dropped without [`commit`](RunTransaction::commit)
//! must discard every write made through it.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::RunRecord;

/// Abstract storage backend for run records.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`begin`](RunStore::begin) | Open a scoped write transaction |
/// | [`last_cursor`](RunStore::last_cursor) | Trigger time of the last non-failed run |
/// | [`list_records`](RunStore::list_records) | Most recent records of a task, newest first |
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn RunTransaction>>;

    async fn last_cursor(&self, task_id: &str) -> Result<Option<DateTime<Utc>>>;

    async fn list_records(&self, task_id: &str, limit: usize) -> Result<Vec<RunRecord>>;
}

/// Writes staged by one run; applied atomically on commit.
#[async_trait]
pub trait RunTransaction: Send {
    /// Append a record. Records are never updated after commit.
    async fn append_record(&mut self, record: &RunRecord) -> Result<()>;

    /// Move the task's run cursor forward to `cursor`.
    async fn advance_cursor(&mut self, task_id: &str, cursor: DateTime<Utc>) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

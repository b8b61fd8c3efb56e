//! In-memory [`RunStore`] implementation for tests and embedding.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Transactions stage
//! their writes locally and apply them under a single write lock on commit.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::RunRecord;

use super::{RunStore, RunTransaction};

#[derive(Default)]
struct State {
    records: Vec<RunRecord>,
    cursors: HashMap<String, DateTime<Utc>>,
}

/// In-memory run store.
#[derive(Clone, Default)]
pub struct InMemoryRunStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All committed records, in commit order.
    pub fn records(&self) -> Vec<RunRecord> {
        self.state
            .read()
            .map(|s| s.records.clone())
            .unwrap_or_default()
    }
}

enum StagedWrite {
    Record(RunRecord),
    Cursor(String, DateTime<Utc>),
}

struct InMemoryTransaction {
    state: Arc<RwLock<State>>,
    staged: Vec<StagedWrite>,
}

#[async_trait]
impl RunTransaction for InMemoryTransaction {
    async fn append_record(&mut self, record: &RunRecord) -> Result<()> {
        self.staged.push(StagedWrite::Record(record.clone()));
        Ok(())
    }

    async fn advance_cursor(&mut self, task_id: &str, cursor: DateTime<Utc>) -> Result<()> {
        self.staged
            .push(StagedWrite::Cursor(task_id.to_string(), cursor));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|_| anyhow!("run store lock poisoned"))?;
        for write in self.staged {
            match write {
                StagedWrite::Record(record) => state.records.push(record),
                StagedWrite::Cursor(task_id, cursor) => {
                    let entry = state.cursors.entry(task_id).or_insert(cursor);
                    if cursor > *entry {
                        *entry = cursor;
                    }
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn begin(&self) -> Result<Box<dyn RunTransaction>> {
        Ok(Box::new(InMemoryTransaction {
            state: Arc::clone(&self.state),
            staged: Vec::new(),
        }))
    }

    async fn last_cursor(&self, task_id: &str) -> Result<Option<DateTime<Utc>>> {
        let state = self
            .state
            .read()
            .map_err(|_| anyhow!("run store lock poisoned"))?;
        Ok(state.cursors.get(task_id).copied())
    }

    async fn list_records(&self, task_id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let state = self
            .state
            .read()
            .map_err(|_| anyhow!("run store lock poisoned"))?;
        Ok(state
            .records
            .iter()
            .rev()
            .filter(|r| r.task_id == task_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunTiming, RunRecord};
    use crate::outcome::RunOutcome;
    use chrono::TimeZone;

    fn record(task_id: &str, hour: u32) -> RunRecord {
        let t = Utc.with_ymd_and_hms(2024, 3, 5, hour, 0, 0).unwrap();
        RunRecord::from_outcome(
            task_id,
            t,
            &RunOutcome::succeeded(1, None),
            RunTiming {
                started_at: t,
                finished_at: t,
            },
        )
    }

    #[tokio::test]
    async fn test_commit_applies_writes() {
        let store = InMemoryRunStore::new();
        let t = Utc.with_ymd_and_hms(2024, 3, 5, 1, 0, 0).unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.append_record(&record("a", 1)).await.unwrap();
        tx.advance_cursor("a", t).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.records().len(), 1);
        assert_eq!(store.last_cursor("a").await.unwrap(), Some(t));
    }

    #[tokio::test]
    async fn test_drop_discards_writes() {
        let store = InMemoryRunStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.append_record(&record("a", 1)).await.unwrap();
        }
        let mut tx = store.begin().await.unwrap();
        tx.append_record(&record("a", 2)).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.records().is_empty());
        assert_eq!(store.last_cursor("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cursor_never_moves_backwards() {
        let store = InMemoryRunStore::new();
        let late = Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2024, 3, 5, 8, 0, 0).unwrap();

        for cursor in [late, early] {
            let mut tx = store.begin().await.unwrap();
            tx.advance_cursor("a", cursor).await.unwrap();
            tx.commit().await.unwrap();
        }
        assert_eq!(store.last_cursor("a").await.unwrap(), Some(late));
    }

    #[tokio::test]
    async fn test_list_records_newest_first() {
        let store = InMemoryRunStore::new();
        for (task, hour) in [("a", 1), ("b", 2), ("a", 3), ("a", 4)] {
            let mut tx = store.begin().await.unwrap();
            tx.append_record(&record(task, hour)).await.unwrap();
            tx.commit().await.unwrap();
        }

        let listed = store.list_records("a", 2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].triggered_at.format("%H").to_string(), "04");
        assert_eq!(listed[1].triggered_at.format("%H").to_string(), "03");
    }
}

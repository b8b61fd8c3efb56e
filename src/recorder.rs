//! Run recorder: persist exactly one [`RunRecord`] per triggered run.
//!
//! The record and the task cursor are written in one store transaction.
//! Failed outcomes are committed too. Only non-failed runs move the
//! cursor, so `last_run` always refers to a run that did its work.
//!
//! Recording never fails from the caller's point of view. Store errors roll
//! the transaction back and surface as a logged [`RecordingFault`].

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use elastic_tasks_core::error::RecordingFault;
use elastic_tasks_core::models::{RunRecord, RunTiming};
use elastic_tasks_core::outcome::RunOutcome;
use elastic_tasks_core::store::RunStore;
use elastic_tasks_core::TaskDefinition;

#[derive(Clone)]
pub struct RunRecorder {
    store: Arc<dyn RunStore>,
}

impl RunRecorder {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Build and persist the record for one run. Returns the record whether
    /// or not it reached the store.
    pub async fn record(
        &self,
        definition: &TaskDefinition,
        triggered_at: DateTime<Utc>,
        outcome: &RunOutcome,
        timing: RunTiming,
    ) -> RunRecord {
        let record = RunRecord::from_outcome(&definition.id, triggered_at, outcome, timing);

        match self.persist(&record, !outcome.is_failure()).await {
            Ok(()) => {
                tracing::info!(
                    task_id = %record.task_id,
                    run_id = %record.id,
                    status = record.status.as_str(),
                    affected = record.affected_documents,
                    duration_ms = timing.duration_ms(),
                    error_kind = record.error_kind.as_deref().unwrap_or(""),
                    "run recorded"
                );
            }
            Err(e) => {
                let fault = RecordingFault {
                    task_id: record.task_id.clone(),
                    reason: format!("{e:#}"),
                };
                tracing::error!(
                    task_id = %record.task_id,
                    run_id = %record.id,
                    status = record.status.as_str(),
                    "{fault}"
                );
            }
        }
        record
    }

    async fn persist(&self, record: &RunRecord, advance_cursor: bool) -> Result<()> {
        let mut tx = self.store.begin().await?;

        let staged = async {
            tx.append_record(record).await?;
            if advance_cursor {
                tx.advance_cursor(&record.task_id, record.triggered_at).await?;
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;

        match staged {
            Ok(()) => tx.commit().await,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "rollback after failed write also failed");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use elastic_tasks_core::error::{ConfigError, ExecutionError};
    use elastic_tasks_core::models::{OperationKind, RunStatus};
    use elastic_tasks_core::store::memory::InMemoryRunStore;
    use elastic_tasks_core::store::RunTransaction;

    fn timing() -> RunTiming {
        let t = Utc.with_ymd_and_hms(2024, 3, 5, 3, 0, 0).unwrap();
        RunTiming {
            started_at: t,
            finished_at: t + chrono::Duration::milliseconds(40),
        }
    }

    fn definition() -> TaskDefinition {
        TaskDefinition::new("purge", OperationKind::Search, "{}")
    }

    #[tokio::test]
    async fn test_success_commits_and_advances_cursor() {
        let store = InMemoryRunStore::new();
        let recorder = RunRecorder::new(Arc::new(store.clone()));
        let trigger = timing().started_at;

        let record = recorder
            .record(&definition(), trigger, &RunOutcome::succeeded(4, None), timing())
            .await;

        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(store.records(), vec![record]);
        assert_eq!(store.last_cursor("purge").await.unwrap(), Some(trigger));
    }

    #[tokio::test]
    async fn test_failure_commits_without_cursor() {
        let store = InMemoryRunStore::new();
        let recorder = RunRecorder::new(Arc::new(store.clone()));

        let outcome = RunOutcome::failed(ConfigError::MissingOption("hosts".into()));
        let record = recorder
            .record(&definition(), timing().started_at, &outcome, timing())
            .await;

        assert_eq!(record.status, RunStatus::Failure);
        assert_eq!(record.error_kind.as_deref(), Some("config.missing_option"));
        assert_eq!(store.records().len(), 1);
        assert_eq!(store.last_cursor("purge").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_partial_advances_cursor() {
        let store = InMemoryRunStore::new();
        let recorder = RunRecorder::new(Arc::new(store.clone()));

        let outcome = RunOutcome::partially_succeeded(
            2,
            ExecutionError::BulkItemsFailed {
                total: 3,
                failures: vec![],
            },
        );
        recorder
            .record(&definition(), timing().started_at, &outcome, timing())
            .await;
        assert!(store.last_cursor("purge").await.unwrap().is_some());
    }

    /// Accepts the record, then fails while moving the cursor.
    struct BrokenStore {
        inner: InMemoryRunStore,
    }

    struct BrokenTransaction {
        inner: Box<dyn RunTransaction>,
    }

    #[async_trait]
    impl RunTransaction for BrokenTransaction {
        async fn append_record(&mut self, record: &RunRecord) -> Result<()> {
            self.inner.append_record(record).await
        }
        async fn advance_cursor(&mut self, _task_id: &str, _cursor: DateTime<Utc>) -> Result<()> {
            Err(anyhow!("disk full"))
        }
        async fn commit(self: Box<Self>) -> Result<()> {
            self.inner.commit().await
        }
        async fn rollback(self: Box<Self>) -> Result<()> {
            self.inner.rollback().await
        }
    }

    #[async_trait]
    impl RunStore for BrokenStore {
        async fn begin(&self) -> Result<Box<dyn RunTransaction>> {
            Ok(Box::new(BrokenTransaction {
                inner: self.inner.begin().await?,
            }))
        }
        async fn last_cursor(&self, task_id: &str) -> Result<Option<DateTime<Utc>>> {
            self.inner.last_cursor(task_id).await
        }
        async fn list_records(&self, task_id: &str, limit: usize) -> Result<Vec<RunRecord>> {
            self.inner.list_records(task_id, limit).await
        }
    }

    #[tokio::test]
    async fn test_store_error_rolls_back_and_does_not_raise() {
        let inner = InMemoryRunStore::new();
        let recorder = RunRecorder::new(Arc::new(BrokenStore {
            inner: inner.clone(),
        }));

        let record = recorder
            .record(
                &definition(),
                timing().started_at,
                &RunOutcome::succeeded(1, None),
                timing(),
            )
            .await;

        assert_eq!(record.task_id, "purge");
        assert!(inner.records().is_empty());
    }
}

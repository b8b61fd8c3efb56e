//! SQLite-backed [`RunStore`].
//!
//! Timestamps are stored as UTC milliseconds since the epoch. Each
//! [`RunTransaction`] wraps one `sqlx` transaction; dropping it without
//! commit rolls the writes back.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use elastic_tasks_core::models::{RunRecord, RunStatus};
use elastic_tasks_core::store::{RunStore, RunTransaction};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

#[derive(Clone)]
pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl SqliteRunStore {
    /// Wrap a pool whose schema has been migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

struct SqliteRunTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl RunTransaction for SqliteRunTransaction {
    async fn append_record(&mut self, record: &RunRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO run_records (id, task_id, triggered_at, started_at, finished_at, status, \
             error_kind, error_detail, affected_documents, report) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.task_id)
        .bind(record.triggered_at.timestamp_millis())
        .bind(record.started_at.timestamp_millis())
        .bind(record.finished_at.timestamp_millis())
        .bind(record.status.as_str())
        .bind(&record.error_kind)
        .bind(&record.error_detail)
        .bind(i64::try_from(record.affected_documents).unwrap_or(i64::MAX))
        .bind(&record.report)
        .execute(&mut *self.tx)
        .await
        .context("Failed to insert run record")?;
        Ok(())
    }

    async fn advance_cursor(&mut self, task_id: &str, cursor: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO run_cursors (task_id, cursor, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(task_id) DO UPDATE SET \
             cursor = MAX(cursor, excluded.cursor), updated_at = excluded.updated_at",
        )
        .bind(task_id)
        .bind(cursor.timestamp_millis())
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *self.tx)
        .await
        .context("Failed to advance run cursor")?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.context("Failed to commit run")?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {ms}"))
}

fn record_from_row(row: &SqliteRow) -> Result<RunRecord> {
    let status: String = row.get("status");
    let affected: i64 = row.get("affected_documents");
    Ok(RunRecord {
        id: row.get("id"),
        task_id: row.get("task_id"),
        triggered_at: from_millis(row.get("triggered_at"))?,
        started_at: from_millis(row.get("started_at"))?,
        finished_at: from_millis(row.get("finished_at"))?,
        status: status.parse::<RunStatus>().map_err(|e| anyhow!(e))?,
        error_kind: row.get("error_kind"),
        error_detail: row.get("error_detail"),
        affected_documents: u64::try_from(affected).unwrap_or(0),
        report: row.get("report"),
    })
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn begin(&self) -> Result<Box<dyn RunTransaction>> {
        let tx = self.pool.begin().await.context("Failed to open transaction")?;
        Ok(Box::new(SqliteRunTransaction { tx }))
    }

    async fn last_cursor(&self, task_id: &str) -> Result<Option<DateTime<Utc>>> {
        let cursor: Option<i64> =
            sqlx::query_scalar("SELECT cursor FROM run_cursors WHERE task_id = ?")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        cursor.map(from_millis).transpose()
    }

    async fn list_records(&self, task_id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(
            "SELECT id, task_id, triggered_at, started_at, finished_at, status, error_kind, \
             error_detail, affected_documents, report \
             FROM run_records WHERE task_id = ? \
             ORDER BY triggered_at DESC, seq DESC LIMIT ?",
        )
        .bind(task_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }
}

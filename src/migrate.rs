use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the run tables on an open pool. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Append-only run history; `seq` orders records written in the same millisecond
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_records (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            task_id TEXT NOT NULL,
            triggered_at INTEGER NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER NOT NULL,
            status TEXT NOT NULL,
            error_kind TEXT,
            error_detail TEXT,
            affected_documents INTEGER NOT NULL DEFAULT 0,
            report TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Trigger time of the last non-failed run per task
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_cursors (
            task_id TEXT PRIMARY KEY,
            cursor INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_run_records_task ON run_records(task_id, triggered_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

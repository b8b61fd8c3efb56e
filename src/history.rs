//! `estask history`: print the most recent run records of a task.

use anyhow::Result;
use elastic_tasks_core::models::RunRecord;
use elastic_tasks_core::store::RunStore;

pub async fn run_history(store: &dyn RunStore, task_id: &str, limit: usize) -> Result<()> {
    let records = store.list_records(task_id, limit).await?;

    if records.is_empty() {
        println!("No runs recorded for task '{}'.", task_id);
        return Ok(());
    }

    println!(
        "{:<20}  {:<8}  {:>9}  {:>8}  ERROR",
        "TRIGGERED", "STATUS", "AFFECTED", "MS"
    );
    for record in &records {
        println!("{}", format_row(record));
    }
    Ok(())
}

pub fn format_row(record: &RunRecord) -> String {
    let duration = (record.finished_at - record.started_at).num_milliseconds();
    let error = match (&record.error_kind, &record.error_detail) {
        (Some(kind), Some(detail)) => format!("{kind}: {}", first_line(detail)),
        (Some(kind), None) => kind.clone(),
        _ => String::new(),
    };
    format!(
        "{:<20}  {:<8}  {:>9}  {:>8}  {}",
        record.triggered_at.format("%Y-%m-%dT%H:%M:%SZ"),
        record.status.as_str(),
        record.affected_documents,
        duration,
        error
    )
    .trim_end()
    .to_string()
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

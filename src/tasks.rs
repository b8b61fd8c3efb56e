//! `estask tasks`, `estask check`, and `estask render`.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use elastic_tasks_core::models::OperationKind;
use elastic_tasks_core::template::Template;
use serde_json::json;

use crate::config::{ClientOverrides, Config, TaskEntry};
use crate::connection::ConnectionBuilder;
use crate::runner::TaskRunner;

pub fn list_tasks(config: &Config) {
    if config.tasks.is_empty() {
        println!("No tasks configured.");
        return;
    }

    println!(
        "{:<24} {:<12} {:<24} {:<8} SCHEDULE",
        "TASK", "OPERATION", "INDEX", "ENABLED"
    );
    for entry in &config.tasks {
        let def = &entry.definition;
        println!(
            "{:<24} {:<12} {:<24} {:<8} {}",
            def.id,
            def.operation.as_str(),
            def.index.as_deref().unwrap_or("(default)"),
            def.enabled,
            def.schedule.as_deref().unwrap_or("-"),
        );
    }
}

/// Problems with one task's client settings or templates.
pub fn check_task(builder: &ConnectionBuilder, entry: &TaskEntry) -> Vec<String> {
    let mut problems = Vec::new();
    let def = &entry.definition;

    if let Err(e) = builder.build(&entry.connection) {
        problems.push(format!("connection: {e}"));
    }
    if let Err(e) = Template::parse(&def.body) {
        problems.push(format!("body: {e}"));
    }
    if let Some(id) = &def.document_id {
        if let Err(e) = Template::parse(id) {
            problems.push(format!("document_id: {e}"));
        }
    }
    if def.document_id.is_some() && def.operation != OperationKind::Update {
        problems.push("document_id is only used by update tasks".to_string());
    }
    problems
}

/// Validate the base connection and every task without touching the network.
pub fn check_config(config: &Config) -> Result<()> {
    let builder = ConnectionBuilder::from_file_layer(&config.elastic);
    let mut failed = 0;

    match builder.build(&ClientOverrides::default()) {
        Ok(handle) => println!(
            "{:<24} OK ({} host(s), tls {})",
            "[elastic]",
            handle.config().hosts.len(),
            handle.config().tls_mode
        ),
        Err(e) => {
            failed += 1;
            println!("{:<24} ERROR {}", "[elastic]", e);
        }
    }

    for entry in &config.tasks {
        let problems = check_task(&builder, entry);
        if problems.is_empty() {
            println!("{:<24} OK", entry.definition.id);
        } else {
            failed += 1;
            for problem in problems {
                println!("{:<24} ERROR {}", entry.definition.id, problem);
            }
        }
    }

    if failed > 0 {
        bail!("{} configuration problem(s) found", failed);
    }
    Ok(())
}

/// Print the request a run of `entry` would send, without sending it.
pub async fn render_task(
    runner: &TaskRunner,
    entry: &TaskEntry,
    overrides: &ClientOverrides,
    trigger: DateTime<Utc>,
) -> Result<()> {
    let prepared = runner
        .prepare(&entry.definition, trigger, overrides)
        .await?;

    let rendered = json!({
        "task_id": entry.definition.id,
        "operation": entry.definition.operation.as_str(),
        "index": prepared.index,
        "document_id": prepared.request.document_id,
        "body": prepared.request.body,
    });
    println!("{}", serde_json::to_string_pretty(&rendered)?);
    Ok(())
}

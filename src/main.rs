//! # Elastic Tasks CLI (`estask`)
//!
//! Runs configured Elasticsearch tasks once, on demand, and records each
//! run. An external scheduler (cron, systemd timers, a job runner) calls
//! `estask run <id>` or `estask run-all` when tasks are due.
//!
//! ## Usage
//!
//! ```bash
//! estask --config ./config/estask.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `estask init` | Create the SQLite database and run schema migrations |
//! | `estask check` | Validate client settings and task templates (no network) |
//! | `estask tasks` | List configured tasks |
//! | `estask run <id>` | Run one task and record the outcome |
//! | `estask run-all` | Run every enabled task concurrently |
//! | `estask render <id>` | Print the resolved request without sending it |
//! | `estask history <id>` | Show recent runs of a task |
//!
//! ## Examples
//!
//! ```bash
//! # Run against a different cluster for this invocation only
//! estask run purge-sessions --set hosts=https://es-staging:9200 --set tls_mode=verify
//!
//! # Re-run as if triggered at a given time
//! estask run purge-sessions --at 2024-03-05T03:00:00Z
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use elastic_tasks::config::{self, ClientOverrides, Config};
use elastic_tasks::connection::ConnectionBuilder;
use elastic_tasks::executor::CancelSignal;
use elastic_tasks::runner::{RunRequest, TaskRunner};
use elastic_tasks::sqlite_store::SqliteRunStore;
use elastic_tasks::{db, history, logging, migrate, tasks};
use elastic_tasks_core::models::{RunRecord, RunStatus};
use tokio::sync::watch;

/// Elastic Tasks CLI: run scheduled Elasticsearch queries and updates and
/// keep a history of every run.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/estask.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "estask",
    about = "Elastic Tasks: scheduled Elasticsearch queries and updates with recorded runs",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/estask.toml`.
    #[arg(long, global = true, default_value = "./config/estask.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the run tables. Idempotent.
    Init,

    /// Validate the configuration without contacting Elasticsearch.
    ///
    /// Builds the client for `[elastic]` and for every task (loading any
    /// certificates) and parses every body template.
    Check,

    /// List configured tasks.
    Tasks,

    /// Run one task now and record the outcome.
    ///
    /// Exits non-zero when the recorded status is `failure`.
    Run {
        /// Task identifier.
        id: String,
        /// Client option overrides as `key=value` (e.g. `hosts=https://es:9200`).
        #[arg(long = "set", value_parser = parse_key_val)]
        set: Vec<(String, String)>,
        /// Trigger timestamp (RFC 3339). Defaults to now.
        #[arg(long, value_parser = parse_trigger)]
        at: Option<DateTime<Utc>>,
    },

    /// Run every enabled task concurrently.
    RunAll {
        /// Trigger timestamp (RFC 3339). Defaults to now.
        #[arg(long, value_parser = parse_trigger)]
        at: Option<DateTime<Utc>>,
    },

    /// Print the resolved request of a task without sending it.
    Render {
        /// Task identifier.
        id: String,
        /// Client option overrides as `key=value`.
        #[arg(long = "set", value_parser = parse_key_val)]
        set: Vec<(String, String)>,
        /// Trigger timestamp (RFC 3339). Defaults to now.
        #[arg(long, value_parser = parse_trigger)]
        at: Option<DateTime<Utc>>,
    },

    /// Show the most recent runs of a task.
    History {
        /// Task identifier.
        id: String,
        /// Maximum number of runs to show.
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

/// Parse a `key=value` pair for `--set` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn parse_trigger(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 timestamp '{}': {}", s, e))
}

async fn open_store(cfg: &Config) -> Result<SqliteRunStore> {
    let pool = db::connect(cfg).await?;
    migrate::apply(&pool).await?;
    Ok(SqliteRunStore::new(pool))
}

async fn task_runner(cfg: &Config) -> Result<Arc<TaskRunner>> {
    let store = open_store(cfg).await?;
    Ok(Arc::new(TaskRunner::new(
        Arc::new(ConnectionBuilder::from_file_layer(&cfg.elastic)),
        Arc::new(store),
        cfg.runner.clone(),
    )))
}

/// A cancel signal that fires on Ctrl-C.
fn cancel_on_interrupt() -> CancelSignal {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling in-flight runs");
            let _ = tx.send(true);
        }
    });
    rx
}

fn print_record(record: &RunRecord) {
    println!("{:<24} {}", record.task_id, history::format_row(record));
    if let Some(report) = &record.report {
        for line in report.lines() {
            println!("    {}", line);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Check => {
            tasks::check_config(&cfg)?;
        }
        Commands::Tasks => {
            tasks::list_tasks(&cfg);
        }
        Commands::Run { id, set, at } => {
            let entry = cfg
                .task(&id)
                .ok_or_else(|| anyhow!("unknown task '{}'", id))?;
            if !entry.definition.enabled {
                bail!("task '{}' is disabled", id);
            }
            let overrides = entry
                .connection
                .layered(&ClientOverrides::from_named_args(set)?);

            let runner = task_runner(&cfg).await?;
            let record = runner
                .run(
                    &entry.definition,
                    at.unwrap_or_else(Utc::now),
                    &overrides,
                    Some(cancel_on_interrupt()),
                )
                .await;
            print_record(&record);
            if record.status == RunStatus::Failure {
                bail!(
                    "task '{}' failed: {}",
                    id,
                    record.error_detail.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Commands::RunAll { at } => {
            let trigger = at.unwrap_or_else(Utc::now);
            let cancel = cancel_on_interrupt();
            let requests: Vec<RunRequest> = cfg
                .tasks
                .iter()
                .filter(|entry| entry.definition.enabled)
                .map(|entry| {
                    let mut request = RunRequest::new(entry.definition.clone(), trigger)
                        .with_overrides(entry.connection.clone());
                    request.cancel = Some(cancel.clone());
                    request
                })
                .collect();
            if requests.is_empty() {
                println!("No enabled tasks.");
                return Ok(());
            }

            let runner = task_runner(&cfg).await?;
            let records = runner.run_many(requests).await;
            for record in &records {
                print_record(record);
            }
            let failed = records
                .iter()
                .filter(|r| r.status == RunStatus::Failure)
                .count();
            if failed > 0 {
                bail!("{} of {} task(s) failed", failed, records.len());
            }
        }
        Commands::Render { id, set, at } => {
            let entry = cfg
                .task(&id)
                .ok_or_else(|| anyhow!("unknown task '{}'", id))?;
            let overrides = entry
                .connection
                .layered(&ClientOverrides::from_named_args(set)?);
            let runner = task_runner(&cfg).await?;
            tasks::render_task(&runner, entry, &overrides, at.unwrap_or_else(Utc::now)).await?;
        }
        Commands::History { id, limit } => {
            let store = open_store(&cfg).await?;
            history::run_history(&store, &id, limit).await?;
        }
    }

    Ok(())
}

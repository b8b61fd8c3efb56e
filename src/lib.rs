//! # Elastic Tasks
//!
//! Scheduled Elasticsearch query and update tasks with a recorded run
//! history.
//!
//! An external scheduler decides *when* a task is due. This crate handles
//! what happens once it is triggered: build (or reuse) an authenticated
//! client, resolve the task's body template against the run context,
//! perform the search, update, or bulk update, and record exactly one
//! run record in SQLite.
//!
//! ## Architecture
//!
//! ```text
//! trigger ──▶ ┌────────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//!             │ connection │──▶│ template │──▶│ executor │──▶│ recorder │
//!             │  (cached)  │   │ (core)   │   │  (REST)  │   │ (SQLite) │
//!             └────────────┘   └──────────┘   └──────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! estask init                       # create the run database
//! estask check                      # validate client settings and templates
//! estask render stale-sessions      # show the resolved request
//! estask run stale-sessions         # run once and record the outcome
//! estask history stale-sessions
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and layered client settings |
//! | [`connection`] | Client validation, TLS material, handle cache |
//! | [`executor`] | Search / update / bulk-update dispatch |
//! | [`recorder`] | Transactional run recording |
//! | [`runner`] | Run pipeline and concurrency |
//! | [`sqlite_store`] | SQLite run store |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`history`] | Run history listing |
//! | [`tasks`] | Task listing, checks, rendering |
//! | [`logging`] | Tracing setup |

pub mod config;
pub mod connection;
pub mod db;
pub mod executor;
pub mod history;
pub mod logging;
pub mod migrate;
pub mod recorder;
pub mod runner;
pub mod sqlite_store;
pub mod tasks;

//! Run pipeline: connection → template → executor → recorder.
//!
//! [`TaskRunner::run`] performs one triggered run of a task and always
//! returns the [`RunRecord`] it recorded (or tried to record), whatever
//! stage failed. Runs of different tasks may execute concurrently through
//! [`TaskRunner::run_many`]; they share only the cached client handles.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use elastic_tasks_core::context::RunContext;
use elastic_tasks_core::error::RunError;
use elastic_tasks_core::models::{RunRecord, RunTiming, TaskDefinition};
use elastic_tasks_core::outcome::{RunEvent, RunOutcome, RunState};
use elastic_tasks_core::store::RunStore;
use elastic_tasks_core::template::{resolve_task, ResolvedRequest};
use tokio::sync::Semaphore;

use crate::config::{ClientOverrides, RunnerConfig};
use crate::connection::{ClientHandle, ConnectionBuilder};
use crate::executor::{self, CancelSignal};
use crate::recorder::RunRecorder;

/// Everything a run needs before it touches the network.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub handle: Arc<ClientHandle>,
    /// Task index, falling back to the connection's default.
    pub index: Option<String>,
    pub context: RunContext,
    pub request: ResolvedRequest,
}

/// One entry of a [`TaskRunner::run_many`] batch.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub definition: TaskDefinition,
    pub trigger: DateTime<Utc>,
    pub overrides: ClientOverrides,
    pub cancel: Option<CancelSignal>,
}

impl RunRequest {
    pub fn new(definition: TaskDefinition, trigger: DateTime<Utc>) -> Self {
        Self {
            definition,
            trigger,
            overrides: ClientOverrides::default(),
            cancel: None,
        }
    }

    pub fn with_overrides(mut self, overrides: ClientOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

pub struct TaskRunner {
    connections: Arc<ConnectionBuilder>,
    recorder: RunRecorder,
    config: RunnerConfig,
}

impl TaskRunner {
    pub fn new(
        connections: Arc<ConnectionBuilder>,
        store: Arc<dyn RunStore>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            connections,
            recorder: RunRecorder::new(store),
            config,
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionBuilder> {
        &self.connections
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        self.recorder.store()
    }

    /// Build the client handle and resolve the request for one run.
    pub async fn prepare(
        &self,
        definition: &TaskDefinition,
        trigger: DateTime<Utc>,
        overrides: &ClientOverrides,
    ) -> Result<PreparedRun, RunError> {
        let handle = self.connections.build(overrides)?;

        let last_run = self
            .store()
            .last_cursor(&definition.id)
            .await
            .map_err(|e| RunError::Internal(format!("cannot read run cursor: {e:#}")))?;

        let index = definition
            .index
            .clone()
            .or_else(|| handle.default_index().map(String::from));

        let mut context = RunContext::new(&definition.id, trigger).with_last_run(last_run);
        if let Some(index) = &index {
            context = context.with_variable("index", index.as_str());
        }
        let context = context.with_defaults(&definition.variables);

        let request = resolve_task(definition, &context)?;

        Ok(PreparedRun {
            handle,
            index,
            context,
            request,
        })
    }

    /// Execute one triggered run and record it.
    pub async fn run(
        &self,
        definition: &TaskDefinition,
        trigger: DateTime<Utc>,
        overrides: &ClientOverrides,
        cancel: Option<CancelSignal>,
    ) -> RunRecord {
        let started_at = Utc::now();
        let state = RunState::Pending;

        let (state, outcome) = match self.prepare(definition, trigger, overrides).await {
            Err(e) => {
                tracing::warn!(
                    task_id = %definition.id,
                    kind = e.kind(),
                    error = %e,
                    "run aborted before dispatch"
                );
                (state, RunOutcome::failed(e))
            }
            Ok(prepared) => match state.transition(RunEvent::Dispatch) {
                Ok(dispatched) => {
                    tracing::debug!(
                        task_id = %definition.id,
                        operation = %definition.operation,
                        fingerprint = &prepared.handle.fingerprint()[..12],
                        "dispatching"
                    );
                    (dispatched, self.dispatch(definition, prepared, cancel).await)
                }
                Err(e) => (state, RunOutcome::failed(RunError::Internal(e.to_string()))),
            },
        };
        let outcome = settle(state, outcome);

        let timing = RunTiming {
            started_at,
            finished_at: Utc::now(),
        };
        self.recorder
            .record(definition, trigger, &outcome, timing)
            .await
    }

    /// Run the executor on its own task so a panic fails only this run.
    async fn dispatch(
        &self,
        definition: &TaskDefinition,
        prepared: PreparedRun,
        cancel: Option<CancelSignal>,
    ) -> RunOutcome {
        let definition = definition.clone();
        let deadline = Duration::from_secs(self.config.run_timeout_seconds);

        let join = tokio::spawn(async move {
            executor::execute_until(
                &prepared.handle,
                &definition,
                prepared.index.as_deref(),
                &prepared.request,
                deadline,
                cancel,
            )
            .await
        });

        match join.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => RunOutcome::failed(RunError::Internal(format!(
                "executor panicked: {}",
                panic_message(e.into_panic())
            ))),
            Err(e) => RunOutcome::failed(RunError::Internal(e.to_string())),
        }
    }

    /// Run a batch of distinct tasks concurrently, at most
    /// `runner.max_concurrent_runs` at a time. Records come back in input
    /// order.
    pub async fn run_many(self: Arc<Self>, requests: Vec<RunRequest>) -> Vec<RunRecord> {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_runs.max(1)));

        let handles: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let runner = Arc::clone(&self);
                let permits = Arc::clone(&permits);
                let pending = (request.definition.clone(), request.trigger, Utc::now());
                let handle = tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await.ok();
                    runner
                        .run(
                            &request.definition,
                            request.trigger,
                            &request.overrides,
                            request.cancel,
                        )
                        .await
                });
                (pending, handle)
            })
            .collect();

        let mut records = Vec::with_capacity(handles.len());
        for ((definition, trigger, started_at), handle) in handles {
            match handle.await {
                Ok(record) => records.push(record),
                Err(e) => {
                    let reason = if e.is_panic() {
                        format!("run panicked: {}", panic_message(e.into_panic()))
                    } else {
                        e.to_string()
                    };
                    tracing::error!(task_id = %definition.id, %reason, "run task aborted");
                    records.push(
                        self.record_aborted(definition, trigger, started_at, reason)
                            .await,
                    );
                }
            }
        }
        records
    }

    /// Record a run that died outside the executor as an `internal` failure.
    ///
    /// If recording panics too, the unpersisted record is still returned.
    async fn record_aborted(
        self: &Arc<Self>,
        definition: TaskDefinition,
        trigger: DateTime<Utc>,
        started_at: DateTime<Utc>,
        reason: String,
    ) -> RunRecord {
        let outcome = RunOutcome::failed(RunError::Internal(reason));
        let timing = RunTiming {
            started_at,
            finished_at: Utc::now(),
        };

        let runner = Arc::clone(self);
        let (def, failed) = (definition.clone(), outcome.clone());
        let join = tokio::spawn(async move {
            runner.recorder.record(&def, trigger, &failed, timing).await
        });
        match join.await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(task_id = %definition.id, error = %e, "recording aborted run failed");
                RunRecord::from_outcome(&definition.id, trigger, &outcome, timing)
            }
        }
    }
}

/// Check the outcome against the state machine from `state`.
fn settle(state: RunState, outcome: RunOutcome) -> RunOutcome {
    let event = match outcome.state {
        RunState::Succeeded => RunEvent::Succeed,
        RunState::PartiallySucceeded => RunEvent::PartiallySucceed,
        _ => RunEvent::Fail,
    };
    match state.transition(event) {
        Ok(_) => outcome,
        Err(e) => RunOutcome::failed(RunError::Internal(e.to_string())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

//! Execution service: batch-by-batch dispatch and the run lifecycle.
//!
//! `ExecutionService` drives an execution through
//! `running -> {paused <-> running} -> {completed | failed | cancelled}`.
//! Stages of one batch run concurrently via `tokio::JoinSet`, bounded by a
//! semaphore; the next batch starts only after the whole batch settles.
//! Every transition is written to the repository and appended to the event
//! log before it is broadcast.
//!
//! # Control flow
//!
//! 1. `start_execution` plans, snapshots the defaulted definition and creates
//!    one pending step per stage.
//! 2. `run_execution` walks the batches. Gates park the execution in `paused`.
//! 3. `approve_gate` / `reject_gate` / `resume_execution` re-enter dispatch.
//! 4. `cancel_execution` and `pause_execution` set flags the dispatcher checks
//!    between batches, or finalize directly when no dispatcher is active.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::FutureExt;
use serde_json::{Map, Value, json};
use swdl_types::config::GlobalConfig;
use swdl_types::execution::{
    ExecutionEvent, ExecutionEventType, ExecutionOverrides, ExecutionStatus, ExecutionStep,
    StepStatus, WorkflowExecution,
};
use swdl_types::workflow::{
    DEFAULT_AGENT_TIMEOUT, DEFAULT_GATE_TIMEOUT, DEFAULT_WORKFLOW_TIMEOUT, GateTimeoutAction,
    OnFailure, StageDefinition, StageType, WorkflowDefinition,
};
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::workflow::{ExecutionFilter, WorkflowRepository};

use super::context::expression_context;
use super::dag::{Dag, build_dag, compute_execution_batches};
use super::defaults::{apply_defaults, effective_handoff, effective_retry, effective_timeout};
use super::definition::{WorkflowError, validate_definition};
use super::dispatch::{DispatchError, StageDispatcher, StageRequest, package_output};
use super::duration::parse_duration;
use super::expression::{
    ExpressionContext, ExpressionError, evaluate_condition, has_placeholder, resolve_string,
    resolve_value,
};
use super::planner::generate_plan;
use super::retry::RetryHandler;

/// Reason recorded when a gate passes its deadline.
pub const GATE_TIMEOUT_REASON: &str = "gate timed out";

/// Error message of an execution that outlived its workflow timeout.
pub const WORKFLOW_TIMEOUT_MESSAGE: &str = "workflow timed out";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Stages dispatched at once within a batch.
    pub max_concurrency: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self { max_concurrency: 4 }
    }
}

impl From<&GlobalConfig> for ExecutionConfig {
    fn from(config: &GlobalConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency.max(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Control registry
// ---------------------------------------------------------------------------

/// Per-execution control flags. Lives in a `std::sync::Mutex`; the lock is
/// never held across an `.await`.
#[derive(Debug)]
struct ControlEntry {
    token: CancellationToken,
    /// A dispatcher (or a direct finalization) currently owns the execution.
    active: bool,
    pause_requested: bool,
}

impl ControlEntry {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            active: false,
            pause_requested: false,
        }
    }
}

enum StageOutcome {
    Completed,
    Failed { stage_id: String, message: String },
}

// ---------------------------------------------------------------------------
// ExecutionService
// ---------------------------------------------------------------------------

/// Runs workflow executions against a repository and a stage dispatcher.
///
/// Cloning is cheap and shares all state.
pub struct ExecutionService<R, D> {
    repo: Arc<R>,
    dispatcher: Arc<D>,
    bus: EventBus,
    config: ExecutionConfig,
    controls: Arc<Mutex<HashMap<Uuid, ControlEntry>>>,
}

impl<R, D> Clone for ExecutionService<R, D> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
            dispatcher: Arc::clone(&self.dispatcher),
            bus: self.bus.clone(),
            config: self.config,
            controls: Arc::clone(&self.controls),
        }
    }
}

impl<R: WorkflowRepository, D: StageDispatcher> ExecutionService<R, D> {
    pub fn new(repo: Arc<R>, dispatcher: Arc<D>, bus: EventBus, config: ExecutionConfig) -> Self {
        Self {
            repo,
            dispatcher,
            bus,
            config,
            controls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    /// Live feed of every event appended from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.bus.subscribe()
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Start an execution of a stored workflow. The execution is persisted
    /// as `running`; call [`Self::run_execution`] to dispatch it.
    pub async fn start_execution(
        &self,
        workflow_id: &str,
        parameters: BTreeMap<String, Value>,
        overrides: ExecutionOverrides,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let def = self
            .repo
            .get_definition(workflow_id)
            .await?
            .ok_or_else(|| WorkflowError::workflow_not_found(workflow_id))?;
        self.start_definition(&def, parameters, overrides).await
    }

    /// Start an execution of a definition that need not be stored.
    pub async fn start_definition(
        &self,
        def: &WorkflowDefinition,
        parameters: BTreeMap<String, Value>,
        overrides: ExecutionOverrides,
    ) -> Result<WorkflowExecution, WorkflowError> {
        validate_definition(def)?;
        let plan = generate_plan(def, &parameters)?;
        if !plan.validation.valid {
            let messages: Vec<String> = plan
                .validation
                .errors
                .iter()
                .map(|i| format!("{} ({}): {}", i.stage_id, i.field, i.message))
                .collect();
            return Err(WorkflowError::Validation(messages.join("; ")));
        }

        let snapshot = apply_overrides(apply_defaults(def), &overrides)?;
        let steps = plan
            .stages
            .iter()
            .map(|s| ExecutionStep::pending(&s.id, &s.name, s.stage_type, s.batch_index))
            .collect();

        let execution = WorkflowExecution {
            id: Uuid::now_v7(),
            workflow_id: def.id.clone(),
            workflow_name: def.name.clone(),
            status: ExecutionStatus::Running,
            parameters: plan.parameters,
            definition_snapshot: snapshot,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
            steps,
        };

        self.repo.create_execution(&execution).await?;
        self.controls().insert(execution.id, ControlEntry::new());
        self.emit(
            execution.id,
            ExecutionEventType::ExecutionStarted,
            json!({
                "workflow_id": execution.workflow_id,
                "parameters": execution.parameters,
            }),
        )
        .await?;
        self.trigger_hooks(&execution, "on_start").await?;

        tracing::info!(
            execution_id = %execution.id,
            workflow_id = %execution.workflow_id,
            stages = execution.steps.len(),
            "execution started"
        );
        Ok(execution)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Dispatch the remaining batches until the execution settles, pauses or
    /// is cancelled. Terminal executions are returned unchanged.
    pub async fn run_execution(&self, id: Uuid) -> Result<WorkflowExecution, WorkflowError> {
        let Some(token) = self.claim_dispatch(id) else {
            let execution = self.load(id).await?;
            return Err(WorkflowError::InvalidState {
                id,
                status: execution.status,
                operation: "run",
            });
        };

        let execution = match self.load(id).await {
            Ok(execution) => execution,
            Err(e) => {
                self.release_dispatch(id, true);
                return Err(e);
            }
        };
        if execution.status.is_terminal() {
            self.release_dispatch(id, true);
            return Ok(execution);
        }
        if execution.status == ExecutionStatus::Paused {
            self.release_dispatch(id, false);
            return Err(WorkflowError::InvalidState {
                id,
                status: execution.status,
                operation: "run",
            });
        }

        let limit = duration_or(
            &execution.definition_snapshot.config.timeout,
            DEFAULT_WORKFLOW_TIMEOUT,
        );
        let result = match tokio::time::timeout(limit, self.dispatch_batches(id, &token)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(execution_id = %id, limit = ?limit, "workflow timeout reached");
                self.time_out(id).await
            }
        };

        let terminal = match &result {
            Ok(execution) => execution.status.is_terminal(),
            Err(e) => self.settle_after_error(id, e).await,
        };
        self.release_dispatch(id, terminal);
        result
    }

    async fn dispatch_batches(
        &self,
        id: Uuid,
        token: &CancellationToken,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let snapshot = self.load(id).await?.definition_snapshot;
        let dag = build_dag(&snapshot.stages)?;
        let batches = compute_execution_batches(&dag)?;

        for batch in &batches {
            let execution = self.load(id).await?;
            if token.is_cancelled() {
                return self.finalize(execution, ExecutionStatus::Cancelled, None).await;
            }
            if self.take_pause_request(id) {
                return self.pause(execution, json!({ "reason": "requested" })).await;
            }

            let pending: Vec<&str> = batch
                .stage_ids
                .iter()
                .map(String::as_str)
                .filter(|sid| {
                    execution
                        .step(sid)
                        .is_some_and(|s| s.status == StepStatus::Pending)
                })
                .collect();
            if pending.is_empty() {
                continue;
            }

            tracing::debug!(
                execution_id = %id,
                batch = batch.index,
                stages = pending.len(),
                "processing batch"
            );
            self.emit(
                id,
                ExecutionEventType::BatchStarted,
                json!({ "batch": batch.index, "stage_ids": pending }),
            )
            .await?;

            let ctx = expression_context(&execution);
            let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
            let mut join_set = JoinSet::new();
            let mut failures: Vec<(String, String)> = Vec::new();

            // Launch errors stop further launches but still wait for the
            // tasks already spawned.
            let launched: Result<(), WorkflowError> = async {
                for stage_id in pending {
                    let stage = dag.get_stage(stage_id)?.clone();
                    let step = execution
                        .step(stage_id)
                        .cloned()
                        .ok_or_else(|| WorkflowError::StageNotFound(stage_id.to_string()))?;

                    if let Some(condition) = &stage.condition {
                        match evaluate_condition(condition, &ctx) {
                            Ok(true) => {}
                            Ok(false) => {
                                self.skip_step(id, step, "condition evaluated to false").await?;
                                continue;
                            }
                            Err(e) => {
                                let message = format!("condition error: {e}");
                                self.fail_step(id, step, &message, "condition").await?;
                                failures.push((stage.id, message));
                                continue;
                            }
                        }
                    }

                    match stage.stage_type {
                        StageType::Gate => self.open_gate(id, &stage, step).await?,
                        StageType::Agent | StageType::FanOut => {
                            let runner = self.clone();
                            let semaphore = Arc::clone(&semaphore);
                            let ctx = ctx.clone();
                            let token = token.clone();
                            let workflow_id = execution.workflow_id.clone();
                            let env = snapshot.config.env.clone();
                            join_set.spawn(async move {
                                let _permit = semaphore.acquire_owned().await;
                                let fallback = step.clone();
                                let run = runner.run_stage(id, &workflow_id, &stage, step, &ctx, env, &token);
                                match AssertUnwindSafe(run).catch_unwind().await {
                                    Ok(outcome) => outcome,
                                    Err(_) => {
                                        let message = "stage task panicked".to_string();
                                        runner.fail_step(id, fallback, &message, "panic").await?;
                                        Ok::<_, WorkflowError>(StageOutcome::Failed {
                                            stage_id: stage.id.clone(),
                                            message,
                                        })
                                    }
                                }
                            });
                        }
                    }
                }
                Ok(())
            }
            .await;

            // Siblings run to completion even when one task errors.
            let mut task_error = None;
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(Ok(StageOutcome::Completed)) => {}
                    Ok(Ok(StageOutcome::Failed { stage_id, message })) => {
                        failures.push((stage_id, message));
                    }
                    Ok(Err(e)) => {
                        tracing::error!(execution_id = %id, error = %e, "stage task failed");
                        task_error.get_or_insert(e);
                    }
                    Err(e) => tracing::error!(execution_id = %id, error = %e, "stage task aborted"),
                }
            }
            launched?;
            if let Some(e) = task_error {
                return Err(e);
            }

            if token.is_cancelled() {
                let execution = self.load(id).await?;
                return self.finalize(execution, ExecutionStatus::Cancelled, None).await;
            }

            failures.sort_by_key(|(sid, _)| snapshot.stages.iter().position(|s| &s.id == sid));
            let mut halt = None;
            for (stage_id, message) in failures {
                match on_failure_of(dag.get_stage(&stage_id)?) {
                    OnFailure::Halt => {
                        if halt.is_none() {
                            halt = Some(format!("stage '{stage_id}' failed: {message}"));
                        }
                    }
                    OnFailure::Continue => {}
                    OnFailure::SkipDependents => self.skip_dependents(id, &dag, &stage_id).await?,
                }
            }

            if let Some(reason) = halt {
                return self.fail_execution(id, &reason, "halt").await;
            }
            let execution = self.load(id).await?;
            let waiting: Vec<String> = execution
                .waiting_gates()
                .map(|s| s.stage_id.clone())
                .collect();
            if !waiting.is_empty() {
                return self
                    .pause(execution, json!({ "reason": "gate", "stage_ids": waiting }))
                    .await;
            }
        }

        let execution = self.load(id).await?;
        self.finalize(execution, ExecutionStatus::Completed, None).await
    }

    /// One agent/fan_out step: resolve inputs, dispatch with retries, store
    /// the packaged output.
    #[allow(clippy::too_many_arguments)]
    async fn run_stage(
        &self,
        id: Uuid,
        workflow_id: &str,
        stage: &StageDefinition,
        mut step: ExecutionStep,
        ctx: &ExpressionContext,
        env: BTreeMap<String, String>,
        token: &CancellationToken,
    ) -> Result<StageOutcome, WorkflowError> {
        let inputs = match resolve_inputs(stage, ctx) {
            Ok(inputs) => inputs,
            Err(e) => {
                let message = format!("input resolution failed: {e}");
                self.fail_step(id, step, &message, "input").await?;
                return Ok(StageOutcome::Failed {
                    stage_id: stage.id.clone(),
                    message,
                });
            }
        };

        let policy = effective_retry(stage);
        let non_retryable: Vec<String> = policy
            .non_retryable_errors
            .iter()
            .map(|entry| {
                if has_placeholder(entry) {
                    resolve_string(entry, ctx).unwrap_or_else(|_| entry.clone())
                } else {
                    entry.clone()
                }
            })
            .collect();
        let timeout = effective_timeout(stage);
        let limit = duration_or(&timeout, DEFAULT_AGENT_TIMEOUT);
        let handoff = effective_handoff(stage);
        let required: Vec<&str> = stage
            .outputs
            .iter()
            .filter(|(_, o)| o.required)
            .map(|(k, _)| k.as_str())
            .collect();
        let roles = stage.roles.as_ref();

        loop {
            let attempt = step.attempt + 1;
            step.status = StepStatus::Running;
            step.attempt = attempt;
            step.error_message = None;
            if step.started_at.is_none() {
                step.started_at = Some(Utc::now());
            }
            self.repo.update_step(&id, &step).await?;
            self.emit(
                id,
                ExecutionEventType::StageStarted,
                json!({ "stage_id": stage.id, "attempt": attempt }),
            )
            .await?;

            let request = StageRequest {
                execution_id: id,
                workflow_id: workflow_id.to_string(),
                stage_id: stage.id.clone(),
                stage_name: stage.name.clone(),
                stage_type: stage.stage_type,
                attempt,
                primary: roles.map(|r| r.primary.clone()),
                model: roles.and_then(|r| r.model.clone()),
                instructions: roles.and_then(|r| r.instructions.clone()),
                tools: roles.map(|r| r.tools.clone()).unwrap_or_default(),
                inputs: inputs.clone(),
                outputs: stage
                    .outputs
                    .iter()
                    .map(|(k, o)| (k.clone(), o.output_type))
                    .collect(),
                context_modules: stage.context.clone(),
                env: env.clone(),
            };

            let result = match tokio::time::timeout(limit, self.dispatcher.dispatch(request)).await {
                Ok(Ok(raw)) => package_output(&handoff, &required, &stage.id, attempt, raw),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(DispatchError::timeout(&timeout)),
            };

            let err = match result {
                Ok(output) => {
                    step.status = StepStatus::Completed;
                    step.output = Some(output);
                    step.completed_at = Some(Utc::now());
                    self.repo.update_step(&id, &step).await?;
                    self.emit(
                        id,
                        ExecutionEventType::StageCompleted,
                        json!({ "stage_id": stage.id, "attempt": attempt }),
                    )
                    .await?;
                    tracing::debug!(execution_id = %id, stage_id = %stage.id, attempt, "stage completed");
                    return Ok(StageOutcome::Completed);
                }
                Err(err) => err,
            };

            let retry = !token.is_cancelled()
                && RetryHandler::should_retry(&policy, &non_retryable, attempt, &err.label);
            if !retry {
                let message = err.to_string();
                self.fail_step(id, step, &message, &err.label).await?;
                return Ok(StageOutcome::Failed {
                    stage_id: stage.id.clone(),
                    message,
                });
            }

            let delay = RetryHandler::backoff(&policy, attempt);
            tracing::warn!(
                execution_id = %id,
                stage_id = %stage.id,
                attempt,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "stage failed, retrying"
            );
            self.emit(
                id,
                ExecutionEventType::StageRetrying,
                json!({
                    "stage_id": stage.id,
                    "attempt": attempt,
                    "error": err.message,
                    "label": err.label,
                    "delay_ms": delay.as_millis() as u64,
                }),
            )
            .await?;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => {
                    let message = "cancelled during retry backoff".to_string();
                    self.fail_step(id, step, &message, "cancelled").await?;
                    return Ok(StageOutcome::Failed { stage_id: stage.id.clone(), message });
                }
            }
        }
    }

    async fn time_out(&self, id: Uuid) -> Result<WorkflowExecution, WorkflowError> {
        self.fail_execution(id, WORKFLOW_TIMEOUT_MESSAGE, "timeout").await
    }

    /// Fail the execution, first failing steps still `running` (with `label`)
    /// and skipping gates still waiting, so no step outlives its execution.
    async fn fail_execution(
        &self,
        id: Uuid,
        reason: &str,
        label: &str,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let execution = self.load(id).await?;
        for step in &execution.steps {
            match step.status {
                StepStatus::Running => self.fail_step(id, step.clone(), reason, label).await?,
                StepStatus::WaitingForApproval => {
                    self.skip_step(id, step.clone(), "execution failed").await?;
                }
                _ => {}
            }
        }
        let execution = self.load(id).await?;
        self.finalize(execution, ExecutionStatus::Failed, Some(reason.to_string()))
            .await
    }

    /// Best effort to leave a terminal record after dispatch stopped on an
    /// error. Returns whether the execution is now terminal.
    async fn settle_after_error(&self, id: Uuid, error: &WorkflowError) -> bool {
        match self.repo.get_execution(&id).await {
            Ok(Some(execution)) if execution.status.is_terminal() => return true,
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => return false,
        }
        let reason = format!("dispatch aborted: {error}");
        match self.fail_execution(id, &reason, "internal").await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(execution_id = %id, error = %e, "could not settle execution after error");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Gates
    // -----------------------------------------------------------------------

    /// Approve a waiting gate. Dispatch continues once no gate is waiting;
    /// the returned execution reflects where dispatch stopped.
    pub async fn approve_gate(
        &self,
        id: Uuid,
        stage_id: &str,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let execution = self.load(id).await?;
        let mut step = waiting_gate(&execution, stage_id, "approve")?;

        step.status = StepStatus::Completed;
        step.output = Some(json!({ "approved": true }));
        step.completed_at = Some(Utc::now());
        self.repo.update_step(&id, &step).await?;
        self.emit(
            id,
            ExecutionEventType::GateApproved,
            json!({ "stage_id": stage_id }),
        )
        .await?;
        tracing::info!(execution_id = %id, stage_id, "gate approved");

        self.resume_if_unblocked(id).await
    }

    /// Reject a waiting gate. The gate's `on_failure` applies as for any
    /// failed stage.
    pub async fn reject_gate(
        &self,
        id: Uuid,
        stage_id: &str,
        reason: &str,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let execution = self.load(id).await?;
        let mut step = waiting_gate(&execution, stage_id, "reject")?;

        step.status = StepStatus::Failed;
        step.error_message = Some(reason.to_string());
        step.completed_at = Some(Utc::now());
        self.repo.update_step(&id, &step).await?;
        self.emit(
            id,
            ExecutionEventType::GateRejected,
            json!({ "stage_id": stage_id, "reason": reason }),
        )
        .await?;
        tracing::info!(execution_id = %id, stage_id, reason, "gate rejected");

        let snapshot = &execution.definition_snapshot;
        let stage = snapshot
            .stage(stage_id)
            .ok_or_else(|| WorkflowError::StageNotFound(stage_id.to_string()))?;
        match on_failure_of(stage) {
            OnFailure::Halt => {
                let message = format!("gate '{stage_id}' rejected: {reason}");
                self.fail_execution(id, &message, "halt").await
            }
            OnFailure::SkipDependents => {
                let dag = build_dag(&snapshot.stages)?;
                self.skip_dependents(id, &dag, stage_id).await?;
                self.resume_if_unblocked(id).await
            }
            OnFailure::Continue => self.resume_if_unblocked(id).await,
        }
    }

    /// Apply `on_timeout` to every waiting gate whose deadline is at or
    /// before `now`. Returns the ids of the executions touched.
    pub async fn expire_gates(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, WorkflowError> {
        let paused = self
            .repo
            .list_executions(&ExecutionFilter {
                status: Some(ExecutionStatus::Paused),
                ..ExecutionFilter::default()
            })
            .await?;

        let mut touched = Vec::new();
        for candidate in paused {
            let id = candidate.id;
            loop {
                let execution = self.load(id).await?;
                if execution.status != ExecutionStatus::Paused {
                    break;
                }
                let Some(expired) = execution
                    .waiting_gates()
                    .find(|s| s.gate_deadline.is_some_and(|d| d <= now))
                    .cloned()
                else {
                    break;
                };
                if !touched.contains(&id) {
                    touched.push(id);
                }

                let action = execution
                    .definition_snapshot
                    .stage(&expired.stage_id)
                    .and_then(|s| s.gate.as_ref())
                    .map(|g| g.on_timeout)
                    .unwrap_or_default();
                tracing::info!(
                    execution_id = %id,
                    stage_id = %expired.stage_id,
                    action = ?action,
                    "gate deadline passed"
                );

                match action {
                    GateTimeoutAction::AutoApprove => {
                        self.approve_gate(id, &expired.stage_id).await?;
                    }
                    GateTimeoutAction::Reject => {
                        self.reject_gate(id, &expired.stage_id, GATE_TIMEOUT_REASON)
                            .await?;
                    }
                    GateTimeoutAction::Halt => {
                        let stage_id = expired.stage_id.clone();
                        let mut step = expired;
                        step.status = StepStatus::Failed;
                        step.error_message = Some(GATE_TIMEOUT_REASON.to_string());
                        step.completed_at = Some(Utc::now());
                        self.repo.update_step(&id, &step).await?;
                        self.emit(
                            id,
                            ExecutionEventType::GateRejected,
                            json!({ "stage_id": stage_id, "reason": GATE_TIMEOUT_REASON }),
                        )
                        .await?;
                        self.fail_execution(id, &format!("gate '{stage_id}' timed out"), "halt")
                            .await?;
                    }
                }
            }
        }
        Ok(touched)
    }

    // -----------------------------------------------------------------------
    // Pause / resume / cancel
    // -----------------------------------------------------------------------

    /// Pause a running execution. With an active dispatcher the pause takes
    /// effect at the next batch boundary.
    pub async fn pause_execution(&self, id: Uuid) -> Result<WorkflowExecution, WorkflowError> {
        let execution = self.load(id).await?;
        if execution.status != ExecutionStatus::Running {
            return Err(WorkflowError::InvalidState {
                id,
                status: execution.status,
                operation: "pause",
            });
        }

        let deferred = {
            let mut controls = self.controls();
            let entry = controls.entry(id).or_insert_with(ControlEntry::new);
            entry.pause_requested = entry.active;
            entry.active
        };
        if deferred {
            tracing::info!(execution_id = %id, "pause requested");
            return Ok(execution);
        }
        self.pause(execution, json!({ "reason": "requested" })).await
    }

    /// Resume a paused execution that has no gate waiting, then dispatch.
    pub async fn resume_execution(&self, id: Uuid) -> Result<WorkflowExecution, WorkflowError> {
        let mut execution = self.load(id).await?;
        if execution.status != ExecutionStatus::Paused || execution.waiting_gates().next().is_some()
        {
            return Err(WorkflowError::InvalidState {
                id,
                status: execution.status,
                operation: "resume",
            });
        }

        execution.status = ExecutionStatus::Running;
        self.repo.update_execution(&execution).await?;
        self.emit(
            id,
            ExecutionEventType::ExecutionResumed,
            json!({ "reason": "requested" }),
        )
        .await?;
        self.run_execution(id).await
    }

    /// Cancel a non-terminal execution. Without an active dispatcher it is
    /// finalized immediately; otherwise at the next batch boundary.
    pub async fn cancel_execution(&self, id: Uuid) -> Result<WorkflowExecution, WorkflowError> {
        let execution = self.load(id).await?;
        if execution.status.is_terminal() {
            return Err(WorkflowError::InvalidState {
                id,
                status: execution.status,
                operation: "cancel",
            });
        }

        let finalize_now = {
            let mut controls = self.controls();
            let entry = controls.entry(id).or_insert_with(ControlEntry::new);
            entry.token.cancel();
            let idle = !entry.active;
            entry.active = true;
            idle
        };
        if !finalize_now {
            tracing::info!(execution_id = %id, "cancellation requested");
            return Ok(execution);
        }

        let result = self
            .finalize(execution, ExecutionStatus::Cancelled, None)
            .await;
        self.release_dispatch(id, true);
        result
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution, WorkflowError> {
        self.load(id).await
    }

    pub async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<WorkflowExecution>, WorkflowError> {
        Ok(self.repo.list_executions(filter).await?)
    }

    pub async fn list_events(
        &self,
        id: Uuid,
        after_sequence: u64,
    ) -> Result<Vec<ExecutionEvent>, WorkflowError> {
        self.load(id).await?;
        Ok(self.repo.list_events(&id, after_sequence).await?)
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    async fn load(&self, id: Uuid) -> Result<WorkflowExecution, WorkflowError> {
        self.repo
            .get_execution(&id)
            .await?
            .ok_or_else(|| WorkflowError::execution_not_found(&id))
    }

    async fn emit(
        &self,
        id: Uuid,
        event_type: ExecutionEventType,
        payload: Value,
    ) -> Result<(), WorkflowError> {
        let event = self.repo.append_event(&id, event_type, payload).await?;
        self.bus.publish(event);
        Ok(())
    }

    async fn trigger_hooks(
        &self,
        execution: &WorkflowExecution,
        point: &'static str,
    ) -> Result<(), WorkflowError> {
        let Some(hooks) = &execution.definition_snapshot.hooks else {
            return Ok(());
        };
        let refs = match point {
            "on_start" => &hooks.on_start,
            "on_complete" => &hooks.on_complete,
            _ => &hooks.on_failure,
        };
        for reference in refs {
            self.emit(
                execution.id,
                ExecutionEventType::HookTriggered,
                json!({ "hook": point, "reference": reference }),
            )
            .await?;
        }
        Ok(())
    }

    async fn finalize(
        &self,
        mut execution: WorkflowExecution,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<WorkflowExecution, WorkflowError> {
        execution.status = status;
        execution.completed_at = Some(Utc::now());
        execution.error_message = error;
        self.repo.update_execution(&execution).await?;

        let (event_type, hook) = match status {
            ExecutionStatus::Completed => (ExecutionEventType::ExecutionCompleted, Some("on_complete")),
            ExecutionStatus::Failed => (ExecutionEventType::ExecutionFailed, Some("on_failure")),
            _ => (ExecutionEventType::ExecutionCancelled, None),
        };
        self.emit(
            execution.id,
            event_type,
            json!({ "error": execution.error_message }),
        )
        .await?;
        if let Some(hook) = hook {
            self.trigger_hooks(&execution, hook).await?;
        }

        tracing::info!(
            execution_id = %execution.id,
            status = %status,
            error = execution.error_message.as_deref().unwrap_or(""),
            "execution finished"
        );
        Ok(execution)
    }

    async fn pause(
        &self,
        mut execution: WorkflowExecution,
        payload: Value,
    ) -> Result<WorkflowExecution, WorkflowError> {
        execution.status = ExecutionStatus::Paused;
        self.repo.update_execution(&execution).await?;
        self.emit(execution.id, ExecutionEventType::ExecutionPaused, payload)
            .await?;
        tracing::info!(execution_id = %execution.id, "execution paused");
        Ok(execution)
    }

    /// Back to `running` and dispatch, unless a gate still waits or the
    /// execution already left `paused`.
    async fn resume_if_unblocked(&self, id: Uuid) -> Result<WorkflowExecution, WorkflowError> {
        let mut execution = self.load(id).await?;
        if execution.status != ExecutionStatus::Paused || execution.waiting_gates().next().is_some()
        {
            return Ok(execution);
        }
        execution.status = ExecutionStatus::Running;
        self.repo.update_execution(&execution).await?;
        self.emit(
            id,
            ExecutionEventType::ExecutionResumed,
            json!({ "reason": "gate" }),
        )
        .await?;
        self.run_execution(id).await
    }

    async fn open_gate(
        &self,
        id: Uuid,
        stage: &StageDefinition,
        mut step: ExecutionStep,
    ) -> Result<(), WorkflowError> {
        let gate = stage.gate.clone().unwrap_or_default();
        let wait = duration_or(&gate.timeout, DEFAULT_GATE_TIMEOUT);
        let now = Utc::now();
        let deadline = TimeDelta::from_std(wait)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .ok_or_else(|| {
                WorkflowError::Validation(format!(
                    "gate '{}' timeout '{}' is out of range",
                    stage.id, gate.timeout
                ))
            })?;

        step.status = StepStatus::WaitingForApproval;
        step.started_at = Some(now);
        step.gate_deadline = Some(deadline);
        self.repo.update_step(&id, &step).await?;
        self.emit(
            id,
            ExecutionEventType::GateWaiting,
            json!({
                "stage_id": stage.id,
                "approvers": gate.approvers,
                "message": gate.message,
                "deadline": deadline.to_rfc3339(),
            }),
        )
        .await?;
        tracing::info!(execution_id = %id, stage_id = %stage.id, "gate waiting for approval");
        Ok(())
    }

    async fn skip_step(
        &self,
        id: Uuid,
        mut step: ExecutionStep,
        reason: &str,
    ) -> Result<(), WorkflowError> {
        step.status = StepStatus::Skipped;
        step.completed_at = Some(Utc::now());
        self.repo.update_step(&id, &step).await?;
        self.emit(
            id,
            ExecutionEventType::StageSkipped,
            json!({ "stage_id": step.stage_id, "reason": reason }),
        )
        .await
    }

    async fn fail_step(
        &self,
        id: Uuid,
        mut step: ExecutionStep,
        message: &str,
        label: &str,
    ) -> Result<(), WorkflowError> {
        step.status = StepStatus::Failed;
        step.error_message = Some(message.to_string());
        step.completed_at = Some(Utc::now());
        self.repo.update_step(&id, &step).await?;
        tracing::warn!(execution_id = %id, stage_id = %step.stage_id, label, "stage failed");
        self.emit(
            id,
            ExecutionEventType::StageFailed,
            json!({
                "stage_id": step.stage_id,
                "attempt": step.attempt,
                "error": message,
                "label": label,
            }),
        )
        .await
    }

    /// Mark every still-pending transitive successor of `stage_id` skipped.
    async fn skip_dependents(&self, id: Uuid, dag: &Dag, stage_id: &str) -> Result<(), WorkflowError> {
        let execution = self.load(id).await?;
        let reason = format!("dependency '{stage_id}' failed");
        for successor in dag.transitive_successors(stage_id)? {
            if let Some(step) = execution
                .step(successor)
                .filter(|s| s.status == StepStatus::Pending)
            {
                self.skip_step(id, step.clone(), &reason).await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Control registry access (never across an await)
    // -----------------------------------------------------------------------

    fn controls(&self) -> MutexGuard<'_, HashMap<Uuid, ControlEntry>> {
        self.controls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take ownership of dispatch. `None` if another dispatcher holds it.
    fn claim_dispatch(&self, id: Uuid) -> Option<CancellationToken> {
        let mut controls = self.controls();
        let entry = controls.entry(id).or_insert_with(ControlEntry::new);
        if entry.active {
            return None;
        }
        entry.active = true;
        Some(entry.token.clone())
    }

    fn release_dispatch(&self, id: Uuid, terminal: bool) {
        let mut controls = self.controls();
        if terminal {
            controls.remove(&id);
        } else if let Some(entry) = controls.get_mut(&id) {
            entry.active = false;
            entry.pause_requested = false;
        }
    }

    fn take_pause_request(&self, id: Uuid) -> bool {
        self.controls()
            .get_mut(&id)
            .map(|entry| std::mem::take(&mut entry.pause_requested))
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn on_failure_of(stage: &StageDefinition) -> OnFailure {
    stage
        .error_policy
        .as_ref()
        .map(|p| p.on_failure)
        .unwrap_or_default()
}

fn duration_or(value: &str, fallback: &str) -> Duration {
    parse_duration(value)
        .or_else(|| parse_duration(fallback))
        .unwrap_or_default()
}

fn resolve_inputs(
    stage: &StageDefinition,
    ctx: &ExpressionContext,
) -> Result<Map<String, Value>, ExpressionError> {
    stage
        .inputs
        .iter()
        .map(|(name, input)| Ok((name.clone(), resolve_value(&input.source, ctx)?)))
        .collect()
}

fn waiting_gate(
    execution: &WorkflowExecution,
    stage_id: &str,
    operation: &'static str,
) -> Result<ExecutionStep, WorkflowError> {
    let invalid = || WorkflowError::InvalidState {
        id: execution.id,
        status: execution.status,
        operation,
    };
    if execution.status != ExecutionStatus::Paused {
        return Err(invalid());
    }
    let step = execution
        .step(stage_id)
        .ok_or_else(|| WorkflowError::StageNotFound(stage_id.to_string()))?;
    if step.status != StepStatus::WaitingForApproval {
        return Err(invalid());
    }
    Ok(step.clone())
}

fn check_duration(value: &str) -> Result<(), WorkflowError> {
    parse_duration(value)
        .map(|_| ())
        .ok_or_else(|| WorkflowError::Validation(format!("invalid duration '{value}'")))
}

/// Fold per-run overrides into a defaulted definition.
fn apply_overrides(
    mut def: WorkflowDefinition,
    overrides: &ExecutionOverrides,
) -> Result<WorkflowDefinition, WorkflowError> {
    for (stage_id, stage_override) in &overrides.stages {
        let stage = def
            .stages
            .iter_mut()
            .find(|s| &s.id == stage_id)
            .ok_or_else(|| WorkflowError::StageNotFound(stage_id.clone()))?;
        if let (Some(model), Some(roles)) = (&stage_override.model, stage.roles.as_mut()) {
            roles.model = Some(model.clone());
        }
        if let Some(timeout) = &stage_override.timeout {
            check_duration(timeout)?;
            stage.error_policy.get_or_insert_with(Default::default).timeout = Some(timeout.clone());
        }
    }
    def.config
        .env
        .extend(overrides.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    if let Some(timeout) = &overrides.timeout {
        check_duration(timeout)?;
        def.config.timeout = timeout.clone();
    }
    Ok(def)
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

/// Execution and step statuses reconstructed from an event log.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayedExecution {
    pub status: ExecutionStatus,
    /// Only steps that appear in the log. Absent steps are still pending.
    pub steps: BTreeMap<String, StepStatus>,
}

impl ReplayedExecution {
    pub fn step_status(&self, stage_id: &str) -> StepStatus {
        self.steps
            .get(stage_id)
            .copied()
            .unwrap_or(StepStatus::Pending)
    }
}

/// Fold an ordered event log into statuses.
pub fn replay_events(events: &[ExecutionEvent]) -> ReplayedExecution {
    let mut replayed = ReplayedExecution {
        status: ExecutionStatus::Pending,
        steps: BTreeMap::new(),
    };
    for event in events {
        if let Some(status) = event.event_type.execution_status() {
            replayed.status = status;
        }
        if let (Some(status), Some(stage_id)) = (event.event_type.step_status(), event.stage_id()) {
            replayed.steps.insert(stage_id.to_string(), status);
        }
    }
    replayed
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryWorkflowRepository;
    use crate::workflow::dispatch::{EchoDispatcher, StageResult};
    use crate::workflow::testing::{
        agent_stage, gate_stage, with_input, with_output, with_param, workflow,
    };
    use std::collections::VecDeque;
    use swdl_types::error::RepositoryError;
    use swdl_types::execution::StageOverride;
    use swdl_types::workflow::{ContractType, ErrorPolicy, GateConfig, Hooks, RetryPolicy};

    // -- scripted dispatcher ------------------------------------------------

    #[derive(Default)]
    struct ScriptedDispatcher {
        failures: Mutex<HashMap<String, VecDeque<DispatchError>>>,
        delay: Option<Duration>,
        requests: Mutex<Vec<StageRequest>>,
    }

    impl ScriptedDispatcher {
        fn failing(self, stage_id: &str, label: &str, times: usize) -> Self {
            self.failures
                .lock()
                .unwrap()
                .entry(stage_id.to_string())
                .or_default()
                .extend((0..times).map(|_| DispatchError::new(label, "scripted failure")));
            self
        }

        fn slow(self, delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..self
            }
        }

        fn requests_for(&self, stage_id: &str) -> Vec<StageRequest> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.stage_id == stage_id)
                .cloned()
                .collect()
        }
    }

    impl StageDispatcher for ScriptedDispatcher {
        async fn dispatch(&self, request: StageRequest) -> Result<StageResult, DispatchError> {
            self.requests.lock().unwrap().push(request.clone());
            let scripted = self
                .failures
                .lock()
                .unwrap()
                .get_mut(&request.stage_id)
                .and_then(|q| q.pop_front());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match scripted {
                Some(err) => Err(err),
                None => EchoDispatcher.dispatch(request).await,
            }
        }
    }

    // -- fixtures -----------------------------------------------------------

    type Service = ExecutionService<InMemoryWorkflowRepository, ScriptedDispatcher>;

    async fn service_with(def: &WorkflowDefinition, dispatcher: ScriptedDispatcher) -> (Service, Arc<ScriptedDispatcher>) {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        repo.create_definition(def).await.unwrap();
        let dispatcher = Arc::new(dispatcher);
        let svc = ExecutionService::new(
            repo,
            Arc::clone(&dispatcher),
            EventBus::new(256),
            ExecutionConfig::default(),
        );
        (svc, dispatcher)
    }

    fn fast_retry(max_attempts: u32, non_retryable: &[&str]) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_interval: "1ms".to_string(),
            backoff_multiplier: 1.0,
            max_interval: "1ms".to_string(),
            non_retryable_errors: non_retryable.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn with_policy(mut stage: StageDefinition, on_failure: OnFailure, retry: RetryPolicy) -> StageDefinition {
        stage.error_policy = Some(ErrorPolicy {
            retry: Some(retry),
            on_failure,
            timeout: None,
        });
        stage
    }

    fn two_stage() -> WorkflowDefinition {
        let first = with_output(agent_stage("stage-1", &[]), "result", ContractType::String);
        let second = with_input(
            agent_stage("stage-2", &["stage-1"]),
            "previous",
            ContractType::String,
            "${{ stages.stage-1.outputs.result }}",
        );
        workflow(vec![first, second])
    }

    fn gated() -> WorkflowDefinition {
        workflow(vec![
            agent_stage("draft", &[]),
            gate_stage("review", &["draft"]),
            agent_stage("publish", &["review"]),
        ])
    }

    async fn run(svc: &Service, workflow_id: &str) -> WorkflowExecution {
        let started = svc
            .start_execution(workflow_id, BTreeMap::new(), ExecutionOverrides::default())
            .await
            .unwrap();
        svc.run_execution(started.id).await.unwrap()
    }

    fn status_of(execution: &WorkflowExecution, stage_id: &str) -> StepStatus {
        execution.step(stage_id).unwrap().status
    }

    async fn assert_replay_matches(svc: &Service, execution: &WorkflowExecution) {
        let events = svc.list_events(execution.id, 0).await.unwrap();
        let replayed = replay_events(&events);
        assert_eq!(replayed.status, execution.status);
        for step in &execution.steps {
            assert_eq!(replayed.step_status(&step.stage_id), step.status, "{}", step.stage_id);
        }
    }

    // -- lifecycle ----------------------------------------------------------

    #[tokio::test]
    async fn test_two_stage_run_completes() {
        let (svc, dispatcher) = service_with(&two_stage(), ScriptedDispatcher::default()).await;

        let started = svc
            .start_execution("test-wf", BTreeMap::new(), ExecutionOverrides::default())
            .await
            .unwrap();
        assert_eq!(started.status, ExecutionStatus::Running);
        assert_eq!(started.steps.len(), 2);
        assert!(started.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(started.steps[0].batch_index, 0);
        assert_eq!(started.steps[1].batch_index, 1);

        let done = svc.run_execution(started.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert!(done.completed_at.is_some());
        assert_eq!(status_of(&done, "stage-1"), StepStatus::Completed);
        assert_eq!(status_of(&done, "stage-2"), StepStatus::Completed);

        // stage-2 received stage-1's output through its input expression
        let request = &dispatcher.requests_for("stage-2")[0];
        assert_eq!(request.inputs["previous"], json!("stage-1.result"));

        let events = svc.list_events(done.id, 0).await.unwrap();
        assert_eq!(
            events.first().unwrap().event_type,
            ExecutionEventType::ExecutionStarted
        );
        assert_eq!(
            events.last().unwrap().event_type,
            ExecutionEventType::ExecutionCompleted
        );
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, (1..=events.len() as u64).collect::<Vec<_>>());
        assert_replay_matches(&svc, &done).await;
    }

    #[tokio::test]
    async fn test_run_terminal_is_unchanged() {
        let (svc, _) = service_with(&two_stage(), ScriptedDispatcher::default()).await;
        let done = run(&svc, "test-wf").await;
        let before = svc.list_events(done.id, 0).await.unwrap().len();

        let again = svc.run_execution(done.id).await.unwrap();
        assert_eq!(again.status, ExecutionStatus::Completed);
        assert_eq!(svc.list_events(done.id, 0).await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn test_start_errors() {
        let def = with_param(two_stage(), "topic", true, None);
        let (svc, _) = service_with(&def, ScriptedDispatcher::default()).await;

        let missing = svc
            .start_execution("nope", BTreeMap::new(), ExecutionOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(missing, WorkflowError::NotFound { kind: "workflow", .. }));

        let no_param = svc
            .start_execution("test-wf", BTreeMap::new(), ExecutionOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(no_param, WorkflowError::Validation(_)));

        let mut broken = two_stage();
        broken.stages[1].inputs.get_mut("previous").unwrap().source =
            "${{ stages.stage-1.outputs.nothing }}".to_string();
        let err = svc
            .start_definition(&broken, BTreeMap::new(), ExecutionOverrides::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nothing"), "got: {err}");
    }

    #[tokio::test]
    async fn test_overrides_reach_dispatcher() {
        let (svc, dispatcher) = service_with(&two_stage(), ScriptedDispatcher::default()).await;
        let overrides = ExecutionOverrides {
            stages: BTreeMap::from([(
                "stage-1".to_string(),
                StageOverride {
                    model: Some("large".to_string()),
                    timeout: Some("5m".to_string()),
                },
            )]),
            env: BTreeMap::from([("MODE".to_string(), "test".to_string())]),
            timeout: None,
        };
        let started = svc
            .start_execution("test-wf", BTreeMap::new(), overrides)
            .await
            .unwrap();
        let snapshot_stage = started.definition_snapshot.stage("stage-1").unwrap();
        assert_eq!(
            snapshot_stage.error_policy.as_ref().unwrap().timeout.as_deref(),
            Some("5m")
        );

        svc.run_execution(started.id).await.unwrap();
        let request = &dispatcher.requests_for("stage-1")[0];
        assert_eq!(request.model.as_deref(), Some("large"));
        assert_eq!(request.env["MODE"], "test");

        let bad = ExecutionOverrides {
            stages: BTreeMap::from([("ghost".to_string(), StageOverride::default())]),
            ..ExecutionOverrides::default()
        };
        assert!(matches!(
            svc.start_execution("test-wf", BTreeMap::new(), bad).await,
            Err(WorkflowError::StageNotFound(_))
        ));
    }

    // -- gates --------------------------------------------------------------

    #[tokio::test]
    async fn test_gate_pauses_then_approve_completes() {
        let (svc, _) = service_with(&gated(), ScriptedDispatcher::default()).await;
        let paused = run(&svc, "test-wf").await;

        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(status_of(&paused, "draft"), StepStatus::Completed);
        assert_eq!(status_of(&paused, "review"), StepStatus::WaitingForApproval);
        assert_eq!(status_of(&paused, "publish"), StepStatus::Pending);
        assert!(paused.step("review").unwrap().gate_deadline.is_some());
        assert_replay_matches(&svc, &svc.get_execution(paused.id).await.unwrap()).await;

        let done = svc.approve_gate(paused.id, "review").await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(status_of(&done, "publish"), StepStatus::Completed);
        assert_eq!(done.step("review").unwrap().output, Some(json!({"approved": true})));
        assert_replay_matches(&svc, &done).await;
    }

    #[tokio::test]
    async fn test_gate_reject_halts() {
        let (svc, _) = service_with(&gated(), ScriptedDispatcher::default()).await;
        let paused = run(&svc, "test-wf").await;

        let failed = svc
            .reject_gate(paused.id, "review", "not good enough")
            .await
            .unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(status_of(&failed, "review"), StepStatus::Failed);
        assert_eq!(status_of(&failed, "publish"), StepStatus::Pending);
        assert!(failed.error_message.unwrap().contains("not good enough"));
    }

    #[tokio::test]
    async fn test_gate_reject_with_continue_resumes() {
        let mut def = gated();
        def.stages[1].error_policy = Some(ErrorPolicy {
            on_failure: OnFailure::Continue,
            ..ErrorPolicy::default()
        });
        let (svc, _) = service_with(&def, ScriptedDispatcher::default()).await;
        let paused = run(&svc, "test-wf").await;

        let done = svc.reject_gate(paused.id, "review", "meh").await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(status_of(&done, "publish"), StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_gate_operations_require_waiting_gate() {
        let (svc, _) = service_with(&gated(), ScriptedDispatcher::default()).await;
        let started = svc
            .start_execution("test-wf", BTreeMap::new(), ExecutionOverrides::default())
            .await
            .unwrap();
        assert!(matches!(
            svc.approve_gate(started.id, "review").await,
            Err(WorkflowError::InvalidState { operation: "approve", .. })
        ));

        let paused = svc.run_execution(started.id).await.unwrap();
        assert!(matches!(
            svc.approve_gate(paused.id, "draft").await,
            Err(WorkflowError::InvalidState { .. })
        ));
        assert!(matches!(
            svc.approve_gate(paused.id, "ghost").await,
            Err(WorkflowError::StageNotFound(_))
        ));
        assert!(matches!(
            svc.resume_execution(paused.id).await,
            Err(WorkflowError::InvalidState { operation: "resume", .. })
        ));
    }

    #[tokio::test]
    async fn test_expire_gates_applies_on_timeout() {
        let cases = [
            (GateTimeoutAction::AutoApprove, ExecutionStatus::Completed, StepStatus::Completed),
            (GateTimeoutAction::Reject, ExecutionStatus::Failed, StepStatus::Failed),
            (GateTimeoutAction::Halt, ExecutionStatus::Failed, StepStatus::Failed),
        ];
        for (action, expected, gate_status) in cases {
            let mut def = gated();
            def.stages[1].gate = Some(GateConfig {
                timeout: "1s".to_string(),
                on_timeout: action,
                ..GateConfig::default()
            });
            let (svc, _) = service_with(&def, ScriptedDispatcher::default()).await;
            let paused = run(&svc, "test-wf").await;

            // Not yet due.
            assert!(svc.expire_gates(Utc::now()).await.unwrap().is_empty());

            let touched = svc
                .expire_gates(Utc::now() + TimeDelta::minutes(1))
                .await
                .unwrap();
            assert_eq!(touched, vec![paused.id]);

            let after = svc.get_execution(paused.id).await.unwrap();
            assert_eq!(after.status, expected, "{action:?}");
            assert_eq!(status_of(&after, "review"), gate_status, "{action:?}");
            assert_replay_matches(&svc, &after).await;
        }
    }

    // -- cancel / pause -----------------------------------------------------

    #[tokio::test]
    async fn test_cancel_before_run() {
        let (svc, dispatcher) = service_with(&two_stage(), ScriptedDispatcher::default()).await;
        let started = svc
            .start_execution("test-wf", BTreeMap::new(), ExecutionOverrides::default())
            .await
            .unwrap();

        let cancelled = svc.cancel_execution(started.id).await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

        let after_run = svc.run_execution(started.id).await.unwrap();
        assert_eq!(after_run.status, ExecutionStatus::Cancelled);
        assert!(after_run.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert!(dispatcher.requests.lock().unwrap().is_empty());

        assert!(matches!(
            svc.cancel_execution(started.id).await,
            Err(WorkflowError::InvalidState { operation: "cancel", .. })
        ));
        assert_replay_matches(&svc, &after_run).await;
    }

    #[tokio::test]
    async fn test_cancel_during_run_stops_at_barrier() {
        let def = workflow(vec![agent_stage("a", &[]), agent_stage("b", &["a"])]);
        let dispatcher = ScriptedDispatcher::default().slow(Duration::from_millis(100));
        let (svc, _) = service_with(&def, dispatcher).await;
        let started = svc
            .start_execution("test-wf", BTreeMap::new(), ExecutionOverrides::default())
            .await
            .unwrap();

        let runner = svc.clone();
        let id = started.id;
        let handle = tokio::spawn(async move { runner.run_execution(id).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let requested = svc.cancel_execution(id).await.unwrap();
        assert_eq!(requested.status, ExecutionStatus::Running);

        let finished = handle.await.unwrap().unwrap();
        assert_eq!(finished.status, ExecutionStatus::Cancelled);
        assert_eq!(status_of(&finished, "a"), StepStatus::Completed);
        assert_eq!(status_of(&finished, "b"), StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_pause_and_resume_idle_execution() {
        let (svc, _) = service_with(&two_stage(), ScriptedDispatcher::default()).await;
        let started = svc
            .start_execution("test-wf", BTreeMap::new(), ExecutionOverrides::default())
            .await
            .unwrap();

        let paused = svc.pause_execution(started.id).await.unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert!(matches!(
            svc.run_execution(started.id).await,
            Err(WorkflowError::InvalidState { operation: "run", .. })
        ));
        assert!(matches!(
            svc.pause_execution(started.id).await,
            Err(WorkflowError::InvalidState { operation: "pause", .. })
        ));

        let done = svc.resume_execution(started.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_replay_matches(&svc, &done).await;
    }

    #[tokio::test]
    async fn test_pause_request_honored_at_barrier() {
        let def = workflow(vec![agent_stage("a", &[]), agent_stage("b", &["a"])]);
        let dispatcher = ScriptedDispatcher::default().slow(Duration::from_millis(100));
        let (svc, _) = service_with(&def, dispatcher).await;
        let started = svc
            .start_execution("test-wf", BTreeMap::new(), ExecutionOverrides::default())
            .await
            .unwrap();

        let runner = svc.clone();
        let id = started.id;
        let handle = tokio::spawn(async move { runner.run_execution(id).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        svc.pause_execution(id).await.unwrap();

        let paused = handle.await.unwrap().unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(status_of(&paused, "b"), StepStatus::Pending);

        let done = svc.resume_execution(id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
    }

    // -- failures -----------------------------------------------------------

    #[tokio::test]
    async fn test_retry_then_success() {
        let stage = with_policy(agent_stage("flaky", &[]), OnFailure::Halt, fast_retry(3, &[]));
        let dispatcher = ScriptedDispatcher::default().failing("flaky", "rate_limited", 2);
        let (svc, dispatcher) = service_with(&workflow(vec![stage]), dispatcher).await;

        let done = run(&svc, "test-wf").await;
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.step("flaky").unwrap().attempt, 3);
        assert_eq!(dispatcher.requests_for("flaky").len(), 3);

        let retries = svc
            .list_events(done.id, 0)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == ExecutionEventType::StageRetrying)
            .count();
        assert_eq!(retries, 2);
        assert_replay_matches(&svc, &done).await;
    }

    #[tokio::test]
    async fn test_attempts_exhausted_halts() {
        let stage = with_policy(agent_stage("a", &[]), OnFailure::Halt, fast_retry(2, &[]));
        let next = agent_stage("b", &["a"]);
        let dispatcher = ScriptedDispatcher::default().failing("a", "boom", 5);
        let (svc, dispatcher) = service_with(&workflow(vec![stage, next]), dispatcher).await;

        let failed = run(&svc, "test-wf").await;
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(dispatcher.requests_for("a").len(), 2);
        assert_eq!(status_of(&failed, "a"), StepStatus::Failed);
        assert_eq!(status_of(&failed, "b"), StepStatus::Pending);
        assert!(failed.error_message.unwrap().contains("'a'"));
    }

    #[tokio::test]
    async fn test_non_retryable_label_fails_first_attempt() {
        let stage = with_policy(agent_stage("a", &[]), OnFailure::Halt, fast_retry(5, &["auth"]));
        let dispatcher = ScriptedDispatcher::default().failing("a", "auth", 1);
        let (svc, dispatcher) = service_with(&workflow(vec![stage]), dispatcher).await;

        let failed = run(&svc, "test-wf").await;
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(dispatcher.requests_for("a").len(), 1);
        assert_eq!(failed.step("a").unwrap().attempt, 1);
    }

    #[tokio::test]
    async fn test_skip_dependents() {
        let a = with_policy(agent_stage("a", &[]), OnFailure::SkipDependents, fast_retry(1, &[]));
        let stages = vec![
            a,
            agent_stage("b", &["a"]),
            agent_stage("c", &["b"]),
            agent_stage("d", &[]),
        ];
        let dispatcher = ScriptedDispatcher::default().failing("a", "boom", 1);
        let (svc, dispatcher) = service_with(&workflow(stages), dispatcher).await;

        let done = run(&svc, "test-wf").await;
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(status_of(&done, "a"), StepStatus::Failed);
        assert_eq!(status_of(&done, "b"), StepStatus::Skipped);
        assert_eq!(status_of(&done, "c"), StepStatus::Skipped);
        assert_eq!(status_of(&done, "d"), StepStatus::Completed);
        assert!(dispatcher.requests_for("b").is_empty());
        assert_replay_matches(&svc, &done).await;
    }

    #[tokio::test]
    async fn test_continue_lets_dependents_observe_failure() {
        let a = with_policy(agent_stage("a", &[]), OnFailure::Continue, fast_retry(1, &[]));
        let mut fallback = agent_stage("fallback", &["a"]);
        fallback.condition = Some("${{ stages.a.status == 'failed' }}".to_string());
        let mut happy = agent_stage("happy", &["a"]);
        happy.condition = Some("stages.a.status == 'completed'".to_string());

        let dispatcher = ScriptedDispatcher::default().failing("a", "boom", 1);
        let (svc, _) = service_with(&workflow(vec![a, fallback, happy]), dispatcher).await;

        let done = run(&svc, "test-wf").await;
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(status_of(&done, "fallback"), StepStatus::Completed);
        assert_eq!(status_of(&done, "happy"), StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_stage_timeout_uses_timeout_label() {
        let mut stage = with_policy(agent_stage("slow", &[]), OnFailure::Halt, fast_retry(3, &["timeout"]));
        if let Some(policy) = stage.error_policy.as_mut() {
            policy.timeout = Some("10ms".to_string());
        }
        let dispatcher = ScriptedDispatcher::default().slow(Duration::from_millis(200));
        let (svc, dispatcher) = service_with(&workflow(vec![stage]), dispatcher).await;

        let failed = run(&svc, "test-wf").await;
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(dispatcher.requests_for("slow").len(), 1);
        assert!(
            failed.step("slow").unwrap().error_message.as_deref().unwrap().starts_with("timeout:")
        );
    }

    #[tokio::test]
    async fn test_workflow_timeout() {
        let mut def = workflow(vec![agent_stage("slow", &[])]);
        def.config.timeout = "20ms".to_string();
        let dispatcher = ScriptedDispatcher::default().slow(Duration::from_millis(300));
        let (svc, _) = service_with(&def, dispatcher).await;

        let failed = run(&svc, "test-wf").await;
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some(WORKFLOW_TIMEOUT_MESSAGE));
        assert_eq!(status_of(&failed, "slow"), StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_hooks_emit_events() {
        let mut def = two_stage();
        def.hooks = Some(Hooks {
            on_start: vec!["hook:announce".to_string()],
            on_complete: vec!["hook:notify".to_string()],
            on_failure: vec!["hook:page".to_string()],
        });
        let (svc, _) = service_with(&def, ScriptedDispatcher::default()).await;
        let done = run(&svc, "test-wf").await;

        let hooks: Vec<Value> = svc
            .list_events(done.id, 0)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == ExecutionEventType::HookTriggered)
            .map(|e| e.payload["reference"].clone())
            .collect();
        assert_eq!(hooks, vec![json!("hook:announce"), json!("hook:notify")]);
    }

    #[tokio::test]
    async fn test_subscribers_see_live_events() {
        let (svc, _) = service_with(&two_stage(), ScriptedDispatcher::default()).await;
        let mut rx = svc.subscribe();
        let done = run(&svc, "test-wf").await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.execution_id, done.id);
        assert_eq!(first.event_type, ExecutionEventType::ExecutionStarted);
    }

    #[test]
    fn test_replay_events_folds_statuses() {
        let id = Uuid::now_v7();
        let event = |seq, event_type, payload| ExecutionEvent {
            execution_id: id,
            sequence: seq,
            event_type,
            payload,
            created_at: Utc::now(),
        };
        let events = vec![
            event(1, ExecutionEventType::ExecutionStarted, json!({})),
            event(2, ExecutionEventType::StageStarted, json!({"stage_id": "a"})),
            event(3, ExecutionEventType::StageRetrying, json!({"stage_id": "a"})),
            event(4, ExecutionEventType::StageCompleted, json!({"stage_id": "a"})),
            event(5, ExecutionEventType::GateWaiting, json!({"stage_id": "g"})),
            event(6, ExecutionEventType::ExecutionPaused, json!({})),
        ];
        let replayed = replay_events(&events);
        assert_eq!(replayed.status, ExecutionStatus::Paused);
        assert_eq!(replayed.step_status("a"), StepStatus::Completed);
        assert_eq!(replayed.step_status("g"), StepStatus::WaitingForApproval);
        assert_eq!(replayed.step_status("never"), StepStatus::Pending);
        assert_eq!(replay_events(&[]).status, ExecutionStatus::Pending);
    }

    // -- failure settlement ---------------------------------------------------

    /// In-memory store that refuses to mark one stage `running`.
    struct StepWriteFails {
        inner: InMemoryWorkflowRepository,
        stage_id: &'static str,
    }

    impl WorkflowRepository for StepWriteFails {
        async fn create_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
            self.inner.create_definition(def).await
        }

        async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>, RepositoryError> {
            self.inner.get_definition(id).await
        }

        async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
            self.inner.list_definitions().await
        }

        async fn update_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
            self.inner.update_definition(def).await
        }

        async fn delete_definition(&self, id: &str) -> Result<bool, RepositoryError> {
            self.inner.delete_definition(id).await
        }

        async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
            self.inner.create_execution(execution).await
        }

        async fn get_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
            self.inner.get_execution(id).await
        }

        async fn list_executions(
            &self,
            filter: &ExecutionFilter,
        ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
            self.inner.list_executions(filter).await
        }

        async fn update_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
            self.inner.update_execution(execution).await
        }

        async fn update_step(&self, execution_id: &Uuid, step: &ExecutionStep) -> Result<(), RepositoryError> {
            if step.stage_id == self.stage_id && step.status == StepStatus::Running {
                return Err(RepositoryError::Query("disk I/O error".into()));
            }
            self.inner.update_step(execution_id, step).await
        }

        async fn append_event(
            &self,
            execution_id: &Uuid,
            event_type: ExecutionEventType,
            payload: Value,
        ) -> Result<ExecutionEvent, RepositoryError> {
            self.inner.append_event(execution_id, event_type, payload).await
        }

        async fn list_events(
            &self,
            execution_id: &Uuid,
            after_sequence: u64,
        ) -> Result<Vec<ExecutionEvent>, RepositoryError> {
            self.inner.list_events(execution_id, after_sequence).await
        }
    }

    #[tokio::test]
    async fn test_store_error_in_one_stage_settles_the_execution() {
        let def = workflow(vec![agent_stage("broken", &[]), agent_stage("sibling", &[])]);
        let repo = Arc::new(StepWriteFails {
            inner: InMemoryWorkflowRepository::new(),
            stage_id: "broken",
        });
        repo.create_definition(&def).await.unwrap();
        let svc = ExecutionService::new(
            repo,
            Arc::new(ScriptedDispatcher::default().slow(Duration::from_millis(20))),
            EventBus::new(256),
            ExecutionConfig::default(),
        );

        let started = svc
            .start_execution("test-wf", BTreeMap::new(), ExecutionOverrides::default())
            .await
            .unwrap();
        let err = svc.run_execution(started.id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Repository(_)), "got: {err}");

        let settled = svc.get_execution(started.id).await.unwrap();
        assert_eq!(settled.status, ExecutionStatus::Failed);
        assert!(settled.error_message.as_ref().unwrap().contains("dispatch aborted"));
        assert_eq!(status_of(&settled, "sibling"), StepStatus::Completed);
        assert!(settled.steps.iter().all(|s| s.status != StepStatus::Running));

        // Dispatch ownership was released along with the terminal record.
        let again = svc.run_execution(started.id).await.unwrap();
        assert_eq!(again.status, ExecutionStatus::Failed);
        let cancel = svc.cancel_execution(started.id).await.unwrap_err();
        assert!(matches!(cancel, WorkflowError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_halt_skips_gate_waiting_in_the_same_batch() {
        let failing = with_policy(agent_stage("build", &[]), OnFailure::Halt, fast_retry(1, &[]));
        let def = workflow(vec![failing, gate_stage("sign-off", &[])]);
        let (svc, _) = service_with(&def, ScriptedDispatcher::default().failing("build", "boom", 1)).await;

        let done = run(&svc, "test-wf").await;
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert_eq!(status_of(&done, "build"), StepStatus::Failed);
        assert_eq!(status_of(&done, "sign-off"), StepStatus::Skipped);
        assert_replay_matches(&svc, &done).await;
    }

    #[tokio::test]
    async fn test_gate_timeout_beyond_range_is_refused_at_start() {
        let mut def = gated();
        def.stages[1].gate = Some(GateConfig {
            timeout: "100000000d".to_string(),
            ..GateConfig::default()
        });
        let (svc, _) = service_with(&workflow(vec![agent_stage("a", &[])]), ScriptedDispatcher::default()).await;

        let err = svc
            .start_definition(&def, BTreeMap::new(), ExecutionOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Parse { .. }), "got: {err}");
        assert!(svc.list_executions(&ExecutionFilter::default()).await.unwrap().is_empty());
    }
}


//! Execution orchestrator.
//!
//! Drives one ExecutionRecord per run request: validates input, walks the
//! stages in order, fans out branches, recurses into sub-workflows and
//! emits a lifecycle event for every transition. Stage failures are data on
//! the record; only validation problems are returned as errors.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    EventDraft, EventType, ExecutionRecord, ExecutionStatus, InputProblem, StageDefinition,
    StageKind, StageStatus, WorkflowDefinition,
};

use super::event_bus::EventPublisher;
use super::executor::{ExecutorRegistry, OutcomeStatus, StageContext, StageExecutor, StageOutcome};
use super::limits::{LimitViolation, RunLimits};
use super::registry::WorkflowRegistry;
use super::store::ExecutionStore;

/// Errors returned synchronously to the caller of `start`/`run`
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Workflow '{0}' not found")]
    NotFound(String),

    #[error("Invalid input for execution {execution_id}: {}", describe(.problems))]
    Validation {
        execution_id: Uuid,
        problems: Vec<InputProblem>,
    },

    #[error("Execution {execution_id} rejected: {violation}")]
    Limit {
        execution_id: Uuid,
        #[source]
        violation: LimitViolation,
    },
}

impl OrchestratorError {
    /// Id of the failed record, if one was created
    pub fn execution_id(&self) -> Option<Uuid> {
        match self {
            Self::NotFound(_) => None,
            Self::Validation { execution_id, .. } | Self::Limit { execution_id, .. } => Some(*execution_id),
        }
    }
}

fn describe(problems: &[InputProblem]) -> String {
    problems
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A request to run a workflow
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub workflow_id: String,

    #[serde(default)]
    pub params: Map<String, Value>,

    #[serde(default)]
    pub project_id: Option<String>,
}

impl RunRequest {
    pub fn new(workflow_id: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            params,
            project_id: None,
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }
}

/// Handle to a run started in the background
#[derive(Debug)]
pub struct RunTicket {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    handle: JoinHandle<ExecutionRecord>,
}

impl RunTicket {
    /// Wait for the run to reach a terminal status
    pub async fn wait(self) -> anyhow::Result<ExecutionRecord> {
        self.handle.await.context("Execution task aborted")
    }
}

/// Main workflow orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<WorkflowRegistry>,
    store: Arc<ExecutionStore>,
    events: Arc<dyn EventPublisher>,
    executors: Arc<ExecutorRegistry>,
    limits: RunLimits,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        store: Arc<ExecutionStore>,
        events: Arc<dyn EventPublisher>,
        executors: ExecutorRegistry,
    ) -> Self {
        Self {
            registry,
            store,
            events,
            executors: Arc::new(executors),
            limits: RunLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: RunLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<ExecutionStore> {
        &self.store
    }

    /// Validate and start a run in the background.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip(self, request), fields(workflow = %request.workflow_id))]
    pub fn start(&self, request: RunRequest) -> Result<RunTicket, OrchestratorError> {
        let (definition, record) = self.prepare(&request.workflow_id, &request.params, request.project_id)?;

        let execution_id = record.id;
        let status = record.status;
        let this = self.clone();
        let handle = tokio::spawn(async move { this.drive(definition, record, 0).await });

        Ok(RunTicket {
            execution_id,
            workflow_id: request.workflow_id,
            status,
            handle,
        })
    }

    /// Validate and run to completion
    #[instrument(skip(self, request), fields(workflow = %request.workflow_id))]
    pub async fn run(&self, request: RunRequest) -> Result<ExecutionRecord, OrchestratorError> {
        let (definition, record) = self.prepare(&request.workflow_id, &request.params, request.project_id)?;
        Ok(self.drive(definition, record, 0).await)
    }

    /// Look up the workflow and create its record.
    ///
    /// Invalid input still produces a record: Failed, zero stages, one
    /// `execution_failed` event.
    fn prepare(
        &self,
        workflow_id: &str,
        params: &Map<String, Value>,
        project_id: Option<String>,
    ) -> Result<(Arc<WorkflowDefinition>, ExecutionRecord), OrchestratorError> {
        let definition = self
            .registry
            .get(workflow_id)
            .map_err(|_| OrchestratorError::NotFound(workflow_id.to_string()))?;

        if let Err(violation) = self.limits.check_input(params) {
            let record = ExecutionRecord::new(workflow_id, params.clone(), project_id);
            let execution_id = self.reject(record, violation.to_string());
            return Err(OrchestratorError::Limit {
                execution_id,
                violation,
            });
        }

        match definition.validate_input(params) {
            Ok(input) => {
                let mut record = ExecutionRecord::new(workflow_id, input, project_id);
                record.plan_stages(&definition);
                self.store.insert(record.clone());
                debug!(execution_id = %record.id, stages = record.stages.len(), "Execution queued");
                Ok((definition, record))
            }
            Err(problems) => {
                let record = ExecutionRecord::new(workflow_id, params.clone(), project_id);
                let execution_id = self.reject(record, describe(&problems));
                Err(OrchestratorError::Validation {
                    execution_id,
                    problems,
                })
            }
        }
    }

    fn reject(&self, mut record: ExecutionRecord, reason: String) -> Uuid {
        warn!(execution_id = %record.id, %reason, "Execution rejected before any stage ran");

        record.transition(ExecutionStatus::Failed);
        record.error = Some(reason.clone());
        let execution_id = record.id;
        let workflow_id = record.workflow_id.clone();
        self.store.insert(record);

        self.emit(
            EventType::ExecutionFailed,
            EventDraft::execution(execution_id, workflow_id)
                .with_status(ExecutionStatus::Failed)
                .with_error(reason),
        );
        execution_id
    }

    /// Run every stage of a prepared record and settle its final status
    fn drive(
        &self,
        definition: Arc<WorkflowDefinition>,
        record: ExecutionRecord,
        depth: u32,
    ) -> BoxFuture<'_, ExecutionRecord> {
        async move {
            let execution_id = record.id;
            let workflow_id = record.workflow_id.clone();
            let base = || EventDraft::execution(execution_id, workflow_id.clone());

            self.store
                .update(execution_id, |r| r.transition(ExecutionStatus::Running));
            self.emit(
                EventType::ExecutionStarted,
                base().with_status(ExecutionStatus::Running),
            );
            info!(%execution_id, workflow = %workflow_id, depth, "Execution started");

            let mut outputs: Vec<(String, Value)> = Vec::new();
            let mut failure: Option<String> = None;

            for stage in &definition.stages {
                if failure.is_some() {
                    self.skip_stage(execution_id, stage);
                    self.emit(
                        EventType::StageSkipped,
                        base()
                            .with_stage(&stage.id, &stage.name)
                            .with_status(ExecutionStatus::Running)
                            .with_stage_status(StageStatus::Skipped),
                    );
                    continue;
                }

                let ctx = StageContext {
                    execution_id,
                    workflow_id: workflow_id.clone(),
                    project_id: record.project_id.clone(),
                    stage_id: stage.id.clone(),
                    stage_name: stage.name.clone(),
                    agent: stage.agent.clone(),
                    input: record.input.clone(),
                    previous: outputs.iter().cloned().collect(),
                    branch: None,
                };

                let outcome = self.run_stage(stage, &ctx, depth).await;
                let status = StageStatus::from(outcome.status);

                if status == StageStatus::Failed {
                    let reason = outcome.error.clone().unwrap_or_else(|| "stage failed".to_string());
                    warn!(%execution_id, stage = %stage.id, error = %reason, "Stage failed");
                    failure = Some(format!("Stage '{}' failed: {}", stage.name, reason));
                }
                if let Some(ref output) = outcome.output {
                    outputs.push((stage.id.clone(), output.clone()));
                }
            }

            self.finish(&definition, execution_id, &workflow_id, &outputs, failure)
        }
        .boxed()
    }

    /// Run one stage from `running` to a terminal status
    async fn run_stage(&self, stage: &StageDefinition, ctx: &StageContext, depth: u32) -> StageOutcome {
        let execution_id = ctx.execution_id;
        let base = EventDraft::execution(execution_id, &ctx.workflow_id).with_stage(&stage.id, &stage.name);

        self.store.update(execution_id, |r| {
            if let Some(s) = r.stage_mut(&stage.id) {
                s.status = StageStatus::Running;
                s.started_at.get_or_insert_with(Utc::now);
            }
        });
        self.emit(
            EventType::StageStarted,
            base.clone()
                .with_status(ExecutionStatus::Running)
                .with_stage_status(StageStatus::Running),
        );
        debug!(%execution_id, stage = %stage.id, kind = ?stage.kind(), "Stage started");

        let timeout = stage.timeout_seconds.map(Duration::from_secs);
        let outcome = match stage.kind() {
            StageKind::Single => match self.executor_for(stage, ctx) {
                Ok(executor) => self.invoke(executor, ctx, timeout).await,
                Err(outcome) => outcome,
            },
            StageKind::FanOut => self.run_fan_out(stage, ctx, timeout).await,
            StageKind::SubWorkflow => self.run_sub_workflow(stage, ctx, depth).await,
        };

        let status = StageStatus::from(outcome.status);
        self.store.update(execution_id, |r| {
            if let Some(s) = r.stage_mut(&stage.id) {
                s.status = status;
                s.completed_at = Some(Utc::now());
                s.output = outcome.output.clone();
                s.error = outcome.error.clone();
            }
            for artifact in &outcome.artifacts {
                let mut artifact = artifact.clone();
                if artifact.stage_id.is_empty() {
                    artifact.stage_id = stage.id.clone();
                }
                r.artifacts.push(artifact);
            }
        });

        let event_type = if status == StageStatus::Failed {
            EventType::StageFailed
        } else {
            EventType::StageCompleted
        };
        let mut draft = base
            .with_status(ExecutionStatus::Running)
            .with_stage_status(status);
        if let Some(ref output) = outcome.output {
            draft = draft.with_detail(output.clone());
        }
        if let Some(ref error) = outcome.error {
            draft = draft.with_error(error.clone());
        }
        self.emit(event_type, draft);

        outcome
    }

    fn executor_for(&self, stage: &StageDefinition, ctx: &StageContext) -> Result<Arc<dyn StageExecutor>, StageOutcome> {
        self.executors
            .resolve(&ctx.workflow_id, &stage.id, stage.agent.as_deref())
            .ok_or_else(|| {
                StageOutcome::failed(format!(
                    "No executor registered for stage '{}' (agent: {})",
                    stage.id,
                    stage.agent.as_deref().unwrap_or("none")
                ))
            })
    }

    /// Call an executor, converting errors, panics and timeouts into a
    /// failed outcome
    async fn invoke(&self, executor: Arc<dyn StageExecutor>, ctx: &StageContext, timeout: Option<Duration>) -> StageOutcome {
        let call = AssertUnwindSafe(executor.execute(ctx)).catch_unwind();

        let settled = match timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(settled) => settled,
                Err(_) => {
                    return StageOutcome::failed(format!(
                        "Executor '{}' timed out after {}s",
                        executor.name(),
                        limit.as_secs()
                    ))
                }
            },
            None => call.await,
        };

        match settled {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => StageOutcome::failed(format!("{:#}", e)),
            Err(panic) => {
                error!(executor = executor.name(), stage = %ctx.stage_id, "Stage executor panicked");
                StageOutcome::failed(format!("Executor '{}' panicked: {}", executor.name(), panic_message(&*panic)))
            }
        }
    }

    /// Run every branch concurrently and aggregate with the partial-failure
    /// rule. Branch events go out as each branch settles.
    async fn run_fan_out(&self, stage: &StageDefinition, ctx: &StageContext, timeout: Option<Duration>) -> StageOutcome {
        let branches = stage
            .fan_out
            .as_ref()
            .map(|spec| spec.resolve(&ctx.input))
            .unwrap_or_default();

        // Nothing ran, so nothing succeeded
        if branches.is_empty() {
            return StageOutcome::failed(format!("Stage '{}' has no branches to run", stage.id));
        }
        if let Err(violation) = self.limits.check_branches(branches.len()) {
            return StageOutcome::failed(violation.to_string());
        }
        let executor = match self.executor_for(stage, ctx) {
            Ok(executor) => executor,
            Err(outcome) => return outcome,
        };

        let mut pending: FuturesUnordered<_> = branches
            .iter()
            .enumerate()
            .map(|(idx, branch)| {
                let branch_ctx = ctx.for_branch(branch.clone());
                let executor = Arc::clone(&executor);
                async move {
                    let outcome = self.invoke(executor, &branch_ctx, timeout).await;
                    (idx, outcome)
                }
            })
            .collect();

        let mut settled: Vec<Option<StageOutcome>> = vec![None; branches.len()];
        while let Some((idx, outcome)) = pending.next().await {
            let branch = &branches[idx];
            let status = StageStatus::from(outcome.status);
            let event_type = if status == StageStatus::Failed {
                EventType::BranchFailed
            } else {
                EventType::BranchCompleted
            };

            let mut draft = EventDraft::execution(ctx.execution_id, &ctx.workflow_id)
                .with_stage(&stage.id, &stage.name)
                .with_status(ExecutionStatus::Running)
                .with_stage_status(status)
                .with_detail(json!({ "branch": branch, "output": outcome.output }));
            if let Some(ref error) = outcome.error {
                draft = draft.with_error(error.clone());
            }
            self.emit(event_type, draft);
            debug!(stage = %stage.id, %branch, ?status, "Branch settled");

            settled[idx] = Some(outcome);
        }

        let total = branches.len();
        let mut failed = 0;
        let mut summaries = Vec::with_capacity(total);
        let mut artifacts = Vec::new();
        for (branch, outcome) in branches.iter().zip(settled.into_iter().flatten()) {
            if outcome.status == OutcomeStatus::Failed {
                failed += 1;
            }
            summaries.push(json!({
                "branch": branch,
                "status": StageStatus::from(outcome.status),
                "output": outcome.output,
                "error": outcome.error,
            }));
            artifacts.extend(outcome.artifacts);
        }

        let output = json!({ "branches": summaries, "failed": failed, "total": total });
        let error = (failed > 0).then(|| format!("{} of {} branches failed", failed, total));
        let status = match StageStatus::from_branch_failures(failed, total) {
            StageStatus::Failed => OutcomeStatus::Failed,
            StageStatus::Warning => OutcomeStatus::Warning,
            _ => OutcomeStatus::Completed,
        };

        StageOutcome {
            status,
            output: Some(output),
            error,
            artifacts,
        }
    }

    /// Run another workflow as this stage. The child keeps its own
    /// execution id and events; the parent only records a summary.
    async fn run_sub_workflow(&self, stage: &StageDefinition, ctx: &StageContext, depth: u32) -> StageOutcome {
        let Some(target) = stage.workflow.as_deref() else {
            return StageOutcome::failed(format!("Stage '{}' names no sub-workflow", stage.id));
        };
        if let Err(violation) = self.limits.check_depth(depth + 1) {
            return StageOutcome::failed(violation.to_string());
        }

        let (definition, record) = match self.prepare(target, &ctx.input, ctx.project_id.clone()) {
            Ok(prepared) => prepared,
            Err(e) => {
                let mut outcome = StageOutcome::failed(e.to_string());
                if let Some(execution_id) = e.execution_id() {
                    outcome.output = Some(json!({
                        "executionId": execution_id,
                        "workflowId": target,
                        "status": ExecutionStatus::Failed,
                    }));
                }
                return outcome;
            }
        };

        let child = self.drive(definition, record, depth + 1).await;
        let output = json!({
            "executionId": child.id,
            "workflowId": child.workflow_id,
            "status": child.status,
            "result": child.result,
        });

        match child.status {
            ExecutionStatus::Completed => StageOutcome::completed(output),
            ExecutionStatus::Warning => StageOutcome::warning(
                output,
                child.error.unwrap_or_else(|| format!("Sub-workflow '{}' finished with warnings", target)),
            ),
            _ => {
                let mut outcome = StageOutcome::failed(
                    child.error.unwrap_or_else(|| format!("Sub-workflow '{}' failed", target)),
                );
                outcome.output = Some(output);
                outcome
            }
        }
    }

    fn skip_stage(&self, execution_id: Uuid, stage: &StageDefinition) {
        self.store.update(execution_id, |r| {
            if let Some(s) = r.stage_mut(&stage.id) {
                s.status = StageStatus::Skipped;
            }
        });
    }

    /// Compute the final status and result, then emit the terminal event
    fn finish(
        &self,
        definition: &WorkflowDefinition,
        execution_id: Uuid,
        workflow_id: &str,
        outputs: &[(String, Value)],
        failure: Option<String>,
    ) -> ExecutionRecord {
        let result = collect_result(definition, outputs);

        let record = self.store.update(execution_id, |r| {
            let status = final_status(r);
            r.result = Some(result.clone());
            if let Some(ref reason) = failure {
                r.error = Some(reason.clone());
            }
            r.transition(status);
            r.clone()
        });
        let Some(record) = record else {
            error!(%execution_id, "Execution record vanished from the store");
            let mut lost = ExecutionRecord::new(workflow_id, Map::new(), None);
            lost.id = execution_id;
            lost.transition(ExecutionStatus::Failed);
            lost.error = Some("Execution record lost".to_string());
            return lost;
        };

        let event_type = if record.status == ExecutionStatus::Failed {
            EventType::ExecutionFailed
        } else {
            EventType::ExecutionCompleted
        };
        let mut draft = EventDraft::execution(execution_id, workflow_id)
            .with_status(record.status)
            .with_detail(result);
        if let Some(ref error) = record.error {
            draft = draft.with_error(error.clone());
        }
        self.emit(event_type, draft);

        info!(%execution_id, workflow = %workflow_id, status = ?record.status, "Execution finished");
        record
    }

    /// Emit, logging (not propagating) a failed append
    fn emit(&self, event_type: EventType, draft: EventDraft) {
        if let Err(e) = self.events.emit(event_type, draft) {
            error!(event_type = event_type.as_str(), error = %e, "Failed to emit event");
        }
    }
}

/// Failed if any stage failed, else Warning if any warned, else Completed
fn final_status(record: &ExecutionRecord) -> ExecutionStatus {
    let any = |status| record.stages.iter().any(|s| s.status == status);
    if any(StageStatus::Failed) {
        ExecutionStatus::Failed
    } else if any(StageStatus::Warning) {
        ExecutionStatus::Warning
    } else {
        ExecutionStatus::Completed
    }
}

/// Declared outputs are picked from the latest stage output that has them;
/// without declared outputs the result maps stage id to output.
fn collect_result(definition: &WorkflowDefinition, outputs: &[(String, Value)]) -> Value {
    if definition.outputs.is_empty() {
        return Value::Object(outputs.iter().cloned().collect());
    }

    let mut result = Map::new();
    for field in &definition.outputs {
        let found = outputs
            .iter()
            .rev()
            .find_map(|(_, output)| output.as_object().and_then(|o| o.get(field)));
        if let Some(value) = found {
            result.insert(field.clone(), value.clone());
        }
    }
    Value::Object(result)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::domain::{ExecutionRecord, WorkflowDefinition};
use crate::engine::{RegistryStats, RunRequest};
use crate::server::{ApiError, AppState};

const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub async fn list_workflows(State(state): State<AppState>) -> Json<Vec<WorkflowDefinition>> {
    let workflows = state.orchestrator.registry().list();
    Json(workflows.iter().map(|w| w.as_ref().clone()).collect())
}

pub async fn workflow_stats(State(state): State<AppState>) -> Json<RegistryStats> {
    Json(state.orchestrator.registry().stats())
}

pub async fn get_workflow(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    let workflow = state.orchestrator.registry().get(&id)?;
    Ok(Json(workflow.as_ref().clone()))
}

/// Start a run and return immediately; progress arrives on the live stream
pub async fn run_workflow(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let ticket = state.orchestrator.start(request)?;
    info!(execution_id = %ticket.execution_id, workflow = %ticket.workflow_id, "Execution accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "executionId": ticket.execution_id,
            "workflowId": ticket.workflow_id,
            "status": ticket.status,
            "statusUrl": format!("/api/workflows/{}/executions/{}", ticket.workflow_id, ticket.execution_id),
            "eventsUrl": "/api/stream",
        })),
    ))
}

pub async fn list_executions(
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<ExecutionRecord>>, ApiError> {
    let history = state
        .orchestrator
        .store()
        .history(&id, query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT));

    if history.is_empty() && !state.orchestrator.registry().contains(&id) {
        return Err(ApiError::NotFound(format!("Workflow '{}' not found", id)));
    }
    Ok(Json(history))
}

pub async fn get_execution(
    Path((id, execution_id)): Path<(String, Uuid)>,
    State(state): State<AppState>,
) -> Result<Json<ExecutionRecord>, ApiError> {
    state
        .orchestrator
        .store()
        .get(&id, execution_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Execution {} not found", execution_id)))
}

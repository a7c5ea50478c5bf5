use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use super::{ApiError, AppState};

pub mod agents;
pub mod event_stream;
pub mod events;
pub mod workflows;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/workflows", get(workflows::list_workflows))
        .route("/workflows/stats", get(workflows::workflow_stats))
        .route("/workflows/run", post(workflows::run_workflow))
        .route("/workflows/{id}", get(workflows::get_workflow))
        .route("/workflows/{id}/executions", get(workflows::list_executions))
        .route("/workflows/{id}/executions/{execution_id}", get(workflows::get_execution))
        .route(
            "/workflows/{id}/executions/{execution_id}/events",
            get(events::execution_events),
        )
        .route("/stream", get(event_stream::stream_events))
        .route("/events/stats", get(events::event_stats))
        .route(
            "/agents/messages",
            get(agents::list_messages).post(agents::send_message),
        )
        .route("/agents/sessions", post(agents::start_session))
        .route(
            "/agents/sessions/{query_id}",
            get(agents::get_session).delete(agents::end_session),
        )
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "workflows": state.orchestrator.registry().stats().total,
        "executions": state.orchestrator.store().len(),
        "liveClients": state.events.live_listeners(),
    }))
}

/// Run log-backed work on the blocking pool. The JSONL logs use `std::fs`
/// and an fs2 lock, which must stay off the async workers.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::InternalError(format!("Log task failed: {}", e)))
}

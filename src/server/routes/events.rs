use axum::{
    extract::{Path, State},
    Json,
};
use uuid::Uuid;

use crate::domain::Event;
use crate::engine::EventStats;
use crate::server::{ApiError, AppState};

use super::blocking;

pub async fn event_stats(State(state): State<AppState>) -> Result<Json<EventStats>, ApiError> {
    let events = state.events.clone();
    Ok(Json(blocking(move || events.stats()).await?))
}

/// Persisted events of one execution, oldest first
pub async fn execution_events(
    Path((id, execution_id)): Path<(String, Uuid)>,
    State(state): State<AppState>,
) -> Result<Json<Vec<Event>>, ApiError> {
    if state.orchestrator.store().get(&id, execution_id).is_none() {
        return Err(ApiError::NotFound(format!("Execution {} not found", execution_id)));
    }
    let events = state.events.clone();
    Ok(Json(blocking(move || events.history_for(execution_id)).await?))
}

//! Agent messaging endpoints.
//!
//! A POST without `to` is a broadcast to every subscribed agent except the
//! sender. Budget exhaustion maps to 429.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::domain::{AgentMessage, AgentProfile, MessageDraft, Participant};
use crate::engine::{MessageQuery, Session};
use crate::server::{ApiError, AppState};

use super::blocking;

/// Either a bare agent id or a profile object
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Endpoint {
    Id(String),
    Profile(AgentProfile),
}

impl From<Endpoint> for Participant {
    fn from(endpoint: Endpoint) -> Self {
        match endpoint {
            Endpoint::Id(id) => Participant::from(id),
            Endpoint::Profile(profile) => Participant::from(&profile),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub from: Endpoint,
    #[serde(default)]
    pub to: Option<Endpoint>,
    #[serde(rename = "type", default)]
    pub message_type: Option<String>,
    #[serde(default, alias = "message")]
    pub payload: Value,
    #[serde(default)]
    pub query_id: Option<String>,
}

impl SendMessageRequest {
    fn draft(&self) -> MessageDraft {
        let mut draft = match self.payload {
            Value::String(ref text) if self.message_type.is_none() => MessageDraft::from(text.as_str()),
            ref payload => MessageDraft::new(
                self.message_type.clone().unwrap_or_else(|| "text".to_string()),
                payload.clone(),
            ),
        };
        if let Some(ref query_id) = self.query_id {
            draft = draft.in_session(query_id.clone());
        }
        draft
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub query_id: String,
    #[serde(default)]
    pub max_messages: Option<u32>,
}

pub async fn list_messages(
    Query(query): Query<MessageQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<AgentMessage>>, ApiError> {
    let messages = state.messages.clone();
    Ok(Json(blocking(move || messages.get_messages(&query)).await?))
}

pub async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<Value>, ApiError> {
    let draft = request.draft();
    let from = Participant::from(request.from);
    let to = request.to.map(Participant::from);

    // Appends hit the message log under its file lock
    let messages = state.messages.clone();
    let body = blocking(move || match to {
        Some(to) => messages.send(from, to, draft).map(|sent| json!(sent)),
        None => messages.broadcast(from, draft).map(|sent| json!(sent)),
    })
    .await??;
    Ok(Json(body))
}

pub async fn start_session(
    State(state): State<AppState>,
    Json(request): Json<StartSessionRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if request.query_id.trim().is_empty() {
        return Err(ApiError::BadRequest("queryId must not be empty".to_string()));
    }

    let max_messages = request
        .max_messages
        .unwrap_or_else(|| state.messages.default_max_messages());
    state.messages.start_session(&request.query_id, max_messages);

    Ok((
        StatusCode::CREATED,
        Json(json!({ "queryId": request.query_id, "maxMessages": max_messages, "count": 0 })),
    ))
}

pub async fn get_session(
    Path(query_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Session>, ApiError> {
    state
        .messages
        .session(&query_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Session '{}' not found", query_id)))
}

pub async fn end_session(
    Path(query_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Session>, ApiError> {
    state
        .messages
        .end_session(&query_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Session '{}' not found", query_id)))
}

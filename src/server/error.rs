use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::engine::{BusError, OrchestratorError, RegistryError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("Bad Request: {0}")]
    BadRequest(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Internal Server Error: {0}")]
    InternalError(String),
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Orchestrator(err) => match err {
                OrchestratorError::NotFound(_) => (StatusCode::NOT_FOUND, "WorkflowNotFound"),
                OrchestratorError::Validation { .. } => (StatusCode::BAD_REQUEST, "ValidationError"),
                OrchestratorError::Limit { .. } => (StatusCode::BAD_REQUEST, "LimitExceeded"),
            },
            ApiError::Registry(err) => match err {
                RegistryError::NotFound(_) => (StatusCode::NOT_FOUND, "WorkflowNotFound"),
                _ => (StatusCode::BAD_REQUEST, "InvalidWorkflow"),
            },
            ApiError::Bus(err) => match err {
                BusError::BudgetExceeded { .. } => (StatusCode::TOO_MANY_REQUESTS, "BudgetExceeded"),
                BusError::Persist(_) => (StatusCode::INTERNAL_SERVER_ERROR, "PersistError"),
            },
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BadRequest"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            ApiError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        }
    }

    fn execution_id(&self) -> Option<Uuid> {
        match self {
            ApiError::Orchestrator(err) => err.execution_id(),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, error_type) = self.status();
        if status_code.is_server_error() {
            error!(error = %self, "Request failed");
        }

        let mut body = json!({
            "success": false,
            "error": error_type,
            "message": self.to_string(),
        });
        if let Some(id) = self.execution_id() {
            body["executionId"] = json!(id);
        }
        if let ApiError::Orchestrator(OrchestratorError::Validation { ref problems, .. }) = self {
            body["problems"] = json!(problems);
        }

        (status_code, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::InputProblem;

    #[test]
    fn test_status_mapping() {
        let validation = ApiError::from(OrchestratorError::Validation {
            execution_id: Uuid::new_v4(),
            problems: vec![InputProblem::Missing {
                field: "campaignId".to_string(),
            }],
        });
        assert_eq!(validation.status().0, StatusCode::BAD_REQUEST);
        assert!(validation.execution_id().is_some());

        let missing = ApiError::from(OrchestratorError::NotFound("nope".to_string()));
        assert_eq!(missing.status().0, StatusCode::NOT_FOUND);

        let budget = ApiError::from(BusError::BudgetExceeded {
            query_id: "q".to_string(),
            max_messages: 3,
        });
        assert_eq!(budget.status().0, StatusCode::TOO_MANY_REQUESTS);
    }
}

//! HTTP and SSE surface.
//!
//! Everything lives under `/api`. Services are built once by
//! `AppState::bootstrap` and shared by every handler.

pub mod error;
pub mod routes;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::adapters::{build_executors, subscribe_agents};
use crate::config::ResolvedConfig;
use crate::domain::{EventDraft, EventType, ExecutionStatus};
use crate::engine::{CommunicationBus, EventBus, EventPublisher, ExecutionStore, Orchestrator, WorkflowRegistry};

const INTERRUPTED: &str = "Interrupted by restart";

pub use error::ApiError;

/// Shared services behind every handler
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub events: Arc<EventBus>,
    pub messages: Arc<CommunicationBus>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, events: Arc<EventBus>, messages: Arc<CommunicationBus>) -> Self {
        Self {
            orchestrator,
            events,
            messages,
        }
    }

    /// Open the logs, load workflow definitions, restore past executions
    /// from the event log and wire the configured connectors.
    pub fn bootstrap(config: &ResolvedConfig) -> Result<Self> {
        let events = Arc::new(
            EventBus::open(config.events_log_path(), config.bus.live_capacity)
                .context("Failed to open event log")?,
        );
        let messages = Arc::new(
            CommunicationBus::open(config.messages_log_path(), config.bus.max_messages_per_session)
                .context("Failed to open message log")?
                .with_events(events.clone()),
        );

        let registry = Arc::new(WorkflowRegistry::new());
        if config.workflows.is_dir() {
            registry.load_dir(&config.workflows)?;
        } else {
            warn!(dir = %config.workflows.display(), "Workflow directory not found; registry is empty");
        }

        let store = Arc::new(ExecutionStore::new());
        let restored = store.restore(events.history());
        if restored > 0 {
            info!(restored, "Executions restored from event log");
        }
        // Nothing is driving runs left over from the previous process
        for record in store.interrupt_unfinished(INTERRUPTED) {
            warn!(execution_id = %record.id, workflow = %record.workflow_id, "Execution interrupted by restart");
            let draft = EventDraft::execution(record.id, record.workflow_id)
                .with_status(ExecutionStatus::Failed)
                .with_error(INTERRUPTED);
            events
                .emit(EventType::ExecutionFailed, draft)
                .context("Failed to record interrupted execution")?;
        }

        let executors = build_executors(&config.connectors)?;
        let subscribed = subscribe_agents(&messages, &config.connectors);
        if !subscribed.is_empty() {
            info!(agents = ?subscribed, "Agents subscribed to messages");
        }

        let orchestrator =
            Orchestrator::new(registry, store, events.clone(), executors).with_limits(config.limits.clone());

        Ok(Self::new(orchestrator, events, messages))
    }
}

/// The full application router with permissive CORS
pub fn app(state: AppState) -> Router {
    Router::new()
        .nest("/api", routes::router(state))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Bind and serve until the process is stopped
pub async fn serve(config: &ResolvedConfig) -> Result<()> {
    let state = AppState::bootstrap(config)?;
    let workflows = state.orchestrator.registry().stats().total;

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    let addr = listener.local_addr()?;
    info!(%addr, workflows, "adops server listening");

    axum::serve(listener, app(state))
        .await
        .context("Server error")
}

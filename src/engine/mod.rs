//! Orchestration engine.
//!
//! This module contains:
//! - JsonlLog: Append-only durable log
//! - EventBus: Lifecycle event append + dispatch + live tail
//! - CommunicationBus: Budgeted, audited agent messaging
//! - WorkflowRegistry: Workflow catalog
//! - ExecutionStore: Mutable execution records
//! - Orchestrator: Runs workflows stage by stage

pub mod comm_bus;
pub mod event_bus;
pub mod executor;
pub mod limits;
pub mod log;
pub mod orchestrator;
pub mod registry;
pub mod store;

// Re-export commonly used types
pub use comm_bus::{AgentMessenger, BusError, CommunicationBus, MessageHandler, MessageQuery, SendResult, Session};
pub use event_bus::{EventBus, EventHandler, EventPublisher, EventStats, Subscription};
pub use executor::{ExecutorRegistry, OutcomeStatus, StageContext, StageExecutor, StageOutcome};
pub use limits::{LimitViolation, RunLimits};
pub use log::{JsonlLog, LogError};
pub use orchestrator::{Orchestrator, OrchestratorError, RunRequest, RunTicket};
pub use registry::{RegistryError, RegistryStats, WorkflowRegistry};
pub use store::ExecutionStore;

//! adops - Event-driven workflow orchestrator for ad operations
//!
//! Runs declarative, multi-stage workflows (campaign launches, pacing
//! checks, brand-safety sweeps) against external agents, and lets those
//! agents talk to each other through a budgeted, audited message bus.
//!
//! # Architecture
//!
//! - Every lifecycle transition is emitted as an immutable event and
//!   appended to a JSONL log before subscribers see it
//! - Execution records are mutable snapshots owned by the orchestrator
//! - The live channel is a tail, not a replay log: clients resync from a
//!   snapshot whenever they (re)connect
//!
//! # Modules
//!
//! - `domain`: Data structures (WorkflowDefinition, ExecutionRecord, Event, AgentMessage)
//! - `engine`: Event bus, communication bus, registry, store, orchestrator
//! - `adapters`: Stage executors for subprocess and HTTP agents
//! - `server`: axum HTTP + SSE surface
//! - `client`: Reconciliation view and reconnecting live client
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Serve the API and live stream
//! adops serve
//!
//! # Run a workflow in-process
//! adops run pacing-check --param campaignId=cmp-42
//!
//! # Follow an execution on a running server
//! adops watch pacing-check <execution-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod client;
pub mod config;
pub mod domain;
pub mod engine;
pub mod server;

// Re-export main types at crate root for convenience
pub use domain::{
    AgentMessage, Event, EventType, ExecutionRecord, ExecutionStatus, StageStatus, WorkflowDefinition,
};
pub use engine::{CommunicationBus, EventBus, ExecutionStore, Orchestrator, RunRequest, WorkflowRegistry};

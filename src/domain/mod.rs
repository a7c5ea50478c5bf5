//! Domain types for the adops orchestrator.
//!
//! This module contains the core data structures:
//! - Workflow: Immutable workflow and stage definitions
//! - Execution: Mutable per-run state
//! - Events: Immutable lifecycle facts
//! - Message: Inter-agent messages
//! - Artifact: Stage outputs worth keeping
//! - Reconcile: Folding events back into an execution record

pub mod artifact;
pub mod events;
pub mod execution;
pub mod message;
pub mod reconcile;
pub mod workflow;

// Re-export commonly used types
pub use artifact::{Artifact, ArtifactType};
pub use events::{Event, EventDraft, EventType, LiveFrame};
pub use execution::{ExecutionRecord, ExecutionStatus, StageExecution, StageStatus};
pub use message::{AgentMessage, AgentProfile, MessageDraft, Participant};
pub use workflow::{
    FanOutSpec, InputField, InputProblem, StageDefinition, StageKind, TriggerSpec,
    WorkflowDefinition,
};

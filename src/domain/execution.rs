//! Execution records.
//!
//! An ExecutionRecord is the mutable state of one workflow run. Only the
//! orchestrator mutates it; everyone else gets snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::artifact::Artifact;
use super::workflow::WorkflowDefinition;

/// Status of an execution record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, not yet running
    Queued,

    /// Stages are executing
    Running,

    /// All stages completed
    Completed,

    /// A stage (or validation) failed
    Failed,

    /// Completed with partial failures
    Warning,

    /// Stopped by an operator
    Cancelled,
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Warning => "warning",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Warning | Self::Cancelled
        )
    }
}

/// Status of a single stage (or fan-out branch)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not yet started
    Pending,

    /// Currently executing
    Running,

    Completed,

    Failed,

    /// Completed with partial failures
    Warning,

    /// Never ran because an earlier stage failed
    Skipped,
}

impl Default for StageStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Warning => "warning",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Partial-failure rule for fan-out stages: all branches failed is a
    /// failure, none failed is a success, anything in between is a warning.
    pub fn from_branch_failures(failed: usize, total: usize) -> Self {
        if failed == 0 {
            Self::Completed
        } else if failed == total {
            Self::Failed
        } else {
            Self::Warning
        }
    }
}

/// Per-stage state inside an execution record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageExecution {
    /// Stage id (matches the StageDefinition id)
    pub id: String,

    pub name: String,

    pub status: StageStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageExecution {
    pub fn pending(id: impl Into<String>, name: impl Into<String>, agent: Option<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: StageStatus::Pending,
            agent,
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
        }
    }
}

/// One concrete run of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: Uuid,

    pub workflow_id: String,

    /// Correlating project, if the run belongs to one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    pub status: ExecutionStatus,

    /// Input snapshot (after defaults were applied)
    #[serde(default)]
    pub input: Map<String, Value>,

    /// Stage states, in definition order
    #[serde(default)]
    pub stages: Vec<StageExecution>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub artifacts: Vec<Artifact>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// Create a queued record with no stages
    pub fn new(workflow_id: impl Into<String>, input: Map<String, Value>, project_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            project_id,
            status: ExecutionStatus::Queued,
            input,
            stages: Vec::new(),
            result: None,
            error: None,
            artifacts: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Populate one pending StageExecution per stage, in definition order
    pub fn plan_stages(&mut self, definition: &WorkflowDefinition) {
        self.stages = definition
            .stages
            .iter()
            .map(|s| StageExecution::pending(&s.id, &s.name, s.agent.clone()))
            .collect();
    }

    /// Move to a new status. Terminal statuses are final: returns false and
    /// leaves the record untouched if it has already finished.
    pub fn transition(&mut self, status: ExecutionStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        self.status = status;
        let now = Utc::now();
        if status == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if status.is_terminal() {
            self.completed_at = Some(now);
        }
        true
    }

    /// Close out a run that can no longer finish. Started stages fail,
    /// untouched ones are skipped. Returns false if already terminal.
    pub fn interrupt(&mut self, reason: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        let reason = reason.into();
        for stage in self.stages.iter_mut().filter(|s| !s.status.is_terminal()) {
            if stage.status == StageStatus::Pending {
                stage.status = StageStatus::Skipped;
            } else {
                stage.status = StageStatus::Failed;
                stage.error.get_or_insert_with(|| reason.clone());
            }
        }
        self.error = Some(reason);
        self.transition(ExecutionStatus::Failed)
    }

    pub fn stage(&self, stage_id: &str) -> Option<&StageExecution> {
        self.stages.iter().find(|s| s.id == stage_id)
    }

    pub fn stage_mut(&mut self, stage_id: &str) -> Option<&mut StageExecution> {
        self.stages.iter_mut().find(|s| s.id == stage_id)
    }
}

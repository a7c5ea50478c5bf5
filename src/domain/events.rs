//! Lifecycle events.
//!
//! Events are immutable facts about executions (and inter-agent traffic).
//! They are appended to a durable log and pushed to live subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::execution::{ExecutionStatus, StageStatus};
use super::message::AgentMessage;

/// A single event in the append-only event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Execution this event belongs to (None for agent traffic)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_name: Option<String>,

    /// Execution status at the time of emission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,

    /// Stage (or branch) status for stage-scoped events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_status: Option<StageStatus>,

    /// Event-specific payload (stage output, branch label, agent message)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// When this event was emitted
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Interpret an `agent_message` event's detail as the message it carries
    pub fn agent_message(&self) -> Option<AgentMessage> {
        if self.event_type != EventType::AgentMessage {
            return None;
        }
        self.detail
            .as_ref()
            .and_then(|d| serde_json::from_value(d.clone()).ok())
    }
}

/// Types of events that can occur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Validation passed, stages are about to run
    ExecutionStarted,

    /// Finished as completed or warning
    ExecutionCompleted,

    /// Finished as failed (including validation failures)
    ExecutionFailed,

    StageStarted,

    /// Stage finished as completed or warning
    StageCompleted,

    StageFailed,

    /// Stage never ran because an earlier stage failed
    StageSkipped,

    /// A fan-out branch settled successfully
    BranchCompleted,

    BranchFailed,

    /// Inter-agent message delivered to a subscribed agent
    AgentMessage,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExecutionStarted => "execution_started",
            Self::ExecutionCompleted => "execution_completed",
            Self::ExecutionFailed => "execution_failed",
            Self::StageStarted => "stage_started",
            Self::StageCompleted => "stage_completed",
            Self::StageFailed => "stage_failed",
            Self::StageSkipped => "stage_skipped",
            Self::BranchCompleted => "branch_completed",
            Self::BranchFailed => "branch_failed",
            Self::AgentMessage => "agent_message",
        }
    }

    /// Whether this event marks the end of an execution
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ExecutionCompleted | Self::ExecutionFailed)
    }
}

/// Everything about an event except the id and timestamp, which the bus stamps
#[derive(Debug, Clone, Default)]
pub struct EventDraft {
    pub execution_id: Option<Uuid>,
    pub workflow_id: Option<String>,
    pub stage_id: Option<String>,
    pub stage_name: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub stage_status: Option<StageStatus>,
    pub detail: Option<Value>,
    pub error: Option<String>,
}

impl EventDraft {
    /// Draft scoped to an execution
    pub fn execution(execution_id: Uuid, workflow_id: impl Into<String>) -> Self {
        Self {
            execution_id: Some(execution_id),
            workflow_id: Some(workflow_id.into()),
            ..Default::default()
        }
    }

    pub fn with_stage(mut self, stage_id: impl Into<String>, stage_name: impl Into<String>) -> Self {
        self.stage_id = Some(stage_id.into());
        self.stage_name = Some(stage_name.into());
        self
    }

    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_stage_status(mut self, status: StageStatus) -> Self {
        self.stage_status = Some(status);
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Stamp an id and timestamp, producing the immutable event
    pub fn stamp(self, event_type: EventType) -> Event {
        Event {
            id: Uuid::new_v4(),
            event_type,
            execution_id: self.execution_id,
            workflow_id: self.workflow_id,
            stage_id: self.stage_id,
            stage_name: self.stage_name,
            status: self.status,
            stage_status: self.stage_status,
            detail: self.detail,
            error: self.error,
            timestamp: Utc::now(),
        }
    }
}

/// A frame on the live channel.
///
/// Agent traffic gets its own `{type: "agent_message", data}` shape; every
/// other event is forwarded verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LiveFrame {
    Message(MessageFrame),
    Event(Event),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageFrame {
    #[serde(rename = "type")]
    pub frame_type: MessageFrameType,
    pub data: AgentMessage,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageFrameType {
    AgentMessage,
}

impl From<Event> for LiveFrame {
    fn from(event: Event) -> Self {
        match event.agent_message() {
            Some(data) => LiveFrame::Message(MessageFrame {
                frame_type: MessageFrameType::AgentMessage,
                data,
            }),
            None => LiveFrame::Event(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization() {
        let execution_id = Uuid::new_v4();
        let event = EventDraft::execution(execution_id, "campaign-launch")
            .with_stage("brief", "Validate Brief")
            .with_status(ExecutionStatus::Running)
            .with_stage_status(StageStatus::Running)
            .stamp(EventType::StageStarted);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stage_started");
        assert_eq!(json["executionId"], execution_id.to_string());
        assert_eq!(json["stageStatus"], "running");
        assert!(json.get("error").is_none());

        let parsed: Event = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_event_with_error() {
        let event = EventDraft::execution(Uuid::new_v4(), "wf")
            .with_error("Connection timeout")
            .stamp(EventType::StageFailed);

        assert_eq!(event.error, Some("Connection timeout".to_string()));
    }

    #[test]
    fn test_live_frame_for_agent_message() {
        let message = AgentMessage::text("pacing", "analyst", "budget is 80% spent");
        let event = EventDraft::default()
            .with_detail(serde_json::to_value(&message).unwrap())
            .stamp(EventType::AgentMessage);

        let frame = serde_json::to_value(LiveFrame::from(event)).unwrap();
        assert_eq!(frame["type"], "agent_message");
        assert_eq!(frame["data"]["from"], "pacing");
        assert_eq!(frame["data"]["payload"], json!("budget is 80% spent"));
    }

    #[test]
    fn test_live_frame_round_trip_for_stage_event() {
        let event = EventDraft::execution(Uuid::new_v4(), "wf").stamp(EventType::StageCompleted);
        let json = serde_json::to_string(&LiveFrame::from(event.clone())).unwrap();

        match serde_json::from_str::<LiveFrame>(&json).unwrap() {
            LiveFrame::Event(parsed) => assert_eq!(parsed.id, event.id),
            LiveFrame::Message(_) => panic!("stage event decoded as agent message"),
        }
    }
}

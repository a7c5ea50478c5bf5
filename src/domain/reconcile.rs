//! Folding lifecycle events into an ExecutionRecord.
//!
//! Events may arrive reordered, duplicated or with gaps. The fold keeps the
//! record consistent regardless:
//! - stages are upserted by id, appended when unseen
//! - an event's `status` overwrites the record status
//! - lifecycle timestamps are first-writer-wins
//! - failure signals set a readable error
//!
//! Statuses never move from a terminal value back to a non-terminal one, so
//! a late duplicate cannot reopen a finished stage or run. Both the store's
//! restore path and the live client's view are built on this.

use chrono::{DateTime, Utc};
use serde_json::Map;
use uuid::Uuid;

use super::events::{Event, EventType};
use super::execution::{ExecutionRecord, ExecutionStatus, StageExecution, StageStatus};

impl ExecutionRecord {
    /// Empty record for an execution known only by id
    pub fn placeholder(execution_id: Uuid, workflow_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        let mut record = ExecutionRecord::new(workflow_id, Map::new(), None);
        record.id = execution_id;
        record.created_at = created_at;
        record
    }

    /// Fold one event into the record. Returns false if the event belongs to
    /// another execution or carries nothing the record tracks.
    pub fn apply_event(&mut self, event: &Event) -> bool {
        if event.execution_id != Some(self.id) {
            return false;
        }

        if let Some(status) = event.status {
            self.fold_status(status);
        }

        match event.event_type {
            EventType::ExecutionStarted => {
                self.started_at.get_or_insert(event.timestamp);
            }
            EventType::ExecutionCompleted | EventType::ExecutionFailed => {
                self.completed_at.get_or_insert(event.timestamp);
                if let Some(ref result) = event.detail {
                    self.result.get_or_insert_with(|| result.clone());
                }
                if event.event_type == EventType::ExecutionFailed {
                    self.fold_status(ExecutionStatus::Failed);
                    if let Some(ref error) = event.error {
                        self.error = Some(error.clone());
                    }
                }
            }
            EventType::StageStarted
            | EventType::StageCompleted
            | EventType::StageFailed
            | EventType::StageSkipped => self.apply_stage_event(event),
            EventType::BranchCompleted | EventType::BranchFailed => {
                // Branch outcomes only make the stage visible
                if let Some(stage) = self.upsert_stage(event) {
                    stage.started_at.get_or_insert(event.timestamp);
                    if stage.status == StageStatus::Pending {
                        stage.status = StageStatus::Running;
                    }
                }
            }
            EventType::AgentMessage => return false,
        }
        true
    }

    fn apply_stage_event(&mut self, event: &Event) {
        let Some(stage) = self.upsert_stage(event) else {
            return;
        };

        let implied = match event.event_type {
            EventType::StageStarted => StageStatus::Running,
            EventType::StageFailed => StageStatus::Failed,
            EventType::StageSkipped => StageStatus::Skipped,
            _ => StageStatus::Completed,
        };
        let status = event.stage_status.unwrap_or(implied);
        if !stage.status.is_terminal() {
            stage.status = status;
        }

        match event.event_type {
            EventType::StageStarted => {
                stage.started_at.get_or_insert(event.timestamp);
            }
            EventType::StageSkipped => {}
            _ => {
                stage.completed_at.get_or_insert(event.timestamp);
                if let Some(ref output) = event.detail {
                    stage.output.get_or_insert_with(|| output.clone());
                }
                if event.event_type == EventType::StageFailed {
                    if let Some(ref error) = event.error {
                        stage.error = Some(error.clone());
                    } else if stage.error.is_none() {
                        stage.error = Some("Stage failed".to_string());
                    }
                }
            }
        }
    }

    fn upsert_stage(&mut self, event: &Event) -> Option<&mut StageExecution> {
        let stage_id = event.stage_id.as_deref()?;

        let idx = match self.stages.iter().position(|s| s.id == stage_id) {
            Some(idx) => idx,
            None => {
                let name = event.stage_name.clone().unwrap_or_else(|| stage_id.to_string());
                self.stages.push(StageExecution::pending(stage_id, name, None));
                self.stages.len() - 1
            }
        };
        self.stages.get_mut(idx)
    }

    fn fold_status(&mut self, status: ExecutionStatus) {
        if !self.status.is_terminal() {
            self.status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventDraft;

    #[test]
    fn test_fold_rebuilds_stage_progress() {
        let execution_id = Uuid::new_v4();
        let base = || EventDraft::execution(execution_id, "pacing-check");
        let mut record = ExecutionRecord::placeholder(execution_id, "pacing-check", Utc::now());

        record.apply_event(&base().with_status(ExecutionStatus::Running).stamp(EventType::ExecutionStarted));
        record.apply_event(
            &base()
                .with_stage("pull", "Pull Delivery")
                .with_status(ExecutionStatus::Running)
                .with_stage_status(StageStatus::Completed)
                .stamp(EventType::StageCompleted),
        );

        assert_eq!(record.status, ExecutionStatus::Running);
        assert!(record.started_at.is_some());
        assert_eq!(record.stages.len(), 1);
        assert_eq!(record.stages[0].name, "Pull Delivery");
        assert_eq!(record.stages[0].status, StageStatus::Completed);
    }

    #[test]
    fn test_agent_traffic_is_not_folded() {
        let execution_id = Uuid::new_v4();
        let mut record = ExecutionRecord::placeholder(execution_id, "pacing-check", Utc::now());

        let traffic = EventDraft::execution(execution_id, "pacing-check").stamp(EventType::AgentMessage);
        assert!(!record.apply_event(&traffic));
        assert_eq!(record.status, ExecutionStatus::Queued);
    }
}

//! Client-side reconciliation of one execution.
//!
//! The live channel may reorder, duplicate or drop events. `ExecutionView`
//! folds whatever arrives with `ExecutionRecord::apply_event`, so a late
//! duplicate cannot reopen a finished stage or run. After a reconnect the
//! caller fetches a snapshot and hands it to `resync`.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{Event, ExecutionRecord};

#[derive(Debug, Clone)]
pub struct ExecutionView {
    record: ExecutionRecord,
}

impl ExecutionView {
    /// Empty view for an execution known only by id
    pub fn new(execution_id: Uuid, workflow_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            record: ExecutionRecord::placeholder(execution_id, workflow_id, created_at),
        }
    }

    pub fn from_snapshot(snapshot: ExecutionRecord) -> Self {
        Self { record: snapshot }
    }

    pub fn execution_id(&self) -> Uuid {
        self.record.id
    }

    pub fn record(&self) -> &ExecutionRecord {
        &self.record
    }

    pub fn into_record(self) -> ExecutionRecord {
        self.record
    }

    pub fn is_terminal(&self) -> bool {
        self.record.status.is_terminal()
    }

    /// Replace local state with an authoritative snapshot
    pub fn resync(&mut self, snapshot: ExecutionRecord) {
        if snapshot.id == self.record.id {
            self.record = snapshot;
        }
    }

    /// Fold one event into the view
    pub fn apply(&mut self, event: &Event) -> bool {
        self.record.apply_event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventDraft, EventType, ExecutionStatus, StageStatus};

    struct Script {
        execution_id: Uuid,
    }

    impl Script {
        fn draft(&self) -> EventDraft {
            EventDraft::execution(self.execution_id, "pacing-check")
        }

        fn stage(&self, event_type: EventType, stage: &str, status: StageStatus) -> Event {
            self.draft()
                .with_stage(stage, stage)
                .with_status(ExecutionStatus::Running)
                .with_stage_status(status)
                .stamp(event_type)
        }
    }

    fn setup() -> (Script, ExecutionView) {
        let execution_id = Uuid::new_v4();
        (
            Script { execution_id },
            ExecutionView::new(execution_id, "pacing-check", Utc::now()),
        )
    }

    #[test]
    fn test_started_at_first_writer_wins() {
        let (script, mut view) = setup();
        let first = script.stage(EventType::StageStarted, "pull", StageStatus::Running);
        let mut duplicate = first.clone();
        duplicate.timestamp = first.timestamp + chrono::Duration::seconds(5);

        view.apply(&first);
        view.apply(&duplicate);

        assert_eq!(view.record().stages[0].started_at, Some(first.timestamp));
    }

    #[test]
    fn test_late_started_does_not_reopen_stage() {
        let (script, mut view) = setup();
        view.apply(&script.stage(EventType::StageCompleted, "pull", StageStatus::Completed));
        view.apply(&script.stage(EventType::StageStarted, "pull", StageStatus::Running));

        assert_eq!(view.record().stages.len(), 1);
        assert_eq!(view.record().stages[0].status, StageStatus::Completed);
    }

    #[test]
    fn test_terminal_record_status_is_sticky() {
        let (script, mut view) = setup();
        view.apply(
            &script
                .draft()
                .with_status(ExecutionStatus::Warning)
                .stamp(EventType::ExecutionCompleted),
        );
        view.apply(&script.stage(EventType::StageStarted, "late", StageStatus::Running));

        assert_eq!(view.record().status, ExecutionStatus::Warning);
        assert!(view.is_terminal());
    }

    #[test]
    fn test_failure_sets_error() {
        let (script, mut view) = setup();
        let mut failed = script.stage(EventType::StageFailed, "pull", StageStatus::Failed);
        failed.error = Some("DSP rejected the request".to_string());
        view.apply(&failed);
        view.apply(
            &script
                .draft()
                .with_status(ExecutionStatus::Failed)
                .with_error("Stage 'pull' failed")
                .stamp(EventType::ExecutionFailed),
        );

        assert_eq!(
            view.record().stages[0].error.as_deref(),
            Some("DSP rejected the request")
        );
        assert_eq!(view.record().error.as_deref(), Some("Stage 'pull' failed"));
        assert_eq!(view.record().status, ExecutionStatus::Failed);
    }

    #[test]
    fn test_foreign_events_ignored() {
        let (_, mut view) = setup();
        let other = EventDraft::execution(Uuid::new_v4(), "pacing-check").stamp(EventType::StageStarted);
        assert!(!view.apply(&other));
        assert!(view.record().stages.is_empty());
    }
}

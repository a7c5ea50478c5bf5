//! Reconciliation Integration Tests
//!
//! Feed the events of a real run into client views in different orders and
//! with gaps; every view must land on the same stage statuses.

use std::sync::{Arc, Mutex};

use adops::client::ExecutionView;
use adops::domain::{Event, ExecutionRecord, ExecutionStatus, StageStatus, WorkflowDefinition};
use adops::engine::{
    EventBus, EventPublisher, ExecutionStore, ExecutorRegistry, Orchestrator, RunRequest, StageContext,
    StageExecutor, StageOutcome, WorkflowRegistry,
};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map};
use tempfile::TempDir;

const WORKFLOW: &str = r#"
id: brand-safety
name: Brand Safety Sweep
inputs:
  platforms:
    type: array
    default: [ttd, dv360]
stages:
  - id: score
    name: Score Placements
    agent: scorer
    fanOut:
      branchesFrom: platforms
  - id: block
    name: Apply Blocklist
    agent: blocker
  - id: notify
    name: Notify Team
    agent: notifier
"#;

struct Scorer;

#[async_trait]
impl StageExecutor for Scorer {
    fn name(&self) -> &str {
        "scorer"
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutcome> {
        if ctx.branch.as_deref() == Some("dv360") {
            anyhow::bail!("report not ready");
        }
        Ok(StageOutcome::completed(json!({ "score": 82 })))
    }
}

struct Blocker;

#[async_trait]
impl StageExecutor for Blocker {
    fn name(&self) -> &str {
        "blocker"
    }

    async fn execute(&self, _ctx: &StageContext) -> Result<StageOutcome> {
        anyhow::bail!("blocklist API rejected the update")
    }
}

/// Run the workflow, returning the final record and every event in emission order
async fn run_once() -> (ExecutionRecord, Vec<Event>) {
    let temp = TempDir::new().unwrap();
    let bus = Arc::new(EventBus::open(temp.path().join("events.jsonl"), 64).unwrap());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _sub = bus.subscribe(Arc::new(move |e: &Event| sink.lock().unwrap().push(e.clone())));

    let registry = Arc::new(WorkflowRegistry::new());
    registry
        .register("brand-safety", WorkflowDefinition::from_yaml(WORKFLOW).unwrap())
        .unwrap();
    let mut executors = ExecutorRegistry::new();
    executors.register_agent("scorer", Arc::new(Scorer));
    executors.register_agent("blocker", Arc::new(Blocker));

    let orchestrator = Orchestrator::new(registry, Arc::new(ExecutionStore::new()), bus.clone(), executors);
    let record = orchestrator
        .run(RunRequest::new("brand-safety", Map::new()))
        .await
        .unwrap();

    let events = seen.lock().unwrap().clone();
    (record, events)
}

fn statuses(record: &ExecutionRecord) -> Vec<(String, StageStatus)> {
    let mut statuses: Vec<_> = record.stages.iter().map(|s| (s.id.clone(), s.status)).collect();
    statuses.sort_by(|a, b| a.0.cmp(&b.0));
    statuses
}

fn fresh_view(record: &ExecutionRecord) -> ExecutionView {
    ExecutionView::new(record.id, &record.workflow_id, record.created_at)
}

#[tokio::test]
async fn test_in_order_stream_matches_the_record() {
    let (record, events) = run_once().await;
    assert_eq!(record.status, ExecutionStatus::Failed);

    let mut view = fresh_view(&record);
    for event in &events {
        view.apply(event);
    }

    assert!(view.is_terminal());
    assert_eq!(view.record().status, record.status);
    assert_eq!(statuses(view.record()), statuses(&record));
    assert_eq!(
        view.record().stage("block").unwrap().error,
        record.stage("block").unwrap().error
    );
    assert_eq!(view.record().stage("notify").unwrap().status, StageStatus::Skipped);
}

#[tokio::test]
async fn test_reordered_and_duplicated_stream_converges() {
    let (record, events) = run_once().await;

    let mut in_order = fresh_view(&record);
    for event in &events {
        in_order.apply(event);
    }

    // Terminal events first, then everything again twice, newest first
    let mut view = fresh_view(&record);
    for event in events.iter().rev().chain(events.iter().rev()) {
        view.apply(event);
    }

    assert_eq!(view.record().status, ExecutionStatus::Failed);
    assert_eq!(statuses(view.record()), statuses(in_order.record()));
}

#[tokio::test]
async fn test_duplicate_lifecycle_signal_keeps_first_timestamp() {
    let (record, events) = run_once().await;
    let started = events
        .iter()
        .find(|e| e.event_type == adops::domain::EventType::ExecutionStarted)
        .unwrap();

    let mut view = fresh_view(&record);
    view.apply(started);
    let first = view.record().started_at;

    let mut late_duplicate = started.clone();
    late_duplicate.timestamp = started.timestamp + chrono::Duration::seconds(30);
    view.apply(&late_duplicate);

    assert_eq!(view.record().started_at, first);
}

#[tokio::test]
async fn test_disconnected_client_converges_after_resync() {
    let (record, events) = run_once().await;

    let mut connected = fresh_view(&record);
    for event in &events {
        connected.apply(event);
    }

    // Saw the first few events, lost the connection, missed the rest
    let mut dropped = fresh_view(&record);
    for event in events.iter().take(3) {
        dropped.apply(event);
    }
    assert!(!dropped.is_terminal());

    // Reconnect: pull the authoritative snapshot, then keep applying the tail
    dropped.resync(record.clone());
    for event in events.iter().skip(events.len() - 2) {
        dropped.apply(event);
    }

    assert_eq!(dropped.record().status, connected.record().status);
    assert_eq!(statuses(dropped.record()), statuses(connected.record()));
}

#[tokio::test]
async fn test_resync_ignores_foreign_snapshot() {
    let (record, _) = run_once().await;
    let (other, _) = run_once().await;

    let mut view = fresh_view(&record);
    view.resync(other);

    assert_eq!(view.execution_id(), record.id);
    assert!(view.record().stages.is_empty());
}

#[tokio::test]
async fn test_store_restores_records_from_events() {
    let (record, events) = run_once().await;

    let store = ExecutionStore::new();
    assert_eq!(store.restore(events), 1);

    let restored = store.get("brand-safety", record.id).unwrap();
    assert_eq!(restored.status, record.status);
    assert_eq!(statuses(&restored), statuses(&record));
}

#[test]
fn test_publisher_is_object_safe() {
    let temp = TempDir::new().unwrap();
    let bus: Arc<dyn EventPublisher> = Arc::new(EventBus::open(temp.path().join("events.jsonl"), 4).unwrap());
    let _ = bus.subscribe(Arc::new(|_: &Event| {}));
}

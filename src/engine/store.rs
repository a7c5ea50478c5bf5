//! Execution store.
//!
//! Holds the mutable ExecutionRecords. Readers always get cloned snapshots;
//! only the orchestrator mutates records, through `update`.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use tracing::debug;
use uuid::Uuid;

use crate::domain::{Event, ExecutionRecord};

/// In-memory store of execution records
#[derive(Debug, Default)]
pub struct ExecutionStore {
    records: RwLock<HashMap<Uuid, ExecutionRecord>>,
}

impl ExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a record
    pub fn insert(&self, record: ExecutionRecord) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(record.id, record);
    }

    /// Snapshot of one execution, scoped to its workflow
    pub fn get(&self, workflow_id: &str, execution_id: Uuid) -> Option<ExecutionRecord> {
        self.find(execution_id)
            .filter(|record| record.workflow_id == workflow_id)
    }

    /// Snapshot of one execution by id alone
    pub fn find(&self, execution_id: Uuid) -> Option<ExecutionRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.get(&execution_id).cloned()
    }

    /// Most recent executions of a workflow, newest first
    pub fn history(&self, workflow_id: &str, limit: usize) -> Vec<ExecutionRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut matching: Vec<ExecutionRecord> = records
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .cloned()
            .collect();

        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        matching
    }

    /// Mutate a record in place. Returns None if the id is unknown.
    pub fn update<R>(&self, execution_id: Uuid, f: impl FnOnce(&mut ExecutionRecord) -> R) -> Option<R> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.get_mut(&execution_id).map(f)
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuild records from a persisted event history.
    ///
    /// Inputs are not part of the event stream, so restored records carry an
    /// empty input snapshot. Records already in the store are left alone.
    /// Runs that never reached a terminal event are restored as they were
    /// last seen; see `interrupt_unfinished`. Returns the number of records
    /// restored.
    pub fn restore(&self, events: impl IntoIterator<Item = Event>) -> usize {
        let mut rebuilt: BTreeMap<Uuid, ExecutionRecord> = BTreeMap::new();

        for event in events {
            let (Some(execution_id), Some(workflow_id)) = (event.execution_id, event.workflow_id.as_deref()) else {
                continue;
            };
            rebuilt
                .entry(execution_id)
                .or_insert_with(|| ExecutionRecord::placeholder(execution_id, workflow_id, event.timestamp))
                .apply_event(&event);
        }

        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let mut restored = 0;
        for (id, record) in rebuilt {
            if records.contains_key(&id) {
                continue;
            }
            records.insert(id, record);
            restored += 1;
        }

        debug!(restored, "Restored executions from event log");
        restored
    }

    /// Fail every record still queued or running. Only meaningful when no
    /// orchestrator is driving them, i.e. right after a restart. Returns
    /// snapshots of the records that were closed out.
    pub fn interrupt_unfinished(&self, reason: &str) -> Vec<ExecutionRecord> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let interrupted: Vec<ExecutionRecord> = records
            .values_mut()
            .filter_map(|record| record.interrupt(reason).then(|| record.clone()))
            .collect();

        if !interrupted.is_empty() {
            debug!(count = interrupted.len(), "Interrupted unfinished executions");
        }
        interrupted
    }
}

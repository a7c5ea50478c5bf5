//! Process-wide event bus.
//!
//! `emit` stamps an event, appends it to the durable log, dispatches it
//! synchronously to every subscriber and finally pushes it onto the live
//! tail. The live tail is a bounded broadcast ring: late joiners do not get
//! history and slow readers lag rather than block the emitter.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{Event, EventDraft, EventType};

use super::log::{JsonlLog, LogError};

/// Callback invoked for every emitted event
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

type SubscriberList = RwLock<Vec<(u64, EventHandler)>>;

/// Capability to publish lifecycle events.
///
/// The in-process `EventBus` is one implementation; a broker-backed one can
/// satisfy the same contract.
pub trait EventPublisher: Send + Sync {
    /// Stamp, persist and dispatch an event
    fn emit(&self, event_type: EventType, draft: EventDraft) -> Result<Event, LogError>;

    /// Register a handler; the returned subscription removes it again
    fn subscribe(&self, handler: EventHandler) -> Subscription;
}

/// Handle returned by `subscribe`
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() -> bool + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() -> bool + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Remove the handler. Returns false if it was already gone.
    pub fn unsubscribe(mut self) -> bool {
        self.cancel.take().map(|cancel| cancel()).unwrap_or(false)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Counts recomputed from the durable log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStats {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
}

/// In-process event bus backed by a JSONL log
pub struct EventBus {
    log: JsonlLog<Event>,
    subscribers: Arc<SubscriberList>,
    next_subscriber: AtomicU64,
    live: broadcast::Sender<Event>,
}

impl EventBus {
    /// Open the bus on top of a log file (created empty if absent)
    pub fn open(path: impl Into<PathBuf>, live_capacity: usize) -> Result<Self, LogError> {
        let (live, _) = broadcast::channel(live_capacity.max(1));

        Ok(Self {
            log: JsonlLog::open(path)?,
            subscribers: Arc::new(RwLock::new(Vec::new())),
            next_subscriber: AtomicU64::new(1),
            live,
        })
    }

    /// Receiver for events emitted from now on (no replay)
    pub fn tail(&self) -> broadcast::Receiver<Event> {
        self.live.subscribe()
    }

    /// Connected live-tail receivers
    pub fn live_listeners(&self) -> usize {
        self.live.receiver_count()
    }

    /// Number of registered handlers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Total and per-type counts, recomputed from the log
    pub fn stats(&self) -> EventStats {
        let mut stats = EventStats::default();
        for event in self.log.read_lenient() {
            stats.total += 1;
            *stats
                .by_type
                .entry(event.event_type.as_str().to_string())
                .or_insert(0) += 1;
        }
        stats
    }

    /// Every persisted event, oldest first
    pub fn history(&self) -> Vec<Event> {
        self.log.read_lenient()
    }

    /// Persisted events for one execution, oldest first
    pub fn history_for(&self, execution_id: Uuid) -> Vec<Event> {
        self.log
            .read_lenient()
            .into_iter()
            .filter(|e| e.execution_id == Some(execution_id))
            .collect()
    }

    fn dispatch(&self, event: &Event) {
        // Snapshot so handlers may (un)subscribe without deadlocking
        let handlers: Vec<(u64, EventHandler)> = match self.subscribers.read() {
            Ok(list) => list.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        for (id, handler) in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!(subscriber = id, event_type = event.event_type.as_str(), "Event subscriber panicked");
            }
        }
    }
}

impl EventPublisher for EventBus {
    fn emit(&self, event_type: EventType, draft: EventDraft) -> Result<Event, LogError> {
        let event = draft.stamp(event_type);

        self.log.append(&event)?;
        self.dispatch(&event);

        // No live readers is fine
        let _ = self.live.send(event.clone());

        debug!(event_type = event_type.as_str(), execution_id = ?event.execution_id, "Event emitted");
        Ok(event)
    }

    fn subscribe(&self, handler: EventHandler) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        match self.subscribers.write() {
            Ok(mut list) => list.push((id, handler)),
            Err(poisoned) => poisoned.into_inner().push((id, handler)),
        }

        let subscribers = Arc::downgrade(&self.subscribers);
        Subscription::new(move || {
            let Some(subscribers) = subscribers.upgrade() else {
                return false;
            };
            let mut list = match subscribers.write() {
                Ok(list) => list,
                Err(poisoned) => poisoned.into_inner(),
            };
            let before = list.len();
            list.retain(|(sid, _)| *sid != id);
            list.len() != before
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn open_bus(temp: &TempDir) -> EventBus {
        EventBus::open(temp.path().join("events.jsonl"), 16).unwrap()
    }

    fn draft() -> EventDraft {
        EventDraft::execution(Uuid::new_v4(), "wf")
    }

    #[test]
    fn test_emit_persists_and_dispatches() {
        let temp = TempDir::new().unwrap();
        let bus = open_bus(&temp);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe(Arc::new(move |e: &Event| {
            sink.lock().unwrap().push(e.id);
        }));

        let event = bus.emit(EventType::ExecutionStarted, draft()).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![event.id]);
        assert_eq!(bus.history(), vec![event]);
    }

    #[test]
    fn test_panicking_subscriber_does_not_block_others() {
        let temp = TempDir::new().unwrap();
        let bus = open_bus(&temp);
        let delivered = Arc::new(AtomicUsize::new(0));

        let _bad = bus.subscribe(Arc::new(|_: &Event| panic!("subscriber bug")));
        let counter = Arc::clone(&delivered);
        let _good = bus.subscribe(Arc::new(move |_: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        bus.emit(EventType::StageStarted, draft()).unwrap();
        bus.emit(EventType::StageCompleted, draft()).unwrap();

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let temp = TempDir::new().unwrap();
        let bus = open_bus(&temp);
        let delivered = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&delivered);
        let sub = bus.subscribe(Arc::new(move |_: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        bus.emit(EventType::StageStarted, draft()).unwrap();

        assert!(sub.unsubscribe());
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(EventType::StageStarted, draft()).unwrap();

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stats_match_log_across_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let bus = open_bus(&temp);
            bus.emit(EventType::StageStarted, draft()).unwrap();
            bus.emit(EventType::StageStarted, draft()).unwrap();
            bus.emit(EventType::StageFailed, draft()).unwrap();
        }

        let stats = open_bus(&temp).stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_type["stage_started"], 2);
        assert_eq!(stats.by_type["stage_failed"], 1);
    }

    #[tokio::test]
    async fn test_live_tail_has_no_replay() {
        let temp = TempDir::new().unwrap();
        let bus = open_bus(&temp);

        bus.emit(EventType::ExecutionStarted, draft()).unwrap();
        let mut tail = bus.tail();
        let later = bus.emit(EventType::ExecutionCompleted, draft()).unwrap();

        let received = tail.recv().await.unwrap();
        assert_eq!(received.id, later.id);
        assert!(tail.try_recv().is_err());
    }
}

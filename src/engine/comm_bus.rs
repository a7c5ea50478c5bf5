//! Agent communication bus.
//!
//! Bounded, audited request/response messaging between named agents:
//! - One handler per agent id (re-subscribing replaces it)
//! - Messages tagged with a `queryId` count against that session's budget;
//!   once the budget is spent further sends fail before anything is written
//! - Every accepted message is persisted before delivery is attempted
//! - Delivery problems are reported in the result, never raised

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{AgentMessage, EventDraft, EventType, MessageDraft, Participant};

use super::event_bus::EventPublisher;
use super::log::{JsonlLog, LogError};

/// Callback that receives messages addressed to one agent
pub type MessageHandler = Arc<dyn Fn(&AgentMessage) -> anyhow::Result<()> + Send + Sync>;

/// Errors raised synchronously by `send`
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Message budget exhausted for session '{query_id}' ({max_messages} messages)")]
    BudgetExceeded { query_id: String, max_messages: u32 },

    #[error("Failed to persist message: {0}")]
    Persist(#[from] LogError),
}

/// Outcome of a single send
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub delivered: bool,
    pub message: AgentMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Message budget for one query session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub max_messages: u32,
    pub count: u32,
}

impl Session {
    pub fn new(max_messages: u32) -> Self {
        Self {
            max_messages,
            count: 0,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.max_messages.saturating_sub(self.count)
    }
}

/// Filter for the message log
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageQuery {
    pub query_id: Option<String>,
    /// Keep only the most recent N matches
    pub limit: Option<usize>,
}

/// Capability to exchange audited messages between agents.
///
/// `CommunicationBus` is the in-process implementation.
pub trait AgentMessenger: Send + Sync {
    fn send_message(&self, from: Participant, to: Participant, draft: MessageDraft) -> Result<SendResult, BusError>;

    fn broadcast_message(&self, from: Participant, draft: MessageDraft) -> Result<Vec<SendResult>, BusError>;

    fn start_session(&self, query_id: &str, max_messages: u32);

    fn end_session(&self, query_id: &str) -> Option<Session>;

    fn get_messages(&self, query: &MessageQuery) -> Vec<AgentMessage>;
}

/// In-process communication bus backed by a JSONL log
pub struct CommunicationBus {
    log: JsonlLog<AgentMessage>,
    handlers: RwLock<BTreeMap<String, MessageHandler>>,
    sessions: Mutex<HashMap<String, Session>>,
    default_max_messages: u32,
    events: Option<Arc<dyn EventPublisher>>,
}

impl CommunicationBus {
    /// Open the bus on top of a message log (created empty if absent)
    pub fn open(path: impl Into<PathBuf>, default_max_messages: u32) -> Result<Self, LogError> {
        Ok(Self {
            log: JsonlLog::open(path)?,
            handlers: RwLock::new(BTreeMap::new()),
            sessions: Mutex::new(HashMap::new()),
            default_max_messages,
            events: None,
        })
    }

    /// Publish an `agent_message` event for every delivery attempt
    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Budget applied to sessions opened without an explicit cap
    pub fn default_max_messages(&self) -> u32 {
        self.default_max_messages
    }

    /// Register the handler for an agent, replacing any previous one
    pub fn subscribe<F>(&self, agent_id: impl Into<String>, handler: F)
    where
        F: Fn(&AgentMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let agent_id = agent_id.into();
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.insert(agent_id.clone(), Arc::new(handler)).is_some() {
            debug!(agent = %agent_id, "Replaced agent handler");
        }
    }

    pub fn unsubscribe(&self, agent_id: &str) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.remove(agent_id).is_some()
    }

    /// Subscribed agent ids, sorted
    pub fn subscribed_agents(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.keys().cloned().collect()
    }

    /// Current state of a session, if it exists
    pub fn session(&self, query_id: &str) -> Option<Session> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(query_id).copied()
    }

    /// Send a message from one agent to another
    pub fn send(
        &self,
        from: impl Into<Participant>,
        to: impl Into<Participant>,
        message: impl Into<MessageDraft>,
    ) -> Result<SendResult, BusError> {
        let from = from.into();
        let to = to.into();
        let message = AgentMessage::from_draft(from.0, to.0, message.into());

        self.record(&message)?;

        let handler = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers.get(&message.to).cloned()
        };

        let Some(handler) = handler else {
            debug!(to = %message.to, id = %message.id, "Recipient not subscribed");
            return Ok(SendResult {
                error: Some(format!("Agent '{}' is not subscribed", message.to)),
                delivered: false,
                message,
            });
        };

        let error = match catch_unwind(AssertUnwindSafe(|| handler(&message))) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("Handler for '{}' failed: {:#}", message.to, e)),
            Err(_) => Some(format!("Handler for '{}' panicked", message.to)),
        };
        if let Some(ref error) = error {
            warn!(to = %message.to, id = %message.id, %error, "Message delivery failed");
        }

        self.notify(&message);

        Ok(SendResult {
            delivered: error.is_none(),
            message,
            error,
        })
    }

    /// Send to every subscribed agent except the sender, in agent id order.
    ///
    /// A budget error stops the broadcast; messages already sent stay sent.
    pub fn broadcast(
        &self,
        from: impl Into<Participant>,
        message: impl Into<MessageDraft>,
    ) -> Result<Vec<SendResult>, BusError> {
        let from = from.into();
        let draft = message.into();

        let recipients: Vec<String> = self
            .subscribed_agents()
            .into_iter()
            .filter(|agent| agent != from.as_str())
            .collect();

        recipients
            .into_iter()
            .map(|to| self.send(from.clone(), to, draft.clone()))
            .collect()
    }

    /// Start (or restart) a session with a zeroed counter
    pub fn start_session(&self, query_id: &str, max_messages: u32) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if sessions.insert(query_id.to_string(), Session::new(max_messages)).is_some() {
            info!(query_id, "Session restarted with a fresh budget");
        } else {
            debug!(query_id, max_messages, "Session started");
        }
    }

    /// End a session, returning its final state
    pub fn end_session(&self, query_id: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.remove(query_id)
    }

    /// Read the message log, filtered by session and truncated to the tail.
    /// Never fails: a missing or damaged log yields what can be read.
    pub fn get_messages(&self, query: &MessageQuery) -> Vec<AgentMessage> {
        let mut messages: Vec<AgentMessage> = self
            .log
            .read_lenient()
            .into_iter()
            .filter(|m| match query.query_id {
                Some(ref q) => m.query_id.as_deref() == Some(q.as_str()),
                None => true,
            })
            .collect();

        if let Some(limit) = query.limit {
            let skip = messages.len().saturating_sub(limit);
            messages.drain(..skip);
        }
        messages
    }

    /// Enforce the session budget and persist. The check, the write and the
    /// increment happen under one lock so the cap holds under concurrency.
    fn record(&self, message: &AgentMessage) -> Result<(), BusError> {
        let Some(ref query_id) = message.query_id else {
            self.log.append(message)?;
            return Ok(());
        };

        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let session = sessions
            .entry(query_id.clone())
            .or_insert_with(|| Session::new(self.default_max_messages));

        if session.count >= session.max_messages {
            warn!(query_id = %query_id, max = session.max_messages, "Session message budget exhausted");
            return Err(BusError::BudgetExceeded {
                query_id: query_id.clone(),
                max_messages: session.max_messages,
            });
        }

        self.log.append(message)?;
        session.count += 1;
        Ok(())
    }

    fn notify(&self, message: &AgentMessage) {
        let Some(ref events) = self.events else {
            return;
        };

        let detail = match serde_json::to_value(message) {
            Ok(detail) => detail,
            Err(e) => {
                warn!(error = %e, "Failed to encode agent message event");
                return;
            }
        };

        if let Err(e) = events.emit(EventType::AgentMessage, EventDraft::default().with_detail(detail)) {
            warn!(error = %e, id = %message.id, "Failed to publish agent message event");
        }
    }
}

impl AgentMessenger for CommunicationBus {
    fn send_message(&self, from: Participant, to: Participant, draft: MessageDraft) -> Result<SendResult, BusError> {
        self.send(from, to, draft)
    }

    fn broadcast_message(&self, from: Participant, draft: MessageDraft) -> Result<Vec<SendResult>, BusError> {
        self.broadcast(from, draft)
    }

    fn start_session(&self, query_id: &str, max_messages: u32) {
        CommunicationBus::start_session(self, query_id, max_messages)
    }

    fn end_session(&self, query_id: &str) -> Option<Session> {
        CommunicationBus::end_session(self, query_id)
    }

    fn get_messages(&self, query: &MessageQuery) -> Vec<AgentMessage> {
        CommunicationBus::get_messages(self, query)
    }
}

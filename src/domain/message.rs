//! Inter-agent messages.
//!
//! Every accepted message is written to the message log before delivery is
//! attempted and is never revisited afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A persisted message between two agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub id: Uuid,

    pub from: String,

    pub to: String,

    /// Message kind ("text", "request", "response", ...)
    #[serde(rename = "type")]
    pub message_type: String,

    pub payload: Value,

    pub timestamp: DateTime<Utc>,

    /// Session this message is counted against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
}

impl AgentMessage {
    /// Stamp a draft with an id, timestamp and resolved endpoints
    pub fn from_draft(from: String, to: String, draft: MessageDraft) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to,
            message_type: draft.message_type,
            payload: draft.payload,
            timestamp: Utc::now(),
            query_id: draft.query_id,
        }
    }

    /// Convenience constructor for plain text
    pub fn text(from: impl Into<String>, to: impl Into<String>, text: impl Into<String>) -> Self {
        Self::from_draft(from.into(), to.into(), MessageDraft::from(text.into()))
    }
}

/// The caller-supplied part of a message. Bare text converts into a
/// `text` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDraft {
    #[serde(rename = "type", default = "default_message_type")]
    pub message_type: String,

    #[serde(default)]
    pub payload: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
}

fn default_message_type() -> String {
    "text".to_string()
}

impl MessageDraft {
    pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            query_id: None,
        }
    }

    pub fn in_session(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = Some(query_id.into());
        self
    }
}

impl From<String> for MessageDraft {
    fn from(text: String) -> Self {
        Self::new(default_message_type(), Value::String(text))
    }
}

impl From<&str> for MessageDraft {
    fn from(text: &str) -> Self {
        Self::from(text.to_string())
    }
}

/// An agent as callers know it: by id, or by role when no id is set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub role: Option<String>,
}

/// A resolved message endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Participant(pub String);

impl Participant {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Participant {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for Participant {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&String> for Participant {
    fn from(id: &String) -> Self {
        Self(id.clone())
    }
}

impl From<&AgentProfile> for Participant {
    fn from(profile: &AgentProfile) -> Self {
        let id = profile
            .id
            .clone()
            .or_else(|| profile.role.clone())
            .unwrap_or_else(|| "unknown".to_string());
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bare_text_becomes_text_envelope() {
        let draft = MessageDraft::from("hello");

        assert_eq!(draft.message_type, "text");
        assert_eq!(draft.payload, json!("hello"));
        assert!(draft.query_id.is_none());
    }

    #[test]
    fn test_participant_resolution() {
        let by_id = AgentProfile {
            id: Some("pacing".to_string()),
            role: Some("Pacing Analyst".to_string()),
        };
        let by_role = AgentProfile {
            id: None,
            role: Some("trader".to_string()),
        };

        assert_eq!(Participant::from(&by_id).as_str(), "pacing");
        assert_eq!(Participant::from(&by_role).as_str(), "trader");
        assert_eq!(Participant::from("analyst").as_str(), "analyst");
    }

    #[test]
    fn test_message_wire_format() {
        let message = AgentMessage::from_draft(
            "a".to_string(),
            "b".to_string(),
            MessageDraft::new("request", json!({ "metric": "ctr" })).in_session("q-1"),
        );
        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(json["type"], "request");
        assert_eq!(json["queryId"], "q-1");
    }
}

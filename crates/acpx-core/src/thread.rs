//! Conversation projection types.
//!
//! The thread is a mutable, cached view of a session that can always be
//! rebuilt from the event log. Message and content variants are externally
//! tagged on disk (`{"User": {..}}`, `{"Text": ".."}`, the literal string
//! `"Resume"`); those tag keys are the documented exemptions to the
//! snake_case persisted-key policy.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::acp::TokenUsage;
use crate::config::AUDIT_RING_CAPACITY;

/// Mutable conversation projection, rebuildable from events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionThread {
    #[serde(default)]
    pub messages: Vec<ThreadMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Opaque model descriptor reported by the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<Value>,
    /// Opaque profile descriptor reported by the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Value>,
    /// Opaque snapshot captured when the session was first created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_project_snapshot: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cumulative_token_usage: Option<TokenUsage>,
    /// Per-request usage, keyed by the user message id that started the turn.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub request_token_usage: BTreeMap<String, TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SessionThread {
    /// Id of the most recent user message, for usage attribution.
    pub fn last_user_message_id(&self) -> Option<&str> {
        self.messages.iter().rev().find_map(|m| match m {
            ThreadMessage::User(user) => Some(user.id.as_str()),
            _ => None,
        })
    }

    pub fn has_agent_messages(&self) -> bool {
        self.messages
            .iter()
            .any(|m| matches!(m, ThreadMessage::Agent(_)))
    }

    /// Advance `updated_at` to the max of its current value and `ts`.
    pub fn touch(&mut self, ts: DateTime<Utc>) {
        match self.updated_at {
            Some(current) if current >= ts => {}
            _ => self.updated_at = Some(ts),
        }
    }
}

/// One entry in the conversation, externally tagged on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ThreadMessage {
    User(UserMessage),
    Agent(AgentMessage),
    /// Marker separating replayed history from a resumed live connection.
    Resume,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub id: String,
    pub content: Vec<UserContent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UserContent {
    Text(String),
    Mention { uri: String, content: String },
    Image {
        source: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    #[serde(default)]
    pub content: Vec<AgentContent>,
    /// Keyed by tool call id; every key matches a `ToolUse` block in
    /// `content`. Merging an update replaces only the fields it sets.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tool_results: BTreeMap<String, ToolResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentContent {
    Text(String),
    Thinking {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    RedactedThinking(String),
    ToolUse {
        id: String,
        name: String,
        raw_input: String,
        input: Value,
        is_input_complete: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought_signature: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub tool_name: String,
    pub is_error: bool,
    pub content: ToolResultContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToolResultContent {
    Text(String),
    Image(Value),
}

/// Auxiliary projection kept next to the thread.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcpxState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_mode_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub available_commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_options: Option<Value>,
    #[serde(default, skip_serializing_if = "AuditRing::is_empty")]
    pub audit_events: AuditRing,
}

/// One audited notification or client operation. `update` holds the raw
/// payload and is opaque to the key policy, as is `_meta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub kind: String,
    pub ts: DateTime<Utc>,
    pub update: Value,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// Bounded audit buffer: a true ring, oldest entries evicted at capacity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<AuditEvent>", into = "Vec<AuditEvent>")]
pub struct AuditRing {
    entries: std::collections::VecDeque<AuditEvent>,
}

impl AuditRing {
    pub fn push(&mut self, event: AuditEvent) {
        if self.entries.len() == AUDIT_RING_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AuditEvent> {
        self.entries.iter()
    }
}

impl From<Vec<AuditEvent>> for AuditRing {
    fn from(entries: Vec<AuditEvent>) -> Self {
        let mut ring = AuditRing::default();
        for event in entries {
            ring.push(event);
        }
        ring
    }
}

impl From<AuditRing> for Vec<AuditEvent> {
    fn from(ring: AuditRing) -> Self {
        ring.entries.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_are_externally_tagged() {
        let message = ThreadMessage::User(UserMessage {
            id: "u-1".into(),
            content: vec![UserContent::Text("hello".into())],
        });
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["User"]["id"], "u-1");
        assert_eq!(value["User"]["content"][0]["Text"], "hello");

        let resume = serde_json::to_value(ThreadMessage::Resume).unwrap();
        assert_eq!(resume, json!("Resume"));
    }

    #[test]
    fn last_user_message_id_scans_backwards() {
        let mut thread = SessionThread::default();
        assert_eq!(thread.last_user_message_id(), None);
        thread.messages.push(ThreadMessage::User(UserMessage {
            id: "u-1".into(),
            content: vec![],
        }));
        thread.messages.push(ThreadMessage::Agent(AgentMessage::default()));
        thread.messages.push(ThreadMessage::User(UserMessage {
            id: "u-2".into(),
            content: vec![],
        }));
        assert_eq!(thread.last_user_message_id(), Some("u-2"));
    }

    #[test]
    fn audit_ring_evicts_oldest() {
        let mut ring = AuditRing::default();
        for i in 0..(AUDIT_RING_CAPACITY + 5) {
            ring.push(AuditEvent {
                kind: "update".into(),
                ts: Utc::now(),
                update: json!({ "n": i }),
                meta: None,
            });
        }
        assert_eq!(ring.len(), AUDIT_RING_CAPACITY);
        assert_eq!(ring.iter().next().unwrap().update["n"], 5);
    }

    #[test]
    fn touch_never_moves_backwards() {
        let mut thread = SessionThread::default();
        let newer = Utc::now();
        let older = newer - chrono::Duration::seconds(10);
        thread.touch(newer);
        thread.touch(older);
        assert_eq!(thread.updated_at, Some(newer));
    }
}

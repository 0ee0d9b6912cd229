//! Append-only event envelopes, schema `acpx.event.v1`.
//!
//! Every line in the event log is one envelope. The payload is an explicit
//! sum type tagged by `type` with its body under `data`; malformed envelopes
//! are rejected before a single byte is persisted, and unknown `type` values
//! are skipped on read so newer writers stay compatible with older readers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::acp::{PermissionStats, StopReason};
use crate::error::OutputError;
use crate::keypolicy::{self, KeyPolicyViolation};

pub const EVENT_SCHEMA: &str = "acpx.event.v1";

/// Which streaming channel an `output_delta` belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaChannel {
    AgentMessage,
    AgentThought,
}

/// Event payload variants and their fixed `data` shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    TurnStarted {
        request_id: String,
    },
    OutputDelta {
        channel: DeltaChannel,
        text: String,
    },
    ToolCall {
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw_input: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw_output: Option<Value>,
    },
    Plan {
        entries: Vec<Value>,
    },
    /// Raw session update for variants without a dedicated event type
    /// (user message chunks, usage, session info, commands, mode, config).
    Update {
        update: Value,
    },
    ClientOperation {
        operation: Value,
    },
    TurnDone {
        stop_reason: StopReason,
        permission_stats: PermissionStats,
    },
    Error(OutputError),
    SessionEnsured {
        acp_session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_session_id: Option<String>,
        resumed: bool,
        created: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        load_error: Option<String>,
    },
    CancelRequested {},
    CancelResult {
        cancelled: bool,
    },
    ModeSet {
        mode_id: String,
    },
    ConfigSet {
        config_id: String,
        value: Value,
    },
    StatusSnapshot {
        record: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        queue: Option<Value>,
    },
    SessionClosed {},
    PromptQueued {
        request_id: String,
        wait_for_completion: bool,
    },
}

impl EventPayload {
    /// Stable type string, as written to the `type` field.
    pub fn type_str(&self) -> &'static str {
        match self {
            EventPayload::TurnStarted { .. } => "turn_started",
            EventPayload::OutputDelta { .. } => "output_delta",
            EventPayload::ToolCall { .. } => "tool_call",
            EventPayload::Plan { .. } => "plan",
            EventPayload::Update { .. } => "update",
            EventPayload::ClientOperation { .. } => "client_operation",
            EventPayload::TurnDone { .. } => "turn_done",
            EventPayload::Error(_) => "error",
            EventPayload::SessionEnsured { .. } => "session_ensured",
            EventPayload::CancelRequested {} => "cancel_requested",
            EventPayload::CancelResult { .. } => "cancel_result",
            EventPayload::ModeSet { .. } => "mode_set",
            EventPayload::ConfigSet { .. } => "config_set",
            EventPayload::StatusSnapshot { .. } => "status_snapshot",
            EventPayload::SessionClosed {} => "session_closed",
            EventPayload::PromptQueued { .. } => "prompt_queued",
        }
    }
}

/// One persisted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcpxEvent {
    pub schema: String,
    /// Globally unique id.
    pub event_id: String,
    /// Always equals the owning record's `acpx_record_id`.
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acp_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Unique and strictly increasing per session.
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Unpersisted event fields; the log writer assigns identity and ordering.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub payload: EventPayload,
    pub acp_session_id: Option<String>,
    pub agent_session_id: Option<String>,
    pub request_id: Option<String>,
}

impl EventDraft {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            acp_session_id: None,
            agent_session_id: None,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum EventValidationError {
    #[error("unsupported event schema {0:?}")]
    Schema(String),
    #[error("event {field} must not be empty")]
    EmptyField { field: &'static str },
    #[error("event session_id {found:?} does not match record {expected:?}")]
    SessionMismatch { expected: String, found: String },
    #[error("persisted-key policy violation: {0}")]
    KeyPolicy(#[from] KeyPolicyViolation),
    #[error("event does not serialize to an object")]
    NotAnObject,
}

/// Validate an envelope and its payload against the persisted contract.
///
/// Runs on every write before bytes reach disk, and on every read during
/// replay. `expected_session` is the owning record id when known.
pub fn validate_event(
    event: &AcpxEvent,
    expected_session: Option<&str>,
) -> Result<(), EventValidationError> {
    if event.schema != EVENT_SCHEMA {
        return Err(EventValidationError::Schema(event.schema.clone()));
    }
    if event.event_id.is_empty() {
        return Err(EventValidationError::EmptyField { field: "event_id" });
    }
    if event.session_id.is_empty() {
        return Err(EventValidationError::EmptyField { field: "session_id" });
    }
    if let Some(expected) = expected_session {
        if event.session_id != expected {
            return Err(EventValidationError::SessionMismatch {
                expected: expected.to_string(),
                found: event.session_id.clone(),
            });
        }
    }
    let value = serde_json::to_value(event).map_err(|_| EventValidationError::NotAnObject)?;
    if !value.is_object() {
        return Err(EventValidationError::NotAnObject);
    }
    keypolicy::validate_persisted_keys(&value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(payload: EventPayload) -> AcpxEvent {
        AcpxEvent {
            schema: EVENT_SCHEMA.to_string(),
            event_id: uuid::Uuid::new_v4().to_string(),
            session_id: "sess-1".to_string(),
            acp_session_id: Some("acp-1".to_string()),
            agent_session_id: None,
            request_id: Some("req-1".to_string()),
            seq: 1,
            ts: Utc::now(),
            payload,
        }
    }

    #[test]
    fn envelope_round_trips() {
        let event = envelope(EventPayload::TurnDone {
            stop_reason: StopReason::EndTurn,
            permission_stats: PermissionStats::default(),
        });
        let line = serde_json::to_string(&event).unwrap();
        let back: AcpxEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn type_and_data_are_adjacent() {
        let event = envelope(EventPayload::OutputDelta {
            channel: DeltaChannel::AgentMessage,
            text: "chunk".into(),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["schema"], EVENT_SCHEMA);
        assert_eq!(value["type"], "output_delta");
        assert_eq!(value["data"]["channel"], "agent_message");
        assert_eq!(value["data"]["text"], "chunk");
    }

    #[test]
    fn payload_type_str_matches_wire_tag() {
        let cases: Vec<EventPayload> = vec![
            EventPayload::TurnStarted { request_id: "r".into() },
            EventPayload::CancelRequested {},
            EventPayload::SessionClosed {},
            EventPayload::Update { update: json!({}) },
        ];
        for payload in cases {
            let value = serde_json::to_value(&payload).unwrap();
            assert_eq!(value["type"], payload.type_str());
        }
    }

    #[test]
    fn validation_rejects_wrong_schema_and_session() {
        let mut event = envelope(EventPayload::CancelResult { cancelled: true });
        event.schema = "acpx.event.v0".into();
        assert!(matches!(
            validate_event(&event, None),
            Err(EventValidationError::Schema(_))
        ));

        let event = envelope(EventPayload::CancelResult { cancelled: true });
        assert!(matches!(
            validate_event(&event, Some("sess-2")),
            Err(EventValidationError::SessionMismatch { .. })
        ));
        assert!(validate_event(&event, Some("sess-1")).is_ok());
    }

    #[test]
    fn validation_enforces_key_policy_on_payload() {
        // A tool_call raw_input is opaque; camelCase inside it is fine.
        let event = envelope(EventPayload::ToolCall {
            tool_call_id: "tc".into(),
            title: None,
            kind: None,
            status: None,
            raw_input: Some(json!({"filePath": "x"})),
            raw_output: None,
        });
        assert!(validate_event(&event, None).is_ok());
    }
}

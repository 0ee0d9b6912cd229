//! Typed view of the ACP surface the core consumes.
//!
//! The JSON-RPC codec and the agent subprocess transport live behind the
//! `AgentConnection` boundary in `acpx-acp`; this module defines the shapes
//! that cross that boundary. Session updates, content blocks, and client
//! operations are explicit sum types, not bags of optional fields. Wire JSON
//! uses camelCase field names and snake_case discriminator values, matching
//! what agents emit.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One `session/update` notification from the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNotification {
    pub session_id: String,
    pub update: SessionUpdate,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// Discriminated union of session update payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    AgentMessageChunk {
        content: ContentBlock,
    },
    AgentThoughtChunk {
        content: ContentBlock,
    },
    UserMessageChunk {
        content: ContentBlock,
    },
    ToolCall(ToolCallUpdate),
    ToolCallUpdate(ToolCallUpdate),
    Plan {
        entries: Vec<Value>,
    },
    #[serde(rename_all = "camelCase")]
    UsageUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_tokens: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_tokens: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_creation_input_tokens: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_read_input_tokens: Option<u64>,
        #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
    },
    SessionInfoUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    AvailableCommandsUpdate {
        available_commands: Vec<AvailableCommand>,
    },
    #[serde(rename_all = "camelCase")]
    CurrentModeUpdate {
        current_mode_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ConfigOptionUpdate {
        config_options: Value,
    },
}

/// A single content block inside a message chunk or prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Image {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uri: Option<String>,
    },
    Audio {
        #[serde(default)]
        data: Value,
    },
    ResourceLink {
        uri: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Resource {
        resource: Value,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}

/// Fields an agent may send in `tool_call` / `tool_call_update`. All fields
/// except the id are patches; absent fields leave prior state untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallUpdate {
    pub tool_call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<Value>>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// Command advertised by the agent via `available_commands_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableCommand {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// Why a prompt turn stopped. Unrecognised wire values parse as `Unknown`
/// so newer agents do not break older clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    MaxTurnRequests,
    Refusal,
    Cancelled,
    Unknown,
}

impl<'de> Deserialize<'de> for StopReason {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "end_turn" => StopReason::EndTurn,
            "max_tokens" => StopReason::MaxTokens,
            "max_turn_requests" => StopReason::MaxTurnRequests,
            "refusal" => StopReason::Refusal,
            "cancelled" => StopReason::Cancelled,
            _ => StopReason::Unknown,
        })
    }
}

/// A request the agent makes back to the client during a prompt, surfaced to
/// the formatter and answered by the non-interactive permission policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientOperation {
    #[serde(rename_all = "camelCase")]
    RequestPermission {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call: Option<Value>,
        options: Vec<PermissionOption>,
    },
    ReadTextFile {
        path: String,
    },
    WriteTextFile {
        path: String,
    },
    Terminal {
        method: String,
    },
    Unknown {
        method: String,
        #[serde(default)]
        params: Value,
    },
}

/// One selectable answer to a permission request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    pub option_id: String,
    pub name: String,
    /// `allow_once`, `allow_always`, `reject_once`, `reject_always`.
    pub kind: String,
}

/// Counters kept while a prompt runs, reported in `turn_done`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionStats {
    pub requested: u32,
    pub approved: u32,
    pub denied: u32,
    pub cancelled: u32,
}

/// Normalised token usage persisted in the thread projection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
}

impl TokenUsage {
    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none()
            && self.output_tokens.is_none()
            && self.cache_creation_input_tokens.is_none()
            && self.cache_read_input_tokens.is_none()
    }
}

/// Extract the inner-agent session id from a `_meta` object.
///
/// Accepts `agentSessionId` then `sessionId`, in that precedence. Older
/// adapter-specific aliases are deliberately not recognised.
pub fn agent_session_id_from_meta(meta: Option<&Value>) -> Option<String> {
    let meta = meta?;
    for key in ["agentSessionId", "sessionId"] {
        if let Some(id) = meta.get(key).and_then(Value::as_str) {
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_update_wire_shape() {
        let update = SessionUpdate::AgentMessageChunk {
            content: ContentBlock::text("hi"),
        };
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["sessionUpdate"], "agent_message_chunk");
        assert_eq!(value["content"]["type"], "text");
        assert_eq!(value["content"]["text"], "hi");
    }

    #[test]
    fn tool_call_update_uses_camel_case() {
        let update = SessionUpdate::ToolCallUpdate(ToolCallUpdate {
            tool_call_id: "tc-1".into(),
            raw_input: Some(json!({"path": "a.txt"})),
            ..Default::default()
        });
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["sessionUpdate"], "tool_call_update");
        assert_eq!(value["toolCallId"], "tc-1");
        assert_eq!(value["rawInput"]["path"], "a.txt");
    }

    #[test]
    fn stop_reason_tolerates_unknown_values() {
        let parsed: StopReason = serde_json::from_value(json!("end_turn")).unwrap();
        assert_eq!(parsed, StopReason::EndTurn);
        let parsed: StopReason = serde_json::from_value(json!("something_new")).unwrap();
        assert_eq!(parsed, StopReason::Unknown);
    }

    #[test]
    fn meta_session_id_precedence() {
        let meta = json!({"sessionId": "outer", "agentSessionId": "inner"});
        assert_eq!(
            agent_session_id_from_meta(Some(&meta)),
            Some("inner".to_string())
        );
        let meta = json!({"sessionId": "outer", "claudeSessionId": "legacy"});
        assert_eq!(
            agent_session_id_from_meta(Some(&meta)),
            Some("outer".to_string())
        );
        let meta = json!({"providerSessionId": "legacy"});
        assert_eq!(agent_session_id_from_meta(Some(&meta)), None);
    }
}

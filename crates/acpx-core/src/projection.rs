//! Thread projection maintenance.
//!
//! The projection consumes *event envelopes*, not raw notifications. The
//! live streaming path converts each inbound `session/update` to its event
//! payload first (via [`event_payload_for_update`]) and then applies the
//! envelope it just persisted; disk replay applies the same envelopes. One
//! code path, so the cached projection and a from-scratch replay cannot
//! diverge.

use serde_json::Value;

use crate::acp::{ContentBlock, SessionUpdate, TokenUsage, ToolCallUpdate};
use crate::event::{AcpxEvent, DeltaChannel, EventPayload};
use crate::thread::{
    AcpxState, AgentContent, AgentMessage, AuditEvent, SessionThread, ThreadMessage, ToolResult,
    ToolResultContent, UserContent, UserMessage,
};

/// Statuses that mark a tool call's input as finalised.
const INPUT_COMPLETE_HINTS: &[&str] = &["complete", "done", "success", "failed", "error", "cancel"];

/// Statuses that mark a tool result as an error.
const ERROR_HINTS: &[&str] = &["fail", "error"];

/// Working copy of the two per-session projections. The caller mutates a
/// copy during a turn and writes it back to the record when the turn
/// completes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Projection {
    pub thread: SessionThread,
    pub acpx: AcpxState,
}

/// Convert an inbound session update into the event payload that will be
/// persisted for it. Text chunks get dedicated delta events; tool calls and
/// plans get their typed events; everything else rides in a raw `update`
/// event.
pub fn event_payload_for_update(update: &SessionUpdate) -> EventPayload {
    match update {
        SessionUpdate::AgentMessageChunk {
            content: ContentBlock::Text { text },
        } => EventPayload::OutputDelta {
            channel: DeltaChannel::AgentMessage,
            text: text.clone(),
        },
        SessionUpdate::AgentThoughtChunk {
            content: ContentBlock::Text { text },
        } => EventPayload::OutputDelta {
            channel: DeltaChannel::AgentThought,
            text: text.clone(),
        },
        SessionUpdate::ToolCall(call) | SessionUpdate::ToolCallUpdate(call) => {
            EventPayload::ToolCall {
                tool_call_id: call.tool_call_id.clone(),
                title: call.title.clone(),
                kind: call.kind.clone(),
                status: call.status.clone(),
                raw_input: call.raw_input.clone(),
                raw_output: call.raw_output.clone(),
            }
        }
        SessionUpdate::Plan { entries } => EventPayload::Plan {
            entries: entries.clone(),
        },
        other => EventPayload::Update {
            update: serde_json::to_value(other).unwrap_or(Value::Null),
        },
    }
}

impl Projection {
    pub fn from_record_parts(thread: SessionThread, acpx: AcpxState) -> Self {
        Self { thread, acpx }
    }

    /// Apply one persisted envelope. Unknown or control-only payloads leave
    /// the projection untouched.
    pub fn apply_event(&mut self, event: &AcpxEvent) {
        match &event.payload {
            EventPayload::OutputDelta { channel, text } => {
                self.audit(event);
                if text.trim().is_empty() {
                    return;
                }
                match channel {
                    DeltaChannel::AgentMessage => self.append_agent_text(text),
                    DeltaChannel::AgentThought => self.append_agent_thought(text),
                }
                self.thread.touch(event.ts);
            }
            EventPayload::ToolCall {
                tool_call_id,
                title,
                kind,
                status,
                raw_input,
                raw_output,
            } => {
                self.audit(event);
                self.apply_tool_call(&ToolCallUpdate {
                    tool_call_id: tool_call_id.clone(),
                    title: title.clone(),
                    kind: kind.clone(),
                    status: status.clone(),
                    raw_input: raw_input.clone(),
                    raw_output: raw_output.clone(),
                    content: None,
                    meta: None,
                });
                self.thread.touch(event.ts);
            }
            EventPayload::Plan { .. } => {
                self.audit(event);
                self.thread.touch(event.ts);
            }
            EventPayload::Update { update } => {
                self.audit(event);
                match serde_json::from_value::<SessionUpdate>(update.clone()) {
                    Ok(parsed) => {
                        self.apply_plain_update(event, &parsed);
                        self.thread.touch(event.ts);
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "unrecognised update payload in event");
                    }
                }
            }
            EventPayload::ClientOperation { .. } => {
                self.audit(event);
            }
            _ => {}
        }
    }

    fn apply_plain_update(&mut self, event: &AcpxEvent, update: &SessionUpdate) {
        match update {
            SessionUpdate::UserMessageChunk { content } => {
                self.thread.messages.push(ThreadMessage::User(UserMessage {
                    // The envelope id is the one stable, replay-safe source
                    // of identity for this message.
                    id: event.event_id.clone(),
                    content: vec![content_to_user_content(content)],
                }));
            }
            SessionUpdate::UsageUpdate {
                input_tokens,
                output_tokens,
                cache_creation_input_tokens,
                cache_read_input_tokens,
                meta,
            } => {
                let usage = normalize_usage(
                    *input_tokens,
                    *output_tokens,
                    *cache_creation_input_tokens,
                    *cache_read_input_tokens,
                    meta.as_ref(),
                );
                if !usage.is_empty() {
                    self.thread.cumulative_token_usage = Some(usage);
                    if let Some(user_id) = self.thread.last_user_message_id().map(String::from) {
                        self.thread.request_token_usage.insert(user_id, usage);
                    }
                }
            }
            SessionUpdate::SessionInfoUpdate { title } => {
                if let Some(title) = title {
                    self.thread.title = Some(title.clone());
                }
            }
            SessionUpdate::AvailableCommandsUpdate { available_commands } => {
                self.acpx.available_commands = available_commands
                    .iter()
                    .filter(|c| !c.name.is_empty())
                    .map(|c| c.name.clone())
                    .collect();
            }
            SessionUpdate::CurrentModeUpdate { current_mode_id } => {
                self.acpx.current_mode_id = Some(current_mode_id.clone());
            }
            SessionUpdate::ConfigOptionUpdate { config_options } => {
                self.acpx.config_options = Some(config_options.clone());
            }
            // Text chunks have dedicated delta events; reaching here means a
            // non-text chunk rode in raw. Nothing in the thread models it.
            SessionUpdate::AgentMessageChunk { .. }
            | SessionUpdate::AgentThoughtChunk { .. }
            | SessionUpdate::ToolCall(_)
            | SessionUpdate::ToolCallUpdate(_)
            | SessionUpdate::Plan { .. } => {}
        }
    }

    fn audit(&mut self, event: &AcpxEvent) {
        let data = serde_json::to_value(&event.payload)
            .ok()
            .and_then(|mut v| v.get_mut("data").map(Value::take))
            .unwrap_or(Value::Null);
        self.acpx.audit_events.push(AuditEvent {
            kind: event.payload.type_str().to_string(),
            ts: event.ts,
            update: data,
            meta: None,
        });
    }

    fn last_agent_message(&mut self) -> &mut AgentMessage {
        let needs_new = !matches!(self.thread.messages.last(), Some(ThreadMessage::Agent(_)));
        if needs_new {
            self.thread
                .messages
                .push(ThreadMessage::Agent(AgentMessage::default()));
        }
        match self.thread.messages.last_mut() {
            Some(ThreadMessage::Agent(agent)) => agent,
            _ => unreachable!("agent tail ensured above"),
        }
    }

    fn append_agent_text(&mut self, text: &str) {
        let agent = self.last_agent_message();
        if let Some(AgentContent::Text(existing)) = agent.content.last_mut() {
            existing.push_str(text);
        } else {
            agent.content.push(AgentContent::Text(text.to_string()));
        }
    }

    fn append_agent_thought(&mut self, text: &str) {
        let agent = self.last_agent_message();
        if let Some(AgentContent::Thinking { text: existing, .. }) = agent.content.last_mut() {
            existing.push_str(text);
        } else {
            agent.content.push(AgentContent::Thinking {
                text: text.to_string(),
                signature: None,
            });
        }
    }

    fn apply_tool_call(&mut self, call: &ToolCallUpdate) {
        let name = tool_name(call);
        let agent = self.last_agent_message();

        let index = agent.content.iter().position(|block| {
            matches!(block, AgentContent::ToolUse { id, .. } if *id == call.tool_call_id)
        });
        let index = match index {
            Some(index) => index,
            None => {
                agent.content.push(AgentContent::ToolUse {
                    id: call.tool_call_id.clone(),
                    name: name.clone().unwrap_or_else(|| "tool_call".to_string()),
                    raw_input: String::new(),
                    input: Value::Null,
                    is_input_complete: false,
                    thought_signature: None,
                });
                agent.content.len() - 1
            }
        };
        if let AgentContent::ToolUse {
            name: block_name,
            raw_input,
            input,
            is_input_complete,
            ..
        } = &mut agent.content[index]
        {
            if let Some(name) = &name {
                *block_name = name.clone();
            }
            if let Some(value) = &call.raw_input {
                *raw_input = stringify(value);
                *input = value.clone();
            }
            if let Some(status) = &call.status {
                if contains_any(status, INPUT_COMPLETE_HINTS) {
                    *is_input_complete = true;
                }
            }
        }

        let carries_result = call.title.is_some()
            || call.kind.is_some()
            || call.raw_output.is_some()
            || call.status.is_some();
        if !carries_result {
            return;
        }
        let tool_name_for_result = name.unwrap_or_else(|| "tool_call".to_string());
        let entry = agent
            .tool_results
            .entry(call.tool_call_id.clone())
            .or_insert_with(|| ToolResult {
                tool_use_id: call.tool_call_id.clone(),
                tool_name: tool_name_for_result.clone(),
                is_error: false,
                content: ToolResultContent::Text(String::new()),
                output: None,
            });
        if call.title.is_some() || call.kind.is_some() {
            entry.tool_name = tool_name_for_result;
        }
        if let Some(status) = &call.status {
            entry.is_error = contains_any(status, ERROR_HINTS);
        }
        if let Some(raw_output) = &call.raw_output {
            entry.content = ToolResultContent::Text(stringify(raw_output));
            entry.output = Some(raw_output.clone());
        }
    }
}

/// `title > kind`, falling back to the literal `tool_call` at the call site.
fn tool_name(call: &ToolCallUpdate) -> Option<String> {
    call.title
        .clone()
        .filter(|t| !t.is_empty())
        .or_else(|| call.kind.clone().filter(|k| !k.is_empty()))
}

fn contains_any(status: &str, hints: &[&str]) -> bool {
    let status = status.to_ascii_lowercase();
    hints.iter().any(|hint| status.contains(hint))
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn content_to_user_content(content: &ContentBlock) -> UserContent {
    match content {
        ContentBlock::Text { text } => UserContent::Text(text.clone()),
        ContentBlock::ResourceLink { uri, text } => UserContent::Mention {
            uri: uri.clone(),
            content: text.clone().unwrap_or_default(),
        },
        other => UserContent::Image {
            source: serde_json::to_value(other).unwrap_or(Value::Null),
            size: None,
        },
    }
}

/// Normalise token usage from canonical top-level fields, falling back to
/// `_meta.usage` with its adapter-specific aliases.
fn normalize_usage(
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    cache_creation: Option<u64>,
    cache_read: Option<u64>,
    meta: Option<&Value>,
) -> TokenUsage {
    let usage = TokenUsage {
        input_tokens,
        output_tokens,
        cache_creation_input_tokens: cache_creation,
        cache_read_input_tokens: cache_read,
    };
    if !usage.is_empty() {
        return usage;
    }
    let Some(meta_usage) = meta.and_then(|m| m.get("usage")) else {
        return usage;
    };
    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| meta_usage.get(name).and_then(Value::as_u64))
    };
    TokenUsage {
        input_tokens: field(&["inputTokens"]),
        output_tokens: field(&["outputTokens"]),
        cache_creation_input_tokens: field(&["cachedWriteTokens", "cacheCreationInputTokens"]),
        cache_read_input_tokens: field(&["cachedReadTokens", "cacheReadInputTokens"]),
    }
}

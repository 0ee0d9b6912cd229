//! # acpx-core
//!
//! Data model for acpx, the headless Agent Client Protocol CLI: durable
//! session records, the `acpx.event.v1` envelope, the conversation
//! projection, the typed ACP surface, the persisted-key policy, and the
//! machine-stable error taxonomy. Everything here is pure data and pure
//! functions; IO lives in `acpx-store`, `acpx-acp`, and `acpx-queue`.

pub mod acp;
pub mod config;
pub mod error;
pub mod event;
pub mod format;
pub mod keypolicy;
pub mod projection;
pub mod record;
pub mod thread;

pub use acp::{
    agent_session_id_from_meta, AvailableCommand, ClientOperation, ContentBlock, PermissionOption,
    PermissionStats, SessionNotification, SessionUpdate, StopReason, TokenUsage, ToolCallUpdate,
};
pub use config::AcpxConfig;
pub use error::{detail, ErrorOrigin, OutputError, OutputErrorCode};
pub use event::{
    validate_event, AcpxEvent, DeltaChannel, EventDraft, EventPayload, EventValidationError,
    EVENT_SCHEMA,
};
pub use format::{FormatterContext, NullFormatter, OutputFormatter};
pub use keypolicy::{validate_persisted_keys, KeyPolicyViolation};
pub use projection::{event_payload_for_update, Projection};
pub use record::{EventLogState, SessionRecord};
pub use thread::{
    AcpxState, AgentContent, AgentMessage, AuditEvent, AuditRing, SessionThread, ThreadMessage,
    ToolResult, ToolResultContent, UserContent, UserMessage,
};

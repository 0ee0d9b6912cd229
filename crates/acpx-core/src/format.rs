//! Formatter interface consumed from the CLI layer.
//!
//! The core emits typed events and calls these callbacks; rendering (text,
//! JSON-lines, quiet) is the CLI's concern.

use crate::acp::{ClientOperation, SessionNotification, StopReason};
use crate::error::OutputError;
use crate::event::AcpxEvent;

/// Identity context handed to the formatter before any output.
#[derive(Debug, Clone, Default)]
pub struct FormatterContext {
    pub session_id: String,
    pub acp_session_id: Option<String>,
    pub agent_session_id: Option<String>,
    pub request_id: Option<String>,
    pub next_seq: Option<u64>,
}

/// Output sink for one CLI invocation. Implementations use interior
/// mutability; callbacks arrive from async tasks.
pub trait OutputFormatter: Send + Sync {
    fn set_context(&self, context: FormatterContext);
    fn on_event(&self, event: &AcpxEvent);
    fn on_session_update(&self, notification: &SessionNotification);
    fn on_client_operation(&self, operation: &ClientOperation);
    fn on_error(&self, error: &OutputError);
    fn on_done(&self, stop_reason: StopReason);
    fn flush(&self);
}

/// No-op formatter for callers that only want the returned values.
#[derive(Debug, Default)]
pub struct NullFormatter;

impl OutputFormatter for NullFormatter {
    fn set_context(&self, _context: FormatterContext) {}
    fn on_event(&self, _event: &AcpxEvent) {}
    fn on_session_update(&self, _notification: &SessionNotification) {}
    fn on_client_operation(&self, _operation: &ClientOperation) {}
    fn on_error(&self, _error: &OutputError) {}
    fn on_done(&self, _stop_reason: StopReason) {}
    fn flush(&self) {}
}

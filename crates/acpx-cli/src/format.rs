//! Output formatters.
//!
//! `text` streams agent output for humans, `json` emits one JSON object per
//! callback for machine consumers (error codes mapped to their JSON-RPC
//! values), `quiet` stays silent except for errors on stderr.

use std::io::Write;
use std::sync::Mutex;

use acpx_core::{
    AcpxEvent, ClientOperation, ContentBlock, FormatterContext, OutputError, OutputFormatter,
    SessionNotification, SessionUpdate, StopReason,
};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputMode {
    Text,
    Json,
    Quiet,
}

pub fn make_formatter(mode: OutputMode) -> Box<dyn OutputFormatter> {
    match mode {
        OutputMode::Text => Box::new(TextFormatter::default()),
        OutputMode::Json => Box::new(JsonLinesFormatter::default()),
        OutputMode::Quiet => Box::new(QuietFormatter),
    }
}

/// Human-oriented streaming output.
#[derive(Default)]
pub struct TextFormatter {
    wrote_output: Mutex<bool>,
}

impl TextFormatter {
    fn print(&self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
        *self.wrote_output.lock().unwrap() = true;
    }
}

impl OutputFormatter for TextFormatter {
    fn set_context(&self, _context: FormatterContext) {}

    fn on_event(&self, event: &AcpxEvent) {
        if let acpx_core::EventPayload::StatusSnapshot { record, queue } = &event.payload {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(
                stdout,
                "{}",
                serde_json::to_string_pretty(&json!({ "record": record, "queue": queue }))
                    .unwrap_or_default()
            );
        }
    }

    fn on_session_update(&self, notification: &SessionNotification) {
        match &notification.update {
            SessionUpdate::AgentMessageChunk {
                content: ContentBlock::Text { text },
            } => self.print(text),
            SessionUpdate::ToolCall(call) | SessionUpdate::ToolCallUpdate(call) => {
                if let Some(title) = &call.title {
                    eprintln!("[tool] {title}");
                }
            }
            _ => {}
        }
    }

    fn on_client_operation(&self, operation: &ClientOperation) {
        if let ClientOperation::RequestPermission { .. } = operation {
            eprintln!("[permission requested]");
        }
    }

    fn on_error(&self, error: &OutputError) {
        eprintln!("error: {}", error.message);
    }

    fn on_done(&self, _stop_reason: StopReason) {
        if *self.wrote_output.lock().unwrap() {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(b"\n");
            let _ = stdout.flush();
        }
    }

    fn flush(&self) {
        let _ = std::io::stdout().lock().flush();
    }
}

/// One JSON object per line, machine stable.
#[derive(Default)]
pub struct JsonLinesFormatter;

impl JsonLinesFormatter {
    fn emit(&self, value: serde_json::Value) {
        let mut stdout = std::io::stdout().lock();
        if let Ok(line) = serde_json::to_string(&value) {
            let _ = writeln!(stdout, "{line}");
        }
    }
}

impl OutputFormatter for JsonLinesFormatter {
    fn set_context(&self, context: FormatterContext) {
        self.emit(json!({
            "type": "context",
            "sessionId": context.session_id,
            "acpSessionId": context.acp_session_id,
            "agentSessionId": context.agent_session_id,
            "requestId": context.request_id,
            "nextSeq": context.next_seq,
        }));
    }

    fn on_event(&self, event: &AcpxEvent) {
        self.emit(json!({ "type": "event", "event": event }));
    }

    fn on_session_update(&self, notification: &SessionNotification) {
        self.emit(json!({ "type": "session_update", "notification": notification }));
    }

    fn on_client_operation(&self, operation: &ClientOperation) {
        self.emit(json!({ "type": "client_operation", "operation": operation }));
    }

    fn on_error(&self, error: &OutputError) {
        self.emit(json!({
            "type": "error",
            "code": error.code.json_rpc_code(),
            "codeName": error.code,
            "detailCode": error.detail_code,
            "origin": error.origin,
            "message": error.message,
            "retryable": error.retryable,
            "acp": error.acp,
        }));
    }

    fn on_done(&self, stop_reason: StopReason) {
        self.emit(json!({ "type": "done", "stopReason": stop_reason }));
    }

    fn flush(&self) {
        let _ = std::io::stdout().lock().flush();
    }
}

/// Silent except for errors.
pub struct QuietFormatter;

impl OutputFormatter for QuietFormatter {
    fn set_context(&self, _context: FormatterContext) {}
    fn on_event(&self, _event: &AcpxEvent) {}
    fn on_session_update(&self, _notification: &SessionNotification) {}
    fn on_client_operation(&self, _operation: &ClientOperation) {}
    fn on_error(&self, error: &OutputError) {
        eprintln!("error: {}", error.message);
    }
    fn on_done(&self, _stop_reason: StopReason) {}
    fn flush(&self) {}
}

//! Machine-stable error taxonomy shared by every acpx layer.
//!
//! Errors crossing the IPC socket, the event log, or the CLI boundary are
//! normalised into [`OutputError`] so that JSON consumers and exit-code
//! checks see the same stable vocabulary regardless of which subsystem
//! produced the failure.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error codes surfaced to formatters and mapped to process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputErrorCode {
    /// Resource/session not found; no session for the working directory.
    NoSession,
    /// A deadline elapsed.
    Timeout,
    /// The user or a policy denied a permission request.
    PermissionDenied,
    /// A permission prompt was required but the run is non-interactive.
    PermissionPromptUnavailable,
    /// Internal or unexpected failure.
    Runtime,
    /// Bad input from the caller.
    Usage,
}

impl OutputErrorCode {
    /// JSON-RPC error code used when rendering errors as JSON output.
    pub fn json_rpc_code(self) -> i64 {
        match self {
            OutputErrorCode::NoSession => -32002,
            OutputErrorCode::Timeout => -32070,
            OutputErrorCode::PermissionDenied => -32071,
            OutputErrorCode::PermissionPromptUnavailable => -32072,
            OutputErrorCode::Runtime => -32603,
            OutputErrorCode::Usage => -32602,
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(self) -> i32 {
        match self {
            OutputErrorCode::NoSession => 4,
            OutputErrorCode::Timeout => 3,
            OutputErrorCode::PermissionDenied => 5,
            OutputErrorCode::PermissionPromptUnavailable => 5,
            OutputErrorCode::Runtime => 1,
            OutputErrorCode::Usage => 2,
        }
    }
}

/// Which layer produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorOrigin {
    Cli,
    Runtime,
    Queue,
    Acp,
}

/// Free-form machine strings carried in [`OutputError::detail_code`].
pub mod detail {
    pub const QUEUE_OWNER_CLOSED: &str = "QUEUE_OWNER_CLOSED";
    pub const QUEUE_OWNER_SHUTTING_DOWN: &str = "QUEUE_OWNER_SHUTTING_DOWN";
    pub const QUEUE_DISCONNECTED_BEFORE_ACK: &str = "QUEUE_DISCONNECTED_BEFORE_ACK";
    pub const QUEUE_CONTROL_REQUEST_FAILED: &str = "QUEUE_CONTROL_REQUEST_FAILED";
    pub const QUEUE_RUNTIME_PROMPT_FAILED: &str = "QUEUE_RUNTIME_PROMPT_FAILED";
    pub const QUEUE_PROTOCOL_INVALID_JSON: &str = "QUEUE_PROTOCOL_INVALID_JSON";
    pub const QUEUE_NOT_ACCEPTING_REQUESTS: &str = "QUEUE_NOT_ACCEPTING_REQUESTS";
    pub const AUTH_REQUIRED: &str = "AUTH_REQUIRED";
    pub const INTERRUPTED: &str = "INTERRUPTED";
}

/// Normalised error shape surfaced to formatters, the IPC socket, and the
/// persisted event log. Serialises with snake_case keys (the persisted
/// contract); the queue wire re-maps to its own camelCase frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct OutputError {
    pub code: OutputErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<ErrorOrigin>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    /// Raw ACP error body, when the failure originated on the agent side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acp: Option<serde_json::Value>,
}

impl OutputError {
    pub fn new(code: OutputErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            detail_code: None,
            origin: None,
            message: message.into(),
            retryable: None,
            acp: None,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(OutputErrorCode::Runtime, message)
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::new(OutputErrorCode::Usage, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(OutputErrorCode::Timeout, message)
    }

    pub fn no_session(message: impl Into<String>) -> Self {
        Self::new(OutputErrorCode::NoSession, message)
    }

    pub fn with_detail(mut self, detail_code: &str) -> Self {
        self.detail_code = Some(detail_code.to_string());
        self
    }

    pub fn with_origin(mut self, origin: ErrorOrigin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn with_acp(mut self, acp: serde_json::Value) -> Self {
        self.acp = Some(acp);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_json_rpc_and_exit_codes() {
        assert_eq!(OutputErrorCode::NoSession.json_rpc_code(), -32002);
        assert_eq!(OutputErrorCode::Timeout.json_rpc_code(), -32070);
        assert_eq!(OutputErrorCode::PermissionDenied.json_rpc_code(), -32071);
        assert_eq!(
            OutputErrorCode::PermissionPromptUnavailable.json_rpc_code(),
            -32072
        );
        assert_eq!(OutputErrorCode::Runtime.json_rpc_code(), -32603);
        assert_eq!(OutputErrorCode::Usage.json_rpc_code(), -32602);

        assert_eq!(OutputErrorCode::NoSession.exit_code(), 4);
        assert_eq!(OutputErrorCode::Timeout.exit_code(), 3);
        assert_eq!(OutputErrorCode::PermissionDenied.exit_code(), 5);
        assert_eq!(OutputErrorCode::Runtime.exit_code(), 1);
        assert_eq!(OutputErrorCode::Usage.exit_code(), 2);
    }

    #[test]
    fn serializes_with_screaming_code_and_snake_keys() {
        let err = OutputError::runtime("boom")
            .with_detail(detail::QUEUE_OWNER_SHUTTING_DOWN)
            .with_origin(ErrorOrigin::Queue)
            .with_retryable(true);
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], "RUNTIME");
        assert_eq!(value["detail_code"], "QUEUE_OWNER_SHUTTING_DOWN");
        assert_eq!(value["origin"], "queue");
        assert_eq!(value["retryable"], true);

        let back: OutputError = serde_json::from_value(value).unwrap();
        assert_eq!(back, err);
    }
}

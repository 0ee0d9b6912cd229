//! IPC wire protocol between submitters and the queue owner.
//!
//! Newline-delimited JSON, one request per connection, camelCase field
//! names. The owner answers a valid request with `accepted`, may stream
//! any number of intermediate messages, and closes after the terminal one.
//! The validator is strict: unknown types and missing fields are protocol
//! errors, not best-effort parses.

use acpx_core::{
    detail, ClientOperation, ErrorOrigin, OutputError, OutputErrorCode, PermissionStats,
    SessionNotification, StopReason,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client-to-owner request. Exactly one per connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueRequest {
    #[serde(rename_all = "camelCase")]
    SubmitPrompt {
        request_id: String,
        message: String,
        permission_mode: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        non_interactive_permissions: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        wait_for_completion: bool,
    },
    #[serde(rename_all = "camelCase")]
    CancelPrompt { request_id: String },
    #[serde(rename_all = "camelCase")]
    SetMode {
        request_id: String,
        mode_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    SetConfigOption {
        request_id: String,
        config_id: String,
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
}

impl QueueRequest {
    pub fn request_id(&self) -> &str {
        match self {
            QueueRequest::SubmitPrompt { request_id, .. }
            | QueueRequest::CancelPrompt { request_id }
            | QueueRequest::SetMode { request_id, .. }
            | QueueRequest::SetConfigOption { request_id, .. } => request_id,
        }
    }
}

/// Completed prompt summary carried by the terminal `result` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub request_id: String,
    pub stop_reason: StopReason,
    pub permission_stats: PermissionStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acp_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
}

/// Owner-to-client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OwnerMessage {
    /// Always the first reply to a valid request.
    #[serde(rename_all = "camelCase")]
    Accepted { request_id: String },
    SessionUpdate {
        notification: SessionNotification,
    },
    ClientOperation {
        operation: ClientOperation,
    },
    #[serde(rename_all = "camelCase")]
    Done { stop_reason: StopReason },
    Result {
        result: SendResult,
    },
    CancelResult {
        cancelled: bool,
    },
    #[serde(rename_all = "camelCase")]
    SetModeResult { mode_id: String },
    SetConfigOptionResult {
        response: Value,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: OutputErrorCode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail_code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<ErrorOrigin>,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retryable: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        acp: Option<Value>,
    },
}

impl OwnerMessage {
    pub fn error(request_id: Option<String>, err: &OutputError) -> Self {
        OwnerMessage::Error {
            request_id,
            code: err.code,
            detail_code: err.detail_code.clone(),
            origin: err.origin,
            message: err.message.clone(),
            retryable: err.retryable,
            acp: err.acp.clone(),
        }
    }
}

/// Rebuild the typed error from an `error` wire message.
pub fn error_from_message(message: &OwnerMessage) -> Option<OutputError> {
    match message {
        OwnerMessage::Error {
            code,
            detail_code,
            origin,
            message,
            retryable,
            acp,
            ..
        } => Some(OutputError {
            code: *code,
            detail_code: detail_code.clone(),
            origin: *origin,
            message: message.clone(),
            retryable: *retryable,
            acp: acp.clone(),
        }),
        _ => None,
    }
}

/// Strictly parse one request line.
pub fn parse_request(line: &str) -> Result<QueueRequest, OutputError> {
    serde_json::from_str(line).map_err(|err| {
        OutputError::new(
            OutputErrorCode::Runtime,
            format!("invalid queue request: {err}"),
        )
        .with_detail(detail::QUEUE_PROTOCOL_INVALID_JSON)
        .with_origin(ErrorOrigin::Queue)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn submit_prompt_round_trips_with_camel_case_keys() {
        let request = QueueRequest::SubmitPrompt {
            request_id: "req-1".into(),
            message: "hello".into(),
            permission_mode: "default".into(),
            non_interactive_permissions: Some(json!("allow")),
            timeout_ms: Some(5_000),
            wait_for_completion: true,
        };
        let line = serde_json::to_string(&request).unwrap();
        assert!(line.contains("\"type\":\"submit_prompt\""));
        assert!(line.contains("\"requestId\":\"req-1\""));
        assert!(line.contains("\"permissionMode\":\"default\""));
        assert!(line.contains("\"waitForCompletion\":true"));
        assert_eq!(parse_request(&line).unwrap(), request);
    }

    #[test]
    fn unknown_type_and_missing_fields_are_rejected() {
        assert!(parse_request("not-json").is_err());
        assert!(parse_request(r#"{"type":"frobnicate","requestId":"x"}"#).is_err());
        // submit_prompt without message
        assert!(parse_request(
            r#"{"type":"submit_prompt","requestId":"x","permissionMode":"default","waitForCompletion":true}"#
        )
        .is_err());

        let err = parse_request("not-json").unwrap_err();
        assert!(err.message.to_lowercase().contains("invalid queue request"));
        assert_eq!(
            err.detail_code.as_deref(),
            Some(detail::QUEUE_PROTOCOL_INVALID_JSON)
        );
    }

    #[test]
    fn owner_error_round_trips_through_wire_shape() {
        let source = OutputError::timeout("deadline elapsed")
            .with_origin(ErrorOrigin::Queue)
            .with_detail(detail::QUEUE_CONTROL_REQUEST_FAILED)
            .with_retryable(true);
        let message = OwnerMessage::error(Some("req-9".into()), &source);
        let line = serde_json::to_string(&message).unwrap();
        assert!(line.contains("\"code\":\"TIMEOUT\""));
        assert!(line.contains("\"detailCode\""));
        assert!(line.contains("\"requestId\":\"req-9\""));

        let parsed: OwnerMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(error_from_message(&parsed).unwrap(), source);
    }

    #[test]
    fn terminal_result_message_shape() {
        let message = OwnerMessage::Result {
            result: SendResult {
                request_id: "req-1".into(),
                stop_reason: StopReason::EndTurn,
                permission_stats: PermissionStats::default(),
                acp_session_id: Some("acp-1".into()),
                agent_session_id: None,
            },
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "result");
        assert_eq!(value["result"]["stopReason"], "end_turn");
        assert_eq!(value["result"]["acpSessionId"], "acp-1");
    }
}

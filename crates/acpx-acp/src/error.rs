//! Error types for the agent connection layer.

use acpx_core::{ErrorOrigin, OutputError, OutputErrorCode};
use thiserror::Error;

pub type AcpResult<T> = std::result::Result<T, AcpError>;

/// JSON-RPC error code agents use for missing resources/sessions.
pub const RPC_RESOURCE_NOT_FOUND: i64 = -32002;
/// Secondary not-found code emitted by some adapters.
pub const RPC_NOT_FOUND_ALT: i64 = -32001;
/// JSON-RPC internal error.
pub const RPC_INTERNAL_ERROR: i64 = -32603;
/// Code some agents use to signal that authentication is required.
pub const RPC_AUTH_REQUIRED: i64 = -32000;

#[derive(Debug, Error)]
pub enum AcpError {
    /// Typed error returned by the agent over JSON-RPC.
    #[error("agent error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("failed to spawn agent: {0}")]
    Spawn(String),

    #[error("agent connection closed: {0}")]
    Disconnected(String),

    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AcpError {
    /// The JSON-RPC error body, for surfacing to formatters.
    pub fn acp_body(&self) -> Option<serde_json::Value> {
        match self {
            AcpError::Rpc { code, message, data } => Some(serde_json::json!({
                "code": code,
                "message": message,
                "data": data,
            })),
            _ => None,
        }
    }
}

impl From<AcpError> for OutputError {
    fn from(err: AcpError) -> Self {
        let message = err.to_string();
        let body = err.acp_body();
        match err {
            AcpError::Timeout(_) => {
                OutputError::timeout(message).with_origin(ErrorOrigin::Runtime)
            }
            AcpError::Rpc { code, .. } => {
                let mut out = match code {
                    RPC_RESOURCE_NOT_FOUND | RPC_NOT_FOUND_ALT => {
                        OutputError::new(OutputErrorCode::NoSession, message)
                    }
                    _ => OutputError::runtime(message),
                };
                if code == RPC_AUTH_REQUIRED {
                    out = out.with_detail(acpx_core::detail::AUTH_REQUIRED);
                }
                out = out.with_origin(ErrorOrigin::Acp);
                if let Some(body) = body {
                    out = out.with_acp(body);
                }
                out
            }
            _ => OutputError::runtime(message).with_origin(ErrorOrigin::Runtime),
        }
    }
}

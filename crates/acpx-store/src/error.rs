//! Store error types.

use acpx_core::{ErrorOrigin, EventValidationError, OutputError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no session matches {query:?}")]
    NotFound { query: String },

    #[error("session id suffix {query:?} is ambiguous ({matches} matches)")]
    Ambiguous { query: String, matches: usize },

    #[error("invalid event: {0}")]
    InvalidEvent(#[from] EventValidationError),

    #[error("event seq {found} does not follow cursor {expected}")]
    SeqMismatch { expected: u64, found: u64 },
}

impl From<StoreError> for OutputError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::NotFound { .. } => {
                OutputError::no_session(err.to_string()).with_origin(ErrorOrigin::Runtime)
            }
            StoreError::Ambiguous { .. } => {
                OutputError::usage(err.to_string()).with_origin(ErrorOrigin::Cli)
            }
            _ => OutputError::runtime(err.to_string()).with_origin(ErrorOrigin::Runtime),
        }
    }
}

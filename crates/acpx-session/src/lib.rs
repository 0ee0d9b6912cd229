//! # acpx-session
//!
//! The session orchestrator: the public entry points the CLI dispatcher
//! calls (`send`, `cancel`, `set_mode`, `set_config_option`, `ensure`,
//! `close_session`, `status`), routed first at a running queue owner and
//! falling back to lease acquisition or a direct one-shot connection.

pub mod orchestrator;

pub use orchestrator::{
    EnsureOutcome, SendOptions, SendOutcome, SessionOrchestrator, SessionStatus,
};

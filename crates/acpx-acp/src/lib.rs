//! # acpx-acp
//!
//! The `AgentConnection` capability for acpx: how the client spawns an ACP
//! agent subprocess, resumes or rebuilds sessions against it, and serialises
//! one prompt turn at a time with deferred cancellation. The JSON-RPC codec
//! lives entirely inside the stdio transport; everything above it works
//! against the trait.

pub mod connect;
pub mod connection;
pub mod error;
pub mod permissions;
pub mod process;
pub mod stdio;
pub mod turn;

// Scripted agent connection for tests (mirrors the real transport's
// observable behaviour without a subprocess).
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use connect::{connect_and_load, ConnectOutcome};
pub use connection::{
    AgentConnection, AgentConnectionFactory, AgentEvent, AgentExit, AgentLifecycleSnapshot,
    AgentSpawnSpec, CreateSessionOutcome, InitializeOutcome, LoadSessionOptions,
    LoadSessionOutcome, PromptEventSink, PromptInFlight, PromptOutcome,
};
pub use error::{AcpError, AcpResult};
pub use permissions::{PermissionDecision, PermissionPolicy};
pub use process::{pid_alive, pid_command_matches, terminate_process};
pub use stdio::{StdioAgentConnection, StdioConnectionFactory};
pub use turn::{
    ActiveController, ConnectionController, ControlFallback, ControlRequest, TurnController,
    TurnState,
};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{LoadBehavior, MockAgentConfig, MockAgentConnection, MockConnectionFactory};

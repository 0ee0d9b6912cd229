//! The `AgentConnection` capability boundary.
//!
//! Everything above this trait treats the agent as an abstract peer:
//! spawnable, promptable, cancellable, with a lifecycle snapshot. The stdio
//! JSON-RPC transport is the production implementation; tests use the
//! scripted mock behind the `test-utils` feature.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use acpx_core::{ClientOperation, PermissionStats, SessionNotification, StopReason};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::{AcpError, AcpResult};
use crate::permissions::PermissionPolicy;

/// How to spawn an agent: the exact command string from the session record
/// plus the workspace root.
#[derive(Debug, Clone)]
pub struct AgentSpawnSpec {
    pub agent_command: String,
    pub cwd: PathBuf,
}

/// Result of ACP `initialize`.
#[derive(Debug, Clone)]
pub struct InitializeOutcome {
    pub protocol_version: Option<u32>,
    pub agent_capabilities: Value,
    pub supports_load_session: bool,
}

/// Result of `session/new`.
#[derive(Debug, Clone)]
pub struct CreateSessionOutcome {
    pub session_id: String,
    pub agent_session_id: Option<String>,
}

/// Result of `session/load`.
#[derive(Debug, Clone, Default)]
pub struct LoadSessionOutcome {
    pub agent_session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadSessionOptions {
    /// Ask the agent not to replay the whole conversation as updates.
    pub suppress_replay_updates: bool,
}

/// Exit details captured when the agent subprocess terminates.
#[derive(Debug, Clone)]
pub struct AgentExit {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub exited_at: DateTime<Utc>,
    pub reason: Option<String>,
    pub unexpected_during_prompt: bool,
}

/// Lifecycle snapshot applied to the session record after connect.
#[derive(Debug, Clone, Default)]
pub struct AgentLifecycleSnapshot {
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_exit: Option<AgentExit>,
}

/// Stream item delivered while a prompt runs.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    SessionUpdate(SessionNotification),
    ClientOperation(ClientOperation),
}

/// Sink for streamed prompt events.
pub type PromptEventSink = mpsc::UnboundedSender<AgentEvent>;

#[derive(Debug, Clone, Copy)]
pub struct PromptOutcome {
    pub stop_reason: StopReason,
}

/// Handle to a prompt whose request has been written but whose response has
/// not been awaited yet. The split lets the turn controller mark the prompt
/// active (and drain a deferred cancel) strictly after `session/prompt` is
/// on the wire.
pub struct PromptInFlight {
    rx: oneshot::Receiver<AcpResult<PromptOutcome>>,
}

impl PromptInFlight {
    pub fn from_receiver(rx: oneshot::Receiver<AcpResult<PromptOutcome>>) -> Self {
        Self { rx }
    }

    pub async fn wait(self) -> AcpResult<PromptOutcome> {
        self.rx
            .await
            .map_err(|_| AcpError::Disconnected("prompt task dropped".to_string()))?
    }
}

/// Abstract capability surface over one live agent subprocess.
#[async_trait]
pub trait AgentConnection: Send + Sync {
    /// Spawn the subprocess and perform ACP `initialize`. Idempotent: on a
    /// connection whose process is still alive, this returns the cached
    /// initialize result instead of respawning.
    async fn start(&self) -> AcpResult<InitializeOutcome>;

    fn initialize_result(&self) -> Option<InitializeOutcome>;

    fn supports_load_session(&self) -> bool;

    async fn create_session(&self, cwd: &Path) -> AcpResult<CreateSessionOutcome>;

    async fn load_session_with_options(
        &self,
        session_id: &str,
        cwd: &Path,
        options: LoadSessionOptions,
    ) -> AcpResult<LoadSessionOutcome>;

    /// Write the `session/prompt` request and return a handle to its
    /// completion. Streamed updates and client operations go to `sink`;
    /// permission requests are answered from `policy`.
    async fn begin_prompt(
        &self,
        session_id: &str,
        message: &str,
        policy: PermissionPolicy,
        sink: PromptEventSink,
    ) -> AcpResult<PromptInFlight>;

    async fn set_session_mode(&self, session_id: &str, mode_id: &str) -> AcpResult<()>;

    async fn set_session_config_option(
        &self,
        session_id: &str,
        config_id: &str,
        value: Value,
    ) -> AcpResult<Value>;

    /// Send `session/cancel` for the active prompt, if any.
    async fn request_cancel_active_prompt(&self) -> AcpResult<()>;

    /// Cancel and wait up to `wait_ms` for the prompt to settle.
    async fn cancel_active_prompt(&self, wait_ms: u64);

    async fn close(&self);

    fn agent_lifecycle_snapshot(&self) -> AgentLifecycleSnapshot;

    fn has_active_prompt(&self) -> bool;

    fn permission_stats(&self) -> PermissionStats;
}

/// Builds not-yet-started connections. The queue owner creates one
/// connection per agent process and reuses it across turns while the
/// process stays alive.
#[async_trait]
pub trait AgentConnectionFactory: Send + Sync {
    async fn create(&self, spec: &AgentSpawnSpec) -> AcpResult<Arc<dyn AgentConnection>>;
}

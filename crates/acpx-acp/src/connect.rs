//! Connect-and-resume.
//!
//! Starting a turn against a possibly-dead agent process: start (or restart)
//! the subprocess, then try to `session/load` the recorded session ids, and
//! fall back to `session/new` only on the typed recoverable errors. The
//! record is checkpointed as soon as the fresh lifecycle snapshot is known
//! so a crash mid-connect never loses the pid bookkeeping.

use std::time::Duration;

use acpx_core::{OutputError, SessionRecord};
use acpx_store::SessionRecordStore;
use chrono::Utc;

use crate::connection::{AgentConnection, LoadSessionOptions};
use crate::error::{AcpError, RPC_INTERNAL_ERROR, RPC_NOT_FOUND_ALT, RPC_RESOURCE_NOT_FOUND};
use crate::process::pid_alive;

/// Message fragments agents use to say "that session does not exist".
const NOT_FOUND_HINTS: &[&str] = &[
    "resource_not_found",
    "resource not found",
    "session not found",
    "unknown session",
];

#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    /// Session id to use for all subsequent per-session calls.
    pub session_id: String,
    pub agent_session_id: Option<String>,
    pub resumed: bool,
    /// Original load failure text when the turn fell back to `session/new`.
    pub load_error: Option<String>,
}

/// A load failure falls through to `session/new` when the agent said
/// not-found (typed or by message text), or when the session has never
/// produced agent output and the agent reports an internal error (adapters
/// that reject loading unused sessions).
fn is_recoverable_load_error(err: &AcpError, session_has_agent_messages: bool) -> bool {
    if let AcpError::Rpc { code, .. } = err {
        if matches!(*code, RPC_RESOURCE_NOT_FOUND | RPC_NOT_FOUND_ALT) {
            return true;
        }
        if !session_has_agent_messages && *code == RPC_INTERNAL_ERROR {
            return true;
        }
    }
    let text = err.to_string().to_lowercase();
    NOT_FOUND_HINTS.iter().any(|hint| text.contains(hint))
}

/// Start (or reuse) the agent connection and resolve a usable session id.
pub async fn connect_and_load(
    connection: &dyn AgentConnection,
    store: &SessionRecordStore,
    record: &mut SessionRecord,
    timeout_ms: u64,
) -> Result<ConnectOutcome, OutputError> {
    match record.pid {
        Some(pid) if pid_alive(pid) => {
            tracing::info!(pid, session = %record.acpx_record_id, "reconnecting to agent");
        }
        Some(pid) => {
            tracing::info!(dead_pid = pid, session = %record.acpx_record_id, "respawning agent");
        }
        None => {}
    }

    let timeout = Duration::from_millis(timeout_ms);
    let initialize = deadline(timeout, connection.start())
        .await?
        .map_err(OutputError::from)?;

    let snapshot = connection.agent_lifecycle_snapshot();
    record.pid = snapshot.pid;
    record.agent_started_at = snapshot.started_at;
    if let Some(exit) = &snapshot.last_exit {
        record.last_agent_exit_code = exit.exit_code;
        record.last_agent_exit_signal = exit.signal.clone();
        record.last_agent_exit_at = Some(exit.exited_at);
        record.last_agent_disconnect_reason = exit.reason.clone();
    }
    record.closed = false;
    record.closed_at = None;
    record.protocol_version = initialize.protocol_version;
    record.agent_capabilities = Some(initialize.agent_capabilities.clone());
    record.last_used_at = Utc::now();
    store.write(record).map_err(OutputError::from)?;

    let has_agent_messages = record.thread.has_agent_messages();
    let mut load_error: Option<String> = None;

    if connection.supports_load_session() {
        let mut candidates: Vec<String> = Vec::new();
        if let Some(agent_session_id) = &record.agent_session_id {
            if !agent_session_id.is_empty() {
                candidates.push(agent_session_id.clone());
            }
        }
        if !record.acp_session_id.is_empty() && !candidates.contains(&record.acp_session_id) {
            candidates.push(record.acp_session_id.clone());
        }

        for candidate in candidates {
            let attempt = deadline(
                timeout,
                connection.load_session_with_options(
                    &candidate,
                    &record.cwd,
                    LoadSessionOptions {
                        suppress_replay_updates: true,
                    },
                ),
            )
            .await?;
            match attempt {
                Ok(loaded) => {
                    if let Some(agent_session_id) = loaded.agent_session_id {
                        record.agent_session_id = Some(agent_session_id);
                    }
                    record.acp_session_id = candidate.clone();
                    store.write(record).map_err(OutputError::from)?;
                    return Ok(ConnectOutcome {
                        session_id: candidate,
                        agent_session_id: record.agent_session_id.clone(),
                        resumed: true,
                        load_error,
                    });
                }
                Err(err) => {
                    tracing::debug!(candidate = %candidate, error = %err, "session/load failed");
                    let recoverable = is_recoverable_load_error(&err, has_agent_messages);
                    load_error = Some(err.to_string());
                    if !recoverable {
                        return Err(OutputError::from(err));
                    }
                }
            }
        }
    }

    // No load capability, no candidates, or every candidate recoverably
    // failed: start fresh.
    let created = deadline(timeout, connection.create_session(&record.cwd))
        .await?
        .map_err(OutputError::from)?;
    record.acp_session_id = created.session_id.clone();
    if let Some(agent_session_id) = created.agent_session_id {
        record.agent_session_id = Some(agent_session_id);
    }
    store.write(record).map_err(OutputError::from)?;

    Ok(ConnectOutcome {
        session_id: created.session_id,
        agent_session_id: record.agent_session_id.clone(),
        resumed: false,
        load_error,
    })
}

async fn deadline<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = T>,
) -> Result<T, OutputError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| OutputError::from(AcpError::Timeout(timeout.as_millis() as u64)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{LoadBehavior, MockAgentConfig, MockAgentConnection};
    use acpx_core::AcpxConfig;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn setup() -> (TempDir, SessionRecordStore, SessionRecord) {
        let tmp = TempDir::new().unwrap();
        let config = AcpxConfig::with_state_dir(tmp.path());
        let store = SessionRecordStore::new(config.clone());
        let mut record =
            SessionRecord::new(&config, "mock-agent", PathBuf::from("/w"), None);
        record.acp_session_id = "stale".to_string();
        store.write(&record).unwrap();
        (tmp, store, record)
    }

    #[tokio::test]
    async fn resumes_when_load_succeeds() {
        let (_tmp, store, mut record) = setup();
        let connection = MockAgentConnection::new(MockAgentConfig {
            load_behavior: LoadBehavior::Succeed,
            ..Default::default()
        });
        let outcome = connect_and_load(&connection, &store, &mut record, 5_000)
            .await
            .unwrap();
        assert!(outcome.resumed);
        assert_eq!(outcome.session_id, "stale");
        assert_eq!(record.acp_session_id, "stale");
    }

    #[tokio::test]
    async fn not_found_falls_back_to_new_session() {
        let (_tmp, store, mut record) = setup();
        let connection = MockAgentConnection::new(MockAgentConfig {
            load_behavior: LoadBehavior::NotFound,
            ..Default::default()
        });
        let outcome = connect_and_load(&connection, &store, &mut record, 5_000)
            .await
            .unwrap();
        assert!(!outcome.resumed);
        assert_ne!(outcome.session_id, "stale");
        assert_eq!(record.acp_session_id, outcome.session_id);
        let load_error = outcome.load_error.unwrap();
        assert!(load_error.to_lowercase().contains("resource not found"));
        assert_eq!(connection.created_sessions(), 1);

        // The on-disk record followed.
        let on_disk = store.read(&record.acpx_record_id).unwrap();
        assert_eq!(on_disk.acp_session_id, outcome.session_id);
    }

    #[tokio::test]
    async fn internal_error_is_fatal_once_agent_has_replied_before() {
        let (_tmp, store, mut record) = setup();
        record
            .thread
            .messages
            .push(acpx_core::ThreadMessage::Agent(Default::default()));
        let connection = MockAgentConnection::new(MockAgentConfig {
            load_behavior: LoadBehavior::InternalError,
            ..Default::default()
        });
        let err = connect_and_load(&connection, &store, &mut record, 5_000)
            .await
            .unwrap_err();
        assert_eq!(err.code, acpx_core::OutputErrorCode::Runtime);
        assert_eq!(connection.created_sessions(), 0);
    }

    #[tokio::test]
    async fn internal_error_is_recoverable_for_unused_sessions() {
        let (_tmp, store, mut record) = setup();
        let connection = MockAgentConnection::new(MockAgentConfig {
            load_behavior: LoadBehavior::InternalError,
            ..Default::default()
        });
        let outcome = connect_and_load(&connection, &store, &mut record, 5_000)
            .await
            .unwrap();
        assert!(!outcome.resumed);
        assert!(outcome.load_error.is_some());
    }

    #[tokio::test]
    async fn without_load_capability_always_creates() {
        let (_tmp, store, mut record) = setup();
        let connection = MockAgentConnection::new(MockAgentConfig {
            load_behavior: LoadBehavior::Unsupported,
            ..Default::default()
        });
        let outcome = connect_and_load(&connection, &store, &mut record, 5_000)
            .await
            .unwrap();
        assert!(!outcome.resumed);
        assert!(outcome.load_error.is_none());
        assert_eq!(connection.created_sessions(), 1);
    }

    #[tokio::test]
    async fn agent_session_id_is_tried_before_acp_session_id() {
        let (_tmp, store, mut record) = setup();
        record.agent_session_id = Some("inner-id".to_string());
        let connection = MockAgentConnection::new(MockAgentConfig {
            load_behavior: LoadBehavior::Succeed,
            ..Default::default()
        });
        let outcome = connect_and_load(&connection, &store, &mut record, 5_000)
            .await
            .unwrap();
        assert!(outcome.resumed);
        assert_eq!(outcome.session_id, "inner-id");
        assert_eq!(connection.load_attempts(), vec!["inner-id"]);
    }
}

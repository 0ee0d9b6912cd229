//! End-to-end checks for the stdio JSON-RPC transport against the scripted
//! stdio agent binary.

#![cfg(all(unix, feature = "test-utils"))]

use std::path::PathBuf;

use acpx_acp::{
    AgentConnection, AgentEvent, AgentSpawnSpec, LoadSessionOptions, PermissionPolicy,
    StdioAgentConnection,
};
use acpx_core::{SessionUpdate, StopReason};
use tokio::sync::mpsc;

fn agent_spec(cwd: PathBuf) -> AgentSpawnSpec {
    AgentSpawnSpec {
        agent_command: env!("CARGO_BIN_EXE_mock-stdio-agent").to_string(),
        cwd,
    }
}

#[tokio::test]
async fn initialize_new_session_and_prompt_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let connection = StdioAgentConnection::new(agent_spec(tmp.path().to_path_buf()));

    let init = connection.start().await.unwrap();
    assert_eq!(init.protocol_version, Some(1));
    assert!(init.supports_load_session);

    let session = connection.create_session(tmp.path()).await.unwrap();
    assert!(session.session_id.starts_with("stdio-sess-"));
    assert_eq!(session.agent_session_id.as_deref(), Some("inner-1"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let inflight = connection
        .begin_prompt(&session.session_id, "ping", PermissionPolicy::AllowAll, tx)
        .await
        .unwrap();
    let outcome = inflight.wait().await.unwrap();
    assert_eq!(outcome.stop_reason, StopReason::EndTurn);

    let mut text = String::new();
    while let Ok(event) = rx.try_recv() {
        if let AgentEvent::SessionUpdate(notification) = event {
            if let SessionUpdate::AgentMessageChunk {
                content: acpx_core::ContentBlock::Text { text: chunk },
            } = notification.update
            {
                text.push_str(&chunk);
            }
        }
    }
    assert_eq!(text, "echo: ping");

    connection.close().await;
}

#[tokio::test]
async fn load_returns_typed_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let connection = StdioAgentConnection::new(agent_spec(tmp.path().to_path_buf()));
    connection.start().await.unwrap();

    let err = connection
        .load_session_with_options("stale", tmp.path(), LoadSessionOptions::default())
        .await
        .unwrap_err();
    match err {
        acpx_acp::AcpError::Rpc { code, message, .. } => {
            assert_eq!(code, -32002);
            assert!(message.contains("Resource not found"));
        }
        other => panic!("expected typed RPC error, got {other}"),
    }
    connection.close().await;
}

#[tokio::test]
async fn lifecycle_snapshot_tracks_spawn_and_exit() {
    let tmp = tempfile::tempdir().unwrap();
    let connection = StdioAgentConnection::new(agent_spec(tmp.path().to_path_buf()));
    connection.start().await.unwrap();

    let snapshot = connection.agent_lifecycle_snapshot();
    let pid = snapshot.pid.expect("agent pid");
    assert!(acpx_acp::pid_alive(pid));

    connection.close().await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(!acpx_acp::pid_alive(pid));
    let snapshot = connection.agent_lifecycle_snapshot();
    assert!(snapshot.last_exit.is_some());
}

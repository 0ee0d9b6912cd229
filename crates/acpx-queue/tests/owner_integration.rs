//! Owner-loop scenarios over a real Unix socket with the scripted mock
//! agent connection.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use acpx_acp::{LoadBehavior, MockAgentConfig, MockConnectionFactory};
use acpx_core::{AcpxConfig, ContentBlock, SessionRecord, SessionUpdate, StopReason};
use acpx_queue::{
    probe_health, read_lease, run_queue_owner, try_acquire, ChannelSink, OwnerClient,
    OwnerMessage, OwnerTask, QueueOwnerOptions, QueueRequest,
};
use acpx_store::SessionRecordStore;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

struct TestOwner {
    _tmp: TempDir,
    config: AcpxConfig,
    store: SessionRecordStore,
    record_id: String,
    factory: Arc<MockConnectionFactory>,
    seed_rx: mpsc::UnboundedReceiver<OwnerMessage>,
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<Result<(), acpx_core::OutputError>>,
}

async fn start_owner(agent: MockAgentConfig, options: QueueOwnerOptions, seed_message: &str) -> TestOwner {
    let tmp = TempDir::new().unwrap();
    let config = AcpxConfig::with_state_dir(tmp.path());
    let store = SessionRecordStore::new(config.clone());
    let record = SessionRecord::new(&config, "mock-agent --acp", PathBuf::from("/w"), None);
    let record_id = record.acpx_record_id.clone();
    store.write(&record).unwrap();

    let factory = Arc::new(MockConnectionFactory::new(agent));
    let lease = try_acquire(&config, &record_id).await.unwrap().unwrap();

    let (seed_tx, seed_rx) = mpsc::unbounded_channel();
    let seed = OwnerTask {
        request_id: "req-seed".to_string(),
        message: seed_message.to_string(),
        permission_mode: "default".to_string(),
        non_interactive_permissions: None,
        timeout_ms: Some(10_000),
        wait_for_completion: true,
        queued_behind_turn: false,
        sink: Arc::new(ChannelSink::new(seed_tx)),
    };

    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(run_queue_owner(
        config.clone(),
        store.clone(),
        record_id.clone(),
        factory.clone(),
        lease,
        seed,
        options,
        shutdown_rx,
    ));

    TestOwner {
        _tmp: tmp,
        config,
        store,
        record_id,
        factory,
        seed_rx,
        shutdown,
        handle,
    }
}

async fn drain_to_terminal(client: &mut OwnerClient) -> Vec<OwnerMessage> {
    let mut messages = Vec::new();
    while let Some(message) = client.read_message().await.unwrap() {
        let terminal = matches!(
            message,
            OwnerMessage::Result { .. }
                | OwnerMessage::Error { .. }
                | OwnerMessage::CancelResult { .. }
                | OwnerMessage::SetModeResult { .. }
                | OwnerMessage::SetConfigOptionResult { .. }
        );
        messages.push(message);
        if terminal {
            break;
        }
    }
    messages
}

fn slow_agent(chunks: usize, delay_ms: u64) -> MockAgentConfig {
    MockAgentConfig {
        load_behavior: LoadBehavior::Succeed,
        prompt_updates: (0..chunks)
            .map(|i| SessionUpdate::AgentMessageChunk {
                content: ContentBlock::text(format!("chunk-{i} ")),
            })
            .collect(),
        initial_delay: Duration::from_millis(delay_ms),
        update_delay: Duration::from_millis(delay_ms),
        ..Default::default()
    }
}

#[tokio::test]
async fn queue_contention_runs_prompts_in_submission_order() {
    let mut owner = start_owner(
        slow_agent(3, 15),
        QueueOwnerOptions {
            idle_ttl_ms: 400,
            default_timeout_ms: 10_000,
        },
        "a",
    )
    .await;

    // Second submitter arrives while the seed prompt runs.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let lease = read_lease(&owner.config, &owner.record_id).unwrap().unwrap();
    let mut client = OwnerClient::connect(&lease).await.unwrap();
    client
        .submit(&QueueRequest::SubmitPrompt {
            request_id: "req-b".into(),
            message: "b".into(),
            permission_mode: "default".into(),
            non_interactive_permissions: None,
            timeout_ms: Some(10_000),
            wait_for_completion: true,
        })
        .await
        .unwrap();
    let b_messages = drain_to_terminal(&mut client).await;

    match b_messages.last().unwrap() {
        OwnerMessage::Result { result } => {
            assert_eq!(result.stop_reason, StopReason::EndTurn);
            assert_eq!(result.request_id, "req-b");
        }
        other => panic!("expected result, got {other:?}"),
    }
    assert!(b_messages
        .iter()
        .any(|m| matches!(m, OwnerMessage::SessionUpdate { .. })));
    assert!(b_messages
        .iter()
        .any(|m| matches!(m, OwnerMessage::Done { stop_reason } if *stop_reason == StopReason::EndTurn)));

    // Seed got its own full stream.
    let mut seed_messages = Vec::new();
    while let Ok(message) = owner.seed_rx.try_recv() {
        seed_messages.push(message);
    }
    assert!(seed_messages
        .iter()
        .any(|m| matches!(m, OwnerMessage::Result { result } if result.stop_reason == StopReason::EndTurn)));

    // One owner, one connection, prompts in submission order.
    let connections = owner.factory.connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].prompts(), vec!["a", "b"]);

    owner.handle.await.unwrap().unwrap();
    // Lease is released on exit.
    assert!(read_lease(&owner.config, &owner.record_id).unwrap().is_none());
}

#[tokio::test]
async fn cancel_before_active_dispatches_exactly_once() {
    let mut owner = start_owner(
        slow_agent(50, 20),
        QueueOwnerOptions {
            idle_ttl_ms: 300,
            default_timeout_ms: 10_000,
        },
        "long prompt",
    )
    .await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    let lease = read_lease(&owner.config, &owner.record_id).unwrap().unwrap();
    let mut client = OwnerClient::connect(&lease).await.unwrap();
    client
        .submit(&QueueRequest::CancelPrompt {
            request_id: "req-cancel".into(),
        })
        .await
        .unwrap();
    let messages = drain_to_terminal(&mut client).await;
    match messages.last().unwrap() {
        OwnerMessage::CancelResult { cancelled } => assert!(cancelled),
        other => panic!("expected cancel_result, got {other:?}"),
    }

    // Seed's prompt settles as cancelled.
    let result = loop {
        match owner.seed_rx.recv().await.unwrap() {
            OwnerMessage::Result { result } => break result,
            OwnerMessage::Error { message, .. } => panic!("unexpected error: {message}"),
            _ => {}
        }
    };
    assert_eq!(result.stop_reason, StopReason::Cancelled);

    let connections = owner.factory.connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].cancel_count(), 1);

    owner.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancel_with_no_turn_reports_false() {
    let mut owner = start_owner(
        slow_agent(1, 1),
        QueueOwnerOptions {
            idle_ttl_ms: 500,
            default_timeout_ms: 10_000,
        },
        "quick",
    )
    .await;

    // Wait for the seed turn to finish, then give the owner a beat to
    // return to Idle.
    loop {
        match owner.seed_rx.recv().await.unwrap() {
            OwnerMessage::Result { .. } => break,
            _ => {}
        }
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let lease = read_lease(&owner.config, &owner.record_id).unwrap().unwrap();
    let mut client = OwnerClient::connect(&lease).await.unwrap();
    client
        .submit(&QueueRequest::CancelPrompt {
            request_id: "req-c2".into(),
        })
        .await
        .unwrap();
    let messages = drain_to_terminal(&mut client).await;
    match messages.last().unwrap() {
        OwnerMessage::CancelResult { cancelled } => assert!(!cancelled),
        other => panic!("expected cancel_result, got {other:?}"),
    }

    owner.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn malformed_request_gets_error_and_does_not_disturb_others() {
    let owner = start_owner(
        slow_agent(30, 20),
        QueueOwnerOptions {
            idle_ttl_ms: 300,
            default_timeout_ms: 10_000,
        },
        "seed",
    )
    .await;

    tokio::time::sleep(Duration::from_millis(15)).await;
    let lease = read_lease(&owner.config, &owner.record_id).unwrap().unwrap();

    // Raw garbage on one connection.
    {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::UnixStream::connect(&lease.socket_path)
            .await
            .unwrap();
        stream.write_all(b"not-json\n").await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(reply.lines().next().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["requestId"], "unknown");
        let message = value["message"].as_str().unwrap().to_lowercase();
        assert!(message.contains("invalid queue request"));
    }

    // A well-formed control request on a second connection still works.
    let mut client = OwnerClient::connect(&lease).await.unwrap();
    client
        .submit(&QueueRequest::CancelPrompt {
            request_id: "req-ok".into(),
        })
        .await
        .unwrap();
    let messages = drain_to_terminal(&mut client).await;
    assert!(matches!(
        messages.last().unwrap(),
        OwnerMessage::CancelResult { .. }
    ));

    owner.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn submit_without_wait_closes_socket_after_accepted() {
    let mut owner = start_owner(
        slow_agent(2, 10),
        QueueOwnerOptions {
            idle_ttl_ms: 400,
            default_timeout_ms: 10_000,
        },
        "seed",
    )
    .await;

    tokio::time::sleep(Duration::from_millis(10)).await;
    let lease = read_lease(&owner.config, &owner.record_id).unwrap().unwrap();
    let mut client = OwnerClient::connect(&lease).await.unwrap();
    client
        .submit(&QueueRequest::SubmitPrompt {
            request_id: "req-fire".into(),
            message: "forget".into(),
            permission_mode: "default".into(),
            non_interactive_permissions: None,
            timeout_ms: Some(10_000),
            wait_for_completion: false,
        })
        .await
        .unwrap();
    // Socket closes without further messages.
    assert!(client.read_message().await.unwrap().is_none());

    owner.handle.await.unwrap().unwrap();

    // The fire-and-forget prompt still ran, after the seed.
    let connections = owner.factory.connections();
    assert_eq!(connections[0].prompts(), vec!["seed", "forget"]);
    let _ = owner.seed_rx.try_recv();
}

#[tokio::test]
async fn idle_ttl_expires_and_releases_everything() {
    let owner = start_owner(
        slow_agent(1, 1),
        QueueOwnerOptions {
            idle_ttl_ms: 80,
            default_timeout_ms: 5_000,
        },
        "only",
    )
    .await;

    owner.handle.await.unwrap().unwrap();
    assert!(read_lease(&owner.config, &owner.record_id).unwrap().is_none());
    let health = probe_health(&owner.config, &owner.record_id).await;
    assert!(!health.healthy);
    // Events lock released: the record can be re-opened for writing.
    let record = owner.store.read(&owner.record_id).unwrap();
    assert!(record.last_seq > 0);
    assert!(!owner
        .config
        .events_lock_path(&owner.record_id)
        .exists());
}

#[tokio::test]
async fn shutdown_signal_stops_an_immortal_owner() {
    let owner = start_owner(
        slow_agent(1, 1),
        QueueOwnerOptions {
            idle_ttl_ms: 0,
            default_timeout_ms: 5_000,
        },
        "only",
    )
    .await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!owner.handle.is_finished(), "ttl=0 must not idle out");
    owner.shutdown.send(()).unwrap();
    owner.handle.await.unwrap().unwrap();
    assert!(read_lease(&owner.config, &owner.record_id).unwrap().is_none());
}

#[tokio::test]
async fn turn_events_land_in_the_log_in_causal_order() {
    let owner = start_owner(
        slow_agent(2, 5),
        QueueOwnerOptions {
            idle_ttl_ms: 80,
            default_timeout_ms: 5_000,
        },
        "hello agent",
    )
    .await;
    owner.handle.await.unwrap().unwrap();

    let events = acpx_store::list_session_events(&owner.config, &owner.record_id).unwrap();
    let kinds: Vec<&str> = events.iter().map(|e| e.payload.type_str()).collect();
    assert_eq!(
        kinds,
        vec![
            "session_ensured",
            "turn_started",
            "update",
            "output_delta",
            "output_delta",
            "turn_done"
        ]
    );
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (1..=6).collect::<Vec<u64>>());

    // Replaying the log reproduces the persisted projection.
    let record = owner.store.read(&owner.record_id).unwrap();
    let mut replayed = acpx_core::Projection::default();
    for event in &events {
        replayed.apply_event(event);
    }
    assert_eq!(replayed.thread, record.thread);
    assert_eq!(replayed.acpx, record.acpx);
}

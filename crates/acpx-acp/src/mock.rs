//! Scripted in-process agent connection for tests.
//!
//! No subprocess, no JSON-RPC: the mock implements [`AgentConnection`]
//! directly and streams a configured script of session updates. Tests
//! inspect call logs (prompts, load attempts, cancel count) to assert
//! ordering and fallback behaviour.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use acpx_core::{
    ClientOperation, ContentBlock, PermissionOption, PermissionStats, SessionNotification,
    SessionUpdate, StopReason,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::connection::{
    AgentConnection, AgentConnectionFactory, AgentEvent, AgentLifecycleSnapshot, AgentSpawnSpec,
    CreateSessionOutcome, InitializeOutcome, LoadSessionOptions, LoadSessionOutcome,
    PromptEventSink, PromptInFlight, PromptOutcome,
};
use crate::error::{AcpError, AcpResult, RPC_INTERNAL_ERROR, RPC_RESOURCE_NOT_FOUND};
use crate::permissions::{PermissionDecision, PermissionPolicy};

/// How the mock responds to `session/load`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBehavior {
    /// Load succeeds for any session id.
    Succeed,
    /// Typed `-32002 Resource not found`.
    NotFound,
    /// Typed `-32603` internal error.
    InternalError,
    /// Non-recoverable error; connect must propagate it.
    Fatal,
    /// Agent does not advertise the capability at all.
    #[default]
    Unsupported,
}

#[derive(Debug, Clone)]
pub struct MockAgentConfig {
    pub load_behavior: LoadBehavior,
    /// Updates streamed for every prompt, in order.
    pub prompt_updates: Vec<SessionUpdate>,
    pub stop_reason: StopReason,
    /// Pause before the first update, and between updates.
    pub initial_delay: Duration,
    pub update_delay: Duration,
    /// When set, prompts fail with this runtime error message.
    pub fail_prompt: Option<String>,
    /// When set, the prompt raises one permission request first.
    pub permission_request: Option<Vec<PermissionOption>>,
}

impl Default for MockAgentConfig {
    fn default() -> Self {
        Self {
            load_behavior: LoadBehavior::default(),
            prompt_updates: vec![SessionUpdate::AgentMessageChunk {
                content: ContentBlock::text("ok"),
            }],
            stop_reason: StopReason::EndTurn,
            initial_delay: Duration::from_millis(5),
            update_delay: Duration::from_millis(5),
            fail_prompt: None,
            permission_request: None,
        }
    }
}

pub struct MockAgentConnection {
    config: MockAgentConfig,
    started: AtomicBool,
    session_counter: AtomicUsize,
    created: AtomicUsize,
    load_attempts: Mutex<Vec<String>>,
    prompts: Mutex<Vec<String>>,
    cancel_requested: Arc<AtomicBool>,
    cancel_count: Arc<AtomicUsize>,
    active: Arc<AtomicBool>,
    stats: Arc<Mutex<PermissionStats>>,
}

impl MockAgentConnection {
    pub fn new(config: MockAgentConfig) -> Self {
        Self {
            config,
            started: AtomicBool::new(false),
            session_counter: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            load_attempts: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
            cancel_requested: Arc::new(AtomicBool::new(false)),
            cancel_count: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(PermissionStats::default())),
        }
    }

    /// Messages prompted so far, in arrival order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn load_attempts(&self) -> Vec<String> {
        self.load_attempts.lock().unwrap().clone()
    }

    pub fn created_sessions(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Number of `session/cancel` deliveries observed.
    pub fn cancel_count(&self) -> usize {
        self.cancel_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentConnection for MockAgentConnection {
    async fn start(&self) -> AcpResult<InitializeOutcome> {
        self.started.store(true, Ordering::SeqCst);
        Ok(self.initialize_result().expect("just started"))
    }

    fn initialize_result(&self) -> Option<InitializeOutcome> {
        if !self.started.load(Ordering::SeqCst) {
            return None;
        }
        Some(InitializeOutcome {
            protocol_version: Some(1),
            agent_capabilities: json!({ "loadSession": self.supports_load_session() }),
            supports_load_session: self.supports_load_session(),
        })
    }

    fn supports_load_session(&self) -> bool {
        self.config.load_behavior != LoadBehavior::Unsupported
    }

    async fn create_session(&self, _cwd: &Path) -> AcpResult<CreateSessionOutcome> {
        let n = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(CreateSessionOutcome {
            session_id: format!("mock-sess-{n}"),
            agent_session_id: None,
        })
    }

    async fn load_session_with_options(
        &self,
        session_id: &str,
        _cwd: &Path,
        _options: LoadSessionOptions,
    ) -> AcpResult<LoadSessionOutcome> {
        self.load_attempts
            .lock()
            .unwrap()
            .push(session_id.to_string());
        match self.config.load_behavior {
            LoadBehavior::Succeed => Ok(LoadSessionOutcome {
                agent_session_id: None,
            }),
            LoadBehavior::NotFound => Err(AcpError::Rpc {
                code: RPC_RESOURCE_NOT_FOUND,
                message: "Resource not found".to_string(),
                data: None,
            }),
            LoadBehavior::InternalError => Err(AcpError::Rpc {
                code: RPC_INTERNAL_ERROR,
                message: "Query closed before response received".to_string(),
                data: None,
            }),
            LoadBehavior::Fatal => Err(AcpError::Rpc {
                code: -32600,
                message: "load rejected".to_string(),
                data: None,
            }),
            LoadBehavior::Unsupported => Err(AcpError::Protocol(
                "session/load not supported".to_string(),
            )),
        }
    }

    async fn begin_prompt(
        &self,
        session_id: &str,
        message: &str,
        policy: PermissionPolicy,
        sink: PromptEventSink,
    ) -> AcpResult<PromptInFlight> {
        self.prompts.lock().unwrap().push(message.to_string());
        self.cancel_requested.store(false, Ordering::SeqCst);
        *self.stats.lock().unwrap() = PermissionStats::default();
        self.active.store(true, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        let config = self.config.clone();
        let cancel = self.cancel_requested.clone();
        let active = self.active.clone();
        let stats = self.stats.clone();
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            let outcome = run_scripted_prompt(&config, &policy, &session_id, &sink, &cancel, &stats)
                .await;
            active.store(false, Ordering::SeqCst);
            let _ = tx.send(outcome);
        });
        Ok(PromptInFlight::from_receiver(rx))
    }

    async fn set_session_mode(&self, _session_id: &str, _mode_id: &str) -> AcpResult<()> {
        Ok(())
    }

    async fn set_session_config_option(
        &self,
        _session_id: &str,
        config_id: &str,
        value: Value,
    ) -> AcpResult<Value> {
        Ok(json!({ "configId": config_id, "value": value }))
    }

    async fn request_cancel_active_prompt(&self) -> AcpResult<()> {
        self.cancel_count.fetch_add(1, Ordering::SeqCst);
        self.cancel_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn cancel_active_prompt(&self, wait_ms: u64) {
        let _ = self.request_cancel_active_prompt().await;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(wait_ms);
        while self.active.load(Ordering::SeqCst) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn agent_lifecycle_snapshot(&self) -> AgentLifecycleSnapshot {
        AgentLifecycleSnapshot {
            pid: Some(std::process::id()),
            started_at: Some(Utc::now()),
            last_exit: None,
        }
    }

    fn has_active_prompt(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn permission_stats(&self) -> PermissionStats {
        *self.stats.lock().unwrap()
    }
}

async fn run_scripted_prompt(
    config: &MockAgentConfig,
    policy: &PermissionPolicy,
    session_id: &str,
    sink: &PromptEventSink,
    cancel: &AtomicBool,
    stats: &Mutex<PermissionStats>,
) -> AcpResult<PromptOutcome> {
    tokio::time::sleep(config.initial_delay).await;

    if let Some(message) = &config.fail_prompt {
        return Err(AcpError::Rpc {
            code: RPC_INTERNAL_ERROR,
            message: message.clone(),
            data: None,
        });
    }

    if let Some(options) = &config.permission_request {
        let mut counters = stats.lock().unwrap();
        counters.requested += 1;
        if cancel.load(Ordering::SeqCst) {
            counters.cancelled += 1;
        } else {
            match policy.choose(options, None) {
                PermissionDecision::Approved(_) => counters.approved += 1,
                PermissionDecision::Denied(_) => counters.denied += 1,
                PermissionDecision::Cancelled => counters.cancelled += 1,
            }
        }
        drop(counters);
        let _ = sink.send(AgentEvent::ClientOperation(
            ClientOperation::RequestPermission {
                session_id: session_id.to_string(),
                tool_call: None,
                options: options.clone(),
            },
        ));
    }

    for update in &config.prompt_updates {
        if cancel.load(Ordering::SeqCst) {
            return Ok(PromptOutcome {
                stop_reason: StopReason::Cancelled,
            });
        }
        tokio::time::sleep(config.update_delay).await;
        let _ = sink.send(AgentEvent::SessionUpdate(SessionNotification {
            session_id: session_id.to_string(),
            update: update.clone(),
            meta: None,
        }));
    }
    if cancel.load(Ordering::SeqCst) {
        return Ok(PromptOutcome {
            stop_reason: StopReason::Cancelled,
        });
    }
    Ok(PromptOutcome {
        stop_reason: config.stop_reason,
    })
}

/// Factory that hands out scripted connections and remembers them so tests
/// can inspect call logs.
pub struct MockConnectionFactory {
    config: MockAgentConfig,
    connections: Mutex<Vec<Arc<MockAgentConnection>>>,
}

impl MockConnectionFactory {
    pub fn new(config: MockAgentConfig) -> Self {
        Self {
            config,
            connections: Mutex::new(Vec::new()),
        }
    }

    pub fn connections(&self) -> Vec<Arc<MockAgentConnection>> {
        self.connections.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentConnectionFactory for MockConnectionFactory {
    async fn create(&self, _spec: &AgentSpawnSpec) -> AcpResult<Arc<dyn AgentConnection>> {
        let connection = Arc::new(MockAgentConnection::new(self.config.clone()));
        self.connections.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn scripted_prompt_streams_then_completes() {
        let connection = MockAgentConnection::new(MockAgentConfig::default());
        connection.start().await.unwrap();
        let session = connection.create_session(Path::new("/w")).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let inflight = connection
            .begin_prompt(&session.session_id, "hi", PermissionPolicy::AllowAll, tx)
            .await
            .unwrap();
        assert!(connection.has_active_prompt());

        let outcome = inflight.wait().await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::EndTurn);
        assert!(!connection.has_active_prompt());

        let mut updates = 0;
        while rx.try_recv().is_ok() {
            updates += 1;
        }
        assert_eq!(updates, 1);
        assert_eq!(connection.prompts(), vec!["hi"]);
    }

    #[tokio::test]
    async fn cancel_mid_prompt_yields_cancelled_stop_reason() {
        let config = MockAgentConfig {
            prompt_updates: (0..20)
                .map(|i| SessionUpdate::AgentMessageChunk {
                    content: ContentBlock::text(format!("chunk-{i}")),
                })
                .collect(),
            update_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let connection = MockAgentConnection::new(config);
        connection.start().await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let inflight = connection
            .begin_prompt("mock-sess-1", "long", PermissionPolicy::AllowAll, tx)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(25)).await;
        connection.request_cancel_active_prompt().await.unwrap();

        let outcome = inflight.wait().await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Cancelled);
        assert_eq!(connection.cancel_count(), 1);
    }
}

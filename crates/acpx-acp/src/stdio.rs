//! stdio JSON-RPC transport.
//!
//! Spawns the agent subprocess from the exact command string stored in the
//! session record and speaks line-delimited JSON-RPC 2.0 over its stdio.
//! Outbound requests are matched to responses through a pending map;
//! inbound `session/update` notifications and client-operation requests are
//! routed to the active prompt's sink. stderr is drained to the log.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use acpx_core::{
    agent_session_id_from_meta, ClientOperation, PermissionOption, PermissionStats,
    SessionNotification, StopReason,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::oneshot;

use crate::connection::{
    AgentConnection, AgentConnectionFactory, AgentEvent, AgentExit, AgentLifecycleSnapshot,
    AgentSpawnSpec, CreateSessionOutcome, InitializeOutcome, LoadSessionOptions,
    LoadSessionOutcome, PromptEventSink, PromptInFlight, PromptOutcome,
};
use crate::error::{AcpError, AcpResult};
use crate::permissions::{PermissionDecision, PermissionPolicy};
use crate::process::terminate_process;

const JSONRPC_METHOD_NOT_FOUND: i64 = -32601;

#[derive(Default)]
struct PromptState {
    sink: Option<PromptEventSink>,
    policy: PermissionPolicy,
    session_id: Option<String>,
}

#[derive(Default)]
struct LifecycleState {
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    last_exit: Option<AgentExit>,
}

struct Shared {
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pending: Mutex<HashMap<i64, oneshot::Sender<AcpResult<Value>>>>,
    next_id: AtomicI64,
    prompt: Mutex<PromptState>,
    active: AtomicBool,
    stats: Mutex<PermissionStats>,
    lifecycle: Mutex<LifecycleState>,
    init: Mutex<Option<InitializeOutcome>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            stdin: tokio::sync::Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            prompt: Mutex::new(PromptState::default()),
            active: AtomicBool::new(false),
            stats: Mutex::new(PermissionStats::default()),
            lifecycle: Mutex::new(LifecycleState::default()),
            init: Mutex::new(None),
        }
    }

    async fn write_value(&self, value: &Value) -> AcpResult<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| AcpError::Disconnected("agent stdin closed".to_string()))?;
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn request(&self, method: &str, params: Value) -> AcpResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);
        let frame = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if let Err(err) = self.write_value(&frame).await {
            self.pending.lock().unwrap().remove(&id);
            return Err(err);
        }
        rx.await
            .map_err(|_| AcpError::Disconnected("agent exited before responding".to_string()))?
    }

    async fn notify(&self, method: &str, params: Value) -> AcpResult<()> {
        self.write_value(&json!({ "jsonrpc": "2.0", "method": method, "params": params }))
            .await
    }

    async fn respond(&self, id: &Value, result: Value) {
        let frame = json!({ "jsonrpc": "2.0", "id": id, "result": result });
        if let Err(err) = self.write_value(&frame).await {
            tracing::warn!(error = %err, "failed to answer agent request");
        }
    }

    async fn respond_error(&self, id: &Value, code: i64, message: &str) {
        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message }
        });
        if let Err(err) = self.write_value(&frame).await {
            tracing::warn!(error = %err, "failed to answer agent request");
        }
    }

    fn emit(&self, event: AgentEvent) {
        let prompt = self.prompt.lock().unwrap();
        if let Some(sink) = &prompt.sink {
            let _ = sink.send(event);
        }
    }

    fn fail_pending(&self, reason: &str) {
        let senders: Vec<_> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in senders {
            let _ = tx.send(Err(AcpError::Disconnected(reason.to_string())));
        }
    }
}

/// Production [`AgentConnection`] over a spawned subprocess.
pub struct StdioAgentConnection {
    spec: AgentSpawnSpec,
    shared: Arc<Shared>,
}

impl StdioAgentConnection {
    pub fn new(spec: AgentSpawnSpec) -> Self {
        Self {
            spec,
            shared: Arc::new(Shared::new()),
        }
    }
}

#[async_trait]
impl AgentConnection for StdioAgentConnection {
    async fn start(&self) -> AcpResult<InitializeOutcome> {
        // Reused across turns: a live, already-initialized connection keeps
        // its process.
        if let Some(init) = self.initialize_result() {
            let alive = {
                let lifecycle = self.shared.lifecycle.lock().unwrap();
                lifecycle.last_exit.is_none()
                    && lifecycle.pid.map(crate::process::pid_alive).unwrap_or(false)
            };
            if alive {
                return Ok(init);
            }
        }

        let tokens = shell_words::split(&self.spec.agent_command)
            .map_err(|err| AcpError::Spawn(format!("unparseable agent command: {err}")))?;
        let (program, args) = tokens
            .split_first()
            .ok_or_else(|| AcpError::Spawn("empty agent command".to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&self.spec.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| AcpError::Spawn(format!("{program}: {err}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AcpError::Spawn("agent stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AcpError::Spawn("agent stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AcpError::Spawn("agent stderr unavailable".to_string()))?;

        let pid = child.id();
        {
            let mut lifecycle = self.shared.lifecycle.lock().unwrap();
            lifecycle.pid = pid;
            lifecycle.started_at = Some(Utc::now());
            lifecycle.last_exit = None;
        }
        *self.shared.stdin.lock().await = Some(stdin);
        tracing::debug!(command = %self.spec.agent_command, pid, "spawned agent");

        // Reader: one JSON frame per line.
        let reader_shared = self.shared.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(frame) => handle_frame(&reader_shared, frame).await,
                    Err(err) => {
                        tracing::warn!(error = %err, "agent emitted unparseable frame");
                    }
                }
            }
        });

        // stderr drain.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    tracing::debug!(target: "acpx::agent_stderr", "{line}");
                }
            }
        });

        // Exit watcher owns the child.
        let wait_shared = self.shared.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let during_prompt = wait_shared.active.load(Ordering::SeqCst);
            {
                let mut lifecycle = wait_shared.lifecycle.lock().unwrap();
                let (exit_code, signal) = match &status {
                    Ok(status) => (status.code(), unix_signal(status)),
                    Err(_) => (None, None),
                };
                lifecycle.last_exit = Some(AgentExit {
                    exit_code,
                    signal,
                    exited_at: Utc::now(),
                    reason: Some("exited".to_string()),
                    unexpected_during_prompt: during_prompt,
                });
            }
            if during_prompt {
                tracing::warn!("agent exited during an active prompt");
            }
            wait_shared.active.store(false, Ordering::SeqCst);
            wait_shared.fail_pending("agent process exited");
        });

        let result = self
            .shared
            .request(
                "initialize",
                json!({
                    "protocolVersion": 1,
                    "clientInfo": { "name": "acpx", "version": env!("CARGO_PKG_VERSION") },
                    "clientCapabilities": {
                        "fs": { "readTextFile": false, "writeTextFile": false }
                    }
                }),
            )
            .await?;

        let capabilities = result.get("agentCapabilities").cloned().unwrap_or(json!({}));
        let supports_load_session = match capabilities.get("loadSession") {
            Some(Value::Bool(supported)) => *supported,
            Some(Value::Object(_)) => true,
            _ => false,
        };
        let outcome = InitializeOutcome {
            protocol_version: result
                .get("protocolVersion")
                .and_then(Value::as_u64)
                .map(|v| v as u32),
            agent_capabilities: capabilities,
            supports_load_session,
        };
        *self.shared.init.lock().unwrap() = Some(outcome.clone());
        Ok(outcome)
    }

    fn initialize_result(&self) -> Option<InitializeOutcome> {
        self.shared.init.lock().unwrap().clone()
    }

    fn supports_load_session(&self) -> bool {
        self.initialize_result()
            .map(|init| init.supports_load_session)
            .unwrap_or(false)
    }

    async fn create_session(&self, cwd: &Path) -> AcpResult<CreateSessionOutcome> {
        let result = self
            .shared
            .request("session/new", json!({ "cwd": cwd, "mcpServers": [] }))
            .await?;
        let session_id = result
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| AcpError::Protocol("session/new response lacks sessionId".to_string()))?
            .to_string();
        Ok(CreateSessionOutcome {
            agent_session_id: agent_session_id_from_meta(result.get("_meta")),
            session_id,
        })
    }

    async fn load_session_with_options(
        &self,
        session_id: &str,
        cwd: &Path,
        options: LoadSessionOptions,
    ) -> AcpResult<LoadSessionOutcome> {
        let result = self
            .shared
            .request(
                "session/load",
                json!({
                    "sessionId": session_id,
                    "cwd": cwd,
                    "mcpServers": [],
                    "_meta": { "suppressReplayUpdates": options.suppress_replay_updates }
                }),
            )
            .await?;
        Ok(LoadSessionOutcome {
            agent_session_id: agent_session_id_from_meta(result.get("_meta")),
        })
    }

    async fn begin_prompt(
        &self,
        session_id: &str,
        message: &str,
        policy: PermissionPolicy,
        sink: PromptEventSink,
    ) -> AcpResult<PromptInFlight> {
        {
            let mut prompt = self.shared.prompt.lock().unwrap();
            prompt.sink = Some(sink);
            prompt.policy = policy;
            prompt.session_id = Some(session_id.to_string());
        }
        *self.shared.stats.lock().unwrap() = PermissionStats::default();
        self.shared.active.store(true, Ordering::SeqCst);

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (response_tx, response_rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(id, response_tx);
        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "session/prompt",
            "params": {
                "sessionId": session_id,
                "prompt": [ { "type": "text", "text": message } ]
            }
        });
        if let Err(err) = self.shared.write_value(&frame).await {
            self.shared.pending.lock().unwrap().remove(&id);
            self.shared.active.store(false, Ordering::SeqCst);
            return Err(err);
        }

        let (done_tx, done_rx) = oneshot::channel();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let outcome = match response_rx.await {
                Ok(Ok(result)) => {
                    let stop_reason = result
                        .get("stopReason")
                        .cloned()
                        .map(|v| serde_json::from_value(v).unwrap_or(StopReason::Unknown))
                        .unwrap_or(StopReason::Unknown);
                    Ok(PromptOutcome { stop_reason })
                }
                Ok(Err(err)) => Err(err),
                Err(_) => Err(AcpError::Disconnected(
                    "prompt response channel dropped".to_string(),
                )),
            };
            shared.active.store(false, Ordering::SeqCst);
            let mut prompt = shared.prompt.lock().unwrap();
            prompt.sink = None;
            prompt.session_id = None;
            drop(prompt);
            let _ = done_tx.send(outcome);
        });
        Ok(PromptInFlight::from_receiver(done_rx))
    }

    async fn set_session_mode(&self, session_id: &str, mode_id: &str) -> AcpResult<()> {
        self.shared
            .request(
                "session/set_mode",
                json!({ "sessionId": session_id, "modeId": mode_id }),
            )
            .await?;
        Ok(())
    }

    async fn set_session_config_option(
        &self,
        session_id: &str,
        config_id: &str,
        value: Value,
    ) -> AcpResult<Value> {
        self.shared
            .request(
                "session/set_config_option",
                json!({ "sessionId": session_id, "configId": config_id, "value": value }),
            )
            .await
    }

    async fn request_cancel_active_prompt(&self) -> AcpResult<()> {
        let session_id = {
            let prompt = self.shared.prompt.lock().unwrap();
            prompt.session_id.clone()
        };
        match session_id {
            Some(session_id) => {
                self.shared
                    .notify("session/cancel", json!({ "sessionId": session_id }))
                    .await
            }
            None => Ok(()),
        }
    }

    async fn cancel_active_prompt(&self, wait_ms: u64) {
        if let Err(err) = self.request_cancel_active_prompt().await {
            tracing::warn!(error = %err, "failed to send session/cancel");
        }
        let deadline = tokio::time::Instant::now() + Duration::from_millis(wait_ms);
        while self.shared.active.load(Ordering::SeqCst)
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn close(&self) {
        // Dropping stdin signals EOF; most agents exit on their own.
        *self.shared.stdin.lock().await = None;
        let pid = self.shared.lifecycle.lock().unwrap().pid;
        if let Some(pid) = pid {
            terminate_process(pid).await;
        }
        let mut lifecycle = self.shared.lifecycle.lock().unwrap();
        if let Some(exit) = &mut lifecycle.last_exit {
            exit.reason.get_or_insert_with(|| "closed".to_string());
        }
        drop(lifecycle);
        self.shared.fail_pending("connection closed");
    }

    fn agent_lifecycle_snapshot(&self) -> AgentLifecycleSnapshot {
        let lifecycle = self.shared.lifecycle.lock().unwrap();
        AgentLifecycleSnapshot {
            pid: lifecycle.pid,
            started_at: lifecycle.started_at,
            last_exit: lifecycle.last_exit.clone(),
        }
    }

    fn has_active_prompt(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    fn permission_stats(&self) -> PermissionStats {
        *self.shared.stats.lock().unwrap()
    }
}

async fn handle_frame(shared: &Arc<Shared>, frame: Value) {
    let has_method = frame.get("method").and_then(Value::as_str).is_some();
    let id = frame.get("id").cloned();

    if !has_method {
        // Response to one of our requests.
        let Some(id) = id.as_ref().and_then(Value::as_i64) else {
            tracing::warn!("agent frame has neither method nor usable id");
            return;
        };
        let sender = shared.pending.lock().unwrap().remove(&id);
        let Some(sender) = sender else {
            tracing::debug!(id, "response for unknown request id");
            return;
        };
        let outcome = if let Some(error) = frame.get("error") {
            Err(AcpError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-32603),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown agent error")
                    .to_string(),
                data: error.get("data").cloned(),
            })
        } else {
            Ok(frame.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = sender.send(outcome);
        return;
    }

    let method = frame
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let params = frame.get("params").cloned().unwrap_or(Value::Null);

    match id {
        Some(id) => handle_inbound_request(shared, &id, &method, params).await,
        None => handle_notification(shared, &method, params),
    }
}

fn handle_notification(shared: &Arc<Shared>, method: &str, params: Value) {
    match method {
        "session/update" => match serde_json::from_value::<SessionNotification>(params) {
            Ok(notification) => shared.emit(AgentEvent::SessionUpdate(notification)),
            Err(err) => {
                tracing::debug!(error = %err, "dropping unrecognised session update");
            }
        },
        other => {
            tracing::debug!(method = other, "ignoring agent notification");
        }
    }
}

async fn handle_inbound_request(shared: &Arc<Shared>, id: &Value, method: &str, params: Value) {
    match method {
        "session/request_permission" => {
            let options: Vec<PermissionOption> = params
                .get("options")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            let request_kind = params
                .get("toolCall")
                .and_then(|tc| tc.get("kind"))
                .and_then(Value::as_str)
                .map(String::from);
            let session_id = params
                .get("sessionId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            shared.stats.lock().unwrap().requested += 1;
            shared.emit(AgentEvent::ClientOperation(
                ClientOperation::RequestPermission {
                    session_id,
                    tool_call: params.get("toolCall").cloned(),
                    options: options.clone(),
                },
            ));

            let decision = {
                let prompt = shared.prompt.lock().unwrap();
                match prompt.policy.choose(&options, request_kind.as_deref()) {
                    PermissionDecision::Approved(option) => Some((true, option.option_id.clone())),
                    PermissionDecision::Denied(option) => Some((false, option.option_id.clone())),
                    PermissionDecision::Cancelled => None,
                }
            };
            let outcome = match decision {
                Some((approved, option_id)) => {
                    let mut stats = shared.stats.lock().unwrap();
                    if approved {
                        stats.approved += 1;
                    } else {
                        stats.denied += 1;
                    }
                    json!({ "outcome": { "outcome": "selected", "optionId": option_id } })
                }
                None => {
                    shared.stats.lock().unwrap().cancelled += 1;
                    json!({ "outcome": { "outcome": "cancelled" } })
                }
            };
            shared.respond(id, outcome).await;
        }
        "fs/read_text_file" | "fs/write_text_file" => {
            let path = params
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let operation = if method == "fs/read_text_file" {
                ClientOperation::ReadTextFile { path }
            } else {
                ClientOperation::WriteTextFile { path }
            };
            shared.emit(AgentEvent::ClientOperation(operation));
            shared
                .respond_error(id, JSONRPC_METHOD_NOT_FOUND, "filesystem access is disabled")
                .await;
        }
        other if other.starts_with("terminal/") => {
            shared.emit(AgentEvent::ClientOperation(ClientOperation::Terminal {
                method: other.to_string(),
            }));
            shared
                .respond_error(id, JSONRPC_METHOD_NOT_FOUND, "terminal access is disabled")
                .await;
        }
        other => {
            shared.emit(AgentEvent::ClientOperation(ClientOperation::Unknown {
                method: other.to_string(),
                params,
            }));
            shared
                .respond_error(id, JSONRPC_METHOD_NOT_FOUND, "unsupported client method")
                .await;
        }
    }
}

#[cfg(unix)]
fn unix_signal(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|sig| sig.to_string())
}

#[cfg(not(unix))]
fn unix_signal(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

/// Factory spawning real agent subprocesses.
#[derive(Debug, Default)]
pub struct StdioConnectionFactory;

#[async_trait]
impl AgentConnectionFactory for StdioConnectionFactory {
    async fn create(&self, spec: &AgentSpawnSpec) -> AcpResult<Arc<dyn AgentConnection>> {
        Ok(Arc::new(StdioAgentConnection::new(spec.clone())))
    }
}

//! Session orchestrator.
//!
//! Public entry points behind the CLI dispatcher. Every operation first
//! tries the running queue owner over its socket; when none is serving,
//! `send` acquires the lease and becomes the owner inline, control
//! operations fall back to a dedicated one-shot connection, and `cancel`
//! simply reports that there was nothing to cancel.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use acpx_acp::process::{pid_alive, pid_command_matches, terminate_process};
use acpx_acp::{AgentConnectionFactory, AgentSpawnSpec, ControlRequest};
use acpx_core::{
    detail, ErrorOrigin, EventDraft, EventPayload, FormatterContext, OutputError, OutputFormatter,
    SessionRecord,
};
use acpx_queue::{
    lock_path, probe_health, read_lease, run_direct_control, run_queue_owner, try_acquire,
    ChannelSink, OwnerClient, OwnerMessage, OwnerTask, QueueOwnerOptions, QueueRequest,
    SendResult,
};
use acpx_store::{create_event_for_record, SessionRecordStore};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

/// Pause between lease re-checks while another process is acquiring.
const LEASE_CONTENTION_RETRY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub message: String,
    pub permission_mode: String,
    pub non_interactive_permissions: Option<Value>,
    pub timeout_ms: Option<u64>,
    pub wait_for_completion: bool,
}

/// What `send` resolved to: a completed prompt, or an acknowledged enqueue
/// when the caller did not wait for completion.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Completed(SendResult),
    Enqueued {
        session_id: String,
        request_id: String,
    },
}

/// `ensure` result.
#[derive(Debug, Clone)]
pub struct EnsureOutcome {
    pub record: SessionRecord,
    pub created: bool,
}

/// Snapshot returned by `status`.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub record: SessionRecord,
    pub owner_healthy: bool,
    pub owner_pid: Option<u32>,
    pub queue_depth: u32,
}

pub struct SessionOrchestrator {
    config: acpx_core::AcpxConfig,
    store: SessionRecordStore,
    factory: Arc<dyn AgentConnectionFactory>,
    shutdown: broadcast::Sender<()>,
}

impl SessionOrchestrator {
    pub fn new(config: acpx_core::AcpxConfig, factory: Arc<dyn AgentConnectionFactory>) -> Self {
        let (shutdown, _) = broadcast::channel(4);
        Self {
            store: SessionRecordStore::new(config.clone()),
            config,
            factory,
            shutdown,
        }
    }

    pub fn store(&self) -> &SessionRecordStore {
        &self.store
    }

    /// Handle used by the CLI to propagate SIGINT/SIGTERM into a running
    /// inline owner.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// Submit a prompt: to the running owner when one serves this session,
    /// otherwise acquire the lease and run the owner loop inline.
    pub async fn send(
        &self,
        record_id: &str,
        options: SendOptions,
        formatter: &dyn OutputFormatter,
    ) -> Result<SendOutcome, OutputError> {
        let record = self.store.resolve(record_id).map_err(OutputError::from)?;
        let record_id = record.acpx_record_id.clone();
        let request_id = format!("req-{}", uuid::Uuid::new_v4());
        formatter.set_context(FormatterContext {
            session_id: record_id.clone(),
            acp_session_id: Some(record.acp_session_id.clone()).filter(|s| !s.is_empty()),
            agent_session_id: record.agent_session_id.clone(),
            request_id: Some(request_id.clone()),
            next_seq: Some(record.last_seq + 1),
        });

        loop {
            if let Some(lease) = read_lease(&self.config, &record_id)? {
                let health = probe_health(&self.config, &record_id).await;
                if health.socket_reachable {
                    return self
                        .submit_to_owner(&record_id, &lease, &request_id, &options, formatter)
                        .await;
                }
                if pid_alive(lease.pid) && !lease.heartbeat_is_stale() {
                    return Err(OutputError::runtime(
                        "queue owner is running but not accepting requests",
                    )
                    .with_origin(ErrorOrigin::Queue)
                    .with_detail(detail::QUEUE_NOT_ACCEPTING_REQUESTS));
                }
                // Stale owner: try_acquire below tears it down.
            }

            match try_acquire(&self.config, &record_id).await? {
                Some(lease) => {
                    return self
                        .run_inline_owner(&record_id, lease, &request_id, &options, formatter)
                        .await;
                }
                None => {
                    tokio::time::sleep(LEASE_CONTENTION_RETRY).await;
                }
            }
        }
    }

    async fn submit_to_owner(
        &self,
        record_id: &str,
        lease: &acpx_queue::QueueOwnerLease,
        request_id: &str,
        options: &SendOptions,
        formatter: &dyn OutputFormatter,
    ) -> Result<SendOutcome, OutputError> {
        let mut client = OwnerClient::connect(lease).await?;
        client
            .submit(&QueueRequest::SubmitPrompt {
                request_id: request_id.to_string(),
                message: options.message.clone(),
                permission_mode: options.permission_mode.clone(),
                non_interactive_permissions: options.non_interactive_permissions.clone(),
                timeout_ms: options.timeout_ms,
                wait_for_completion: options.wait_for_completion,
            })
            .await?;

        if !options.wait_for_completion {
            return Ok(SendOutcome::Enqueued {
                session_id: record_id.to_string(),
                request_id: request_id.to_string(),
            });
        }

        loop {
            let Some(message) = client.read_message().await? else {
                return Err(OutputError::runtime("queue owner closed before the result")
                    .with_origin(ErrorOrigin::Queue)
                    .with_detail(detail::QUEUE_OWNER_CLOSED));
            };
            match self.feed_formatter(message, formatter)? {
                Some(outcome) => return Ok(SendOutcome::Completed(outcome)),
                None => continue,
            }
        }
    }

    async fn run_inline_owner(
        &self,
        record_id: &str,
        lease: acpx_queue::LeaseGuard,
        request_id: &str,
        options: &SendOptions,
        formatter: &dyn OutputFormatter,
    ) -> Result<SendOutcome, OutputError> {
        let (stream_tx, mut stream_rx) = mpsc::unbounded_channel();
        let seed = OwnerTask {
            request_id: request_id.to_string(),
            message: options.message.clone(),
            permission_mode: options.permission_mode.clone(),
            non_interactive_permissions: options.non_interactive_permissions.clone(),
            timeout_ms: options.timeout_ms,
            wait_for_completion: options.wait_for_completion,
            queued_behind_turn: false,
            sink: Arc::new(ChannelSink::new(stream_tx)),
        };
        let owner = tokio::spawn(run_queue_owner(
            self.config.clone(),
            self.store.clone(),
            record_id.to_string(),
            self.factory.clone(),
            lease,
            seed,
            QueueOwnerOptions {
                idle_ttl_ms: self.config.idle_ttl_ms,
                default_timeout_ms: self.config.request_timeout_ms,
            },
            self.shutdown.subscribe(),
        ));

        let mut outcome: Option<Result<SendResult, OutputError>> = None;
        while let Some(message) = stream_rx.recv().await {
            if options.wait_for_completion {
                match self.feed_formatter(message, formatter) {
                    Ok(Some(result)) => {
                        outcome = Some(Ok(result));
                        break;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        outcome = Some(Err(err));
                        break;
                    }
                }
            } else if matches!(
                message,
                OwnerMessage::Result { .. } | OwnerMessage::Error { .. }
            ) {
                break;
            }
        }

        // Let the owner drain its queue (later submitters may have joined)
        // and release the lease before returning.
        match owner.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "inline queue owner exited with error");
            }
            Err(join_err) => {
                return Err(OutputError::runtime(format!(
                    "inline queue owner panicked: {join_err}"
                )));
            }
        }

        match outcome {
            Some(Ok(result)) => Ok(SendOutcome::Completed(result)),
            Some(Err(err)) => Err(err),
            None => Ok(SendOutcome::Enqueued {
                session_id: record_id.to_string(),
                request_id: request_id.to_string(),
            }),
        }
    }

    /// Route one owner message to the formatter; returns the final result
    /// when the stream is done.
    fn feed_formatter(
        &self,
        message: OwnerMessage,
        formatter: &dyn OutputFormatter,
    ) -> Result<Option<SendResult>, OutputError> {
        match message {
            OwnerMessage::Accepted { .. } => Ok(None),
            OwnerMessage::SessionUpdate { notification } => {
                formatter.on_session_update(&notification);
                Ok(None)
            }
            OwnerMessage::ClientOperation { operation } => {
                formatter.on_client_operation(&operation);
                Ok(None)
            }
            OwnerMessage::Done { stop_reason } => {
                formatter.on_done(stop_reason);
                Ok(None)
            }
            OwnerMessage::Result { result } => Ok(Some(result)),
            other => {
                if let Some(err) = acpx_queue::error_from_message(&other) {
                    formatter.on_error(&err);
                    return Err(err);
                }
                Err(OutputError::runtime(format!(
                    "unexpected owner message: {other:?}"
                ))
                .with_origin(ErrorOrigin::Queue))
            }
        }
    }

    /// Ask the running owner to cancel the active prompt. No owner, or an
    /// unreachable one, means there is nothing to cancel.
    pub async fn cancel(&self, record_id: &str) -> Result<bool, OutputError> {
        let record = self.store.resolve(record_id).map_err(OutputError::from)?;
        let record_id = record.acpx_record_id;
        let Some(lease) = read_lease(&self.config, &record_id)? else {
            return Ok(false);
        };
        let health = probe_health(&self.config, &record_id).await;
        if !health.socket_reachable {
            return Ok(false);
        }
        let mut client = OwnerClient::connect(&lease).await?;
        client
            .submit(&QueueRequest::CancelPrompt {
                request_id: format!("req-{}", uuid::Uuid::new_v4()),
            })
            .await?;
        loop {
            match client.read_message().await? {
                Some(OwnerMessage::CancelResult { cancelled }) => return Ok(cancelled),
                Some(other) => {
                    if let Some(err) = acpx_queue::error_from_message(&other) {
                        return Err(err);
                    }
                }
                None => return Ok(false),
            }
        }
    }

    pub async fn set_mode(
        &self,
        record_id: &str,
        mode_id: &str,
        timeout_ms: Option<u64>,
    ) -> Result<(), OutputError> {
        let record = self.store.resolve(record_id).map_err(OutputError::from)?;
        let record_id = record.acpx_record_id;
        let request = QueueRequest::SetMode {
            request_id: format!("req-{}", uuid::Uuid::new_v4()),
            mode_id: mode_id.to_string(),
            timeout_ms,
        };
        match self.control_via_owner(&record_id, request).await? {
            Some(OwnerMessage::SetModeResult { .. }) => Ok(()),
            Some(other) => Err(unexpected_control_reply(other)),
            None => {
                run_direct_control(
                    self.config.clone(),
                    self.store.clone(),
                    record_id,
                    self.factory.clone(),
                    ControlRequest::SetMode {
                        mode_id: mode_id.to_string(),
                    },
                )
                .await?;
                Ok(())
            }
        }
    }

    pub async fn set_config_option(
        &self,
        record_id: &str,
        config_id: &str,
        value: Value,
        timeout_ms: Option<u64>,
    ) -> Result<Value, OutputError> {
        let record = self.store.resolve(record_id).map_err(OutputError::from)?;
        let record_id = record.acpx_record_id;
        let request = QueueRequest::SetConfigOption {
            request_id: format!("req-{}", uuid::Uuid::new_v4()),
            config_id: config_id.to_string(),
            value: value.clone(),
            timeout_ms,
        };
        match self.control_via_owner(&record_id, request).await? {
            Some(OwnerMessage::SetConfigOptionResult { response }) => Ok(response),
            Some(other) => Err(unexpected_control_reply(other)),
            None => {
                run_direct_control(
                    self.config.clone(),
                    self.store.clone(),
                    record_id,
                    self.factory.clone(),
                    ControlRequest::SetConfigOption {
                        config_id: config_id.to_string(),
                        value,
                    },
                )
                .await
            }
        }
    }

    /// Try a control request against the running owner; `None` when no
    /// owner is serving.
    async fn control_via_owner(
        &self,
        record_id: &str,
        request: QueueRequest,
    ) -> Result<Option<OwnerMessage>, OutputError> {
        let Some(lease) = read_lease(&self.config, record_id)? else {
            return Ok(None);
        };
        if !probe_health(&self.config, record_id).await.socket_reachable {
            return Ok(None);
        }
        let mut client = OwnerClient::connect(&lease).await?;
        client.submit(&request).await?;
        loop {
            match client.read_message().await? {
                Some(other) => {
                    if let Some(err) = acpx_queue::error_from_message(&other) {
                        return Err(err);
                    }
                    return Ok(Some(other));
                }
                None => {
                    return Err(OutputError::runtime("queue owner closed mid-request")
                        .with_origin(ErrorOrigin::Queue)
                        .with_detail(detail::QUEUE_CONTROL_REQUEST_FAILED))
                }
            }
        }
    }

    /// Find the session owning `cwd` (bounded by the enclosing git root) or
    /// create one: spawn the agent, `session/new`, persist, tear down.
    pub async fn ensure(
        &self,
        agent_command: &str,
        cwd: &Path,
        name: Option<&str>,
    ) -> Result<EnsureOutcome, OutputError> {
        if let Some(record) = self
            .store
            .find_by_directory_walk(agent_command, cwd, name, None)
            .map_err(OutputError::from)?
        {
            return Ok(EnsureOutcome {
                record,
                created: false,
            });
        }

        let mut record = SessionRecord::new(
            &self.config,
            agent_command,
            cwd.to_path_buf(),
            name.map(String::from),
        );
        let connection = self
            .factory
            .create(&AgentSpawnSpec {
                agent_command: agent_command.to_string(),
                cwd: cwd.to_path_buf(),
            })
            .await
            .map_err(OutputError::from)?;
        let init = connection.start().await.map_err(OutputError::from)?;
        let created = connection.create_session(cwd).await.map_err(OutputError::from);
        let created = match created {
            Ok(created) => created,
            Err(err) => {
                connection.close().await;
                return Err(err);
            }
        };

        record.acp_session_id = created.session_id;
        record.agent_session_id = created.agent_session_id;
        record.protocol_version = init.protocol_version;
        record.agent_capabilities = Some(init.agent_capabilities);
        connection.close().await;
        self.store.write(&record).map_err(OutputError::from)?;

        Ok(EnsureOutcome {
            record,
            created: true,
        })
    }

    /// Soft-close: stop the owner, stop the agent if it demonstrably is
    /// ours, mark the record closed. Idempotent.
    pub async fn close_session(&self, record_id: &str) -> Result<SessionRecord, OutputError> {
        let mut record = self.store.resolve(record_id).map_err(OutputError::from)?;
        if record.closed {
            return Ok(record);
        }
        let record_id = record.acpx_record_id.clone();

        if let Some(lease) = read_lease(&self.config, &record_id)? {
            if pid_alive(lease.pid) {
                tracing::info!(pid = lease.pid, "terminating queue owner");
                terminate_process(lease.pid).await;
            }
            let _ = std::fs::remove_file(&lease.socket_path);
            let _ = std::fs::remove_file(lock_path(&self.config, &record_id));
        }

        if let Some(pid) = record.pid {
            if pid_alive(pid) && pid_command_matches(pid, &record.agent_command) {
                tracing::info!(pid, "terminating agent process");
                terminate_process(pid).await;
            }
        }

        record.closed = true;
        record.closed_at = Some(Utc::now());
        record.pid = None;
        record.touch();
        self.store.write(&record).map_err(OutputError::from)?;
        Ok(record)
    }

    /// Record summary plus owner probe. Emits a `status_snapshot` event to
    /// the formatter without persisting anything.
    pub async fn status(
        &self,
        record_id: &str,
        formatter: &dyn OutputFormatter,
    ) -> Result<SessionStatus, OutputError> {
        let record = self.store.resolve(record_id).map_err(OutputError::from)?;
        let health = probe_health(&self.config, &record.acpx_record_id).await;
        let lease = read_lease(&self.config, &record.acpx_record_id)?;

        let status = SessionStatus {
            owner_healthy: health.healthy,
            owner_pid: lease.as_ref().map(|l| l.pid),
            queue_depth: lease.as_ref().map(|l| l.queue_depth).unwrap_or(0),
            record,
        };

        let snapshot = create_event_for_record(
            &status.record,
            EventDraft::new(EventPayload::StatusSnapshot {
                record: json!({
                    "acpx_record_id": status.record.acpx_record_id,
                    "acp_session_id": status.record.acp_session_id,
                    "agent_command": status.record.agent_command,
                    "cwd": status.record.cwd,
                    "name": status.record.name,
                    "closed": status.record.closed,
                    "last_seq": status.record.last_seq,
                    "last_used_at": status.record.last_used_at,
                    "pid": status.record.pid,
                }),
                queue: Some(json!({
                    "healthy": status.owner_healthy,
                    "pid": status.owner_pid,
                    "queue_depth": status.queue_depth,
                })),
            }),
        );
        formatter.set_context(FormatterContext {
            session_id: status.record.acpx_record_id.clone(),
            acp_session_id: Some(status.record.acp_session_id.clone()).filter(|s| !s.is_empty()),
            agent_session_id: status.record.agent_session_id.clone(),
            request_id: None,
            next_seq: Some(status.record.last_seq + 1),
        });
        formatter.on_event(&snapshot);
        Ok(status)
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>, OutputError> {
        self.store.list().map_err(OutputError::from)
    }

    pub fn list_sessions_for_agent(
        &self,
        agent_command: &str,
    ) -> Result<Vec<SessionRecord>, OutputError> {
        self.store
            .list_for_agent(agent_command)
            .map_err(OutputError::from)
    }

    /// Interrupt entry point wired to SIGINT: ask the owner (local or
    /// remote) to cancel, then surface the interrupted error.
    pub async fn interrupt(&self, record_id: &str) -> OutputError {
        match self.cancel(record_id).await {
            Ok(_) => {}
            Err(err) => tracing::debug!(error = %err, "cancel during interrupt failed"),
        }
        let _ = self.shutdown.send(());
        OutputError::runtime("interrupted")
            .with_detail(detail::INTERRUPTED)
            .with_origin(ErrorOrigin::Cli)
    }
}

fn unexpected_control_reply(message: OwnerMessage) -> OutputError {
    OutputError::runtime(format!("unexpected control reply: {message:?}"))
        .with_origin(ErrorOrigin::Queue)
        .with_detail(detail::QUEUE_CONTROL_REQUEST_FAILED)
}

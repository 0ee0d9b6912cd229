//! Queue-owner main loop.
//!
//! The owner holds the lease, serves the IPC socket, holds the events lock,
//! and drives prompt turns one at a time from an in-process FIFO. It exits
//! when the idle TTL elapses with no work (TTL `0` disables idle shutdown),
//! when told to close, or when a connect-level failure leaves nothing to do.
//!
//! Heartbeats: the lease is refreshed on every queue state change and,
//! independently, on a 5 second tick, so a keep-alive-forever owner never
//! looks stale to probers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use acpx_acp::process::pid_alive;
use acpx_acp::{
    connect_and_load, AgentConnection, AgentConnectionFactory, AgentEvent, AgentSpawnSpec,
    ConnectionController, ControlFallback, ControlRequest, PermissionPolicy, TurnController,
    TurnState,
};
use acpx_core::{
    detail, event_payload_for_update, AcpxConfig, AcpxEvent, ContentBlock, ErrorOrigin,
    EventDraft, EventPayload, OutputError, Projection, SessionUpdate,
};
use acpx_store::{clear_stale_events_lock, EventLogWriter, SessionRecordStore};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};

use crate::lease::LeaseGuard;
use crate::wire::{OwnerMessage, QueueRequest, SendResult};

/// Unconditional lease refresh cadence.
const HEARTBEAT_TICK: Duration = Duration::from_secs(5);

/// Where a task's stream messages go. Socket for IPC submitters, channel
/// for the inline seed task, null for fire-and-forget submissions.
#[async_trait]
pub trait TaskSink: Send + Sync {
    async fn send(&self, message: OwnerMessage);
    async fn close(&self);
}

pub struct SocketSink {
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
}

impl SocketSink {
    pub fn new(writer: OwnedWriteHalf) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(Some(writer)),
        }
    }
}

#[async_trait]
impl TaskSink for SocketSink {
    async fn send(&self, message: OwnerMessage) {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return;
        };
        let Ok(mut line) = serde_json::to_vec(&message) else {
            return;
        };
        line.push(b'\n');
        if writer.write_all(&line).await.is_err() || writer.flush().await.is_err() {
            tracing::debug!("submitter went away mid-stream");
            *guard = None;
        }
    }

    async fn close(&self) {
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = writer.shutdown().await;
        }
    }
}

/// In-process sink used when the submitting process became the owner.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<OwnerMessage>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<OwnerMessage>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl TaskSink for ChannelSink {
    async fn send(&self, message: OwnerMessage) {
        let _ = self.tx.send(message);
    }

    async fn close(&self) {}
}

/// Sink for `waitForCompletion=false` submissions.
pub struct NullTaskSink;

#[async_trait]
impl TaskSink for NullTaskSink {
    async fn send(&self, _message: OwnerMessage) {}
    async fn close(&self) {}
}

/// One queued prompt with its per-submission context.
pub struct OwnerTask {
    pub request_id: String,
    pub message: String,
    pub permission_mode: String,
    pub non_interactive_permissions: Option<Value>,
    pub timeout_ms: Option<u64>,
    pub wait_for_completion: bool,
    /// Whether a turn was running when this task was accepted.
    pub queued_behind_turn: bool,
    pub sink: Arc<dyn TaskSink>,
}

#[derive(Debug, Clone)]
pub struct QueueOwnerOptions {
    /// Idle shutdown; `0` keeps the owner alive until closed.
    pub idle_ttl_ms: u64,
    pub default_timeout_ms: u64,
}

enum TurnEnd {
    Completed,
    /// initialize / session-new / session-load failed; exit if idle.
    FatalConnect,
}

struct OwnerShared {
    config: AcpxConfig,
    store: SessionRecordStore,
    record_id: String,
    agent_command: String,
    cwd: std::path::PathBuf,
    turn: TurnController,
    writer: tokio::sync::Mutex<Option<EventLogWriter>>,
    tasks_tx: mpsc::UnboundedSender<OwnerTask>,
    queue_depth: AtomicU32,
    lease: std::sync::Mutex<Option<LeaseGuard>>,
    agent: tokio::sync::Mutex<Option<Arc<dyn AgentConnection>>>,
    factory: Arc<dyn AgentConnectionFactory>,
    options: QueueOwnerOptions,
}

impl OwnerShared {
    fn refresh_lease(&self) {
        let depth = self.queue_depth.load(Ordering::SeqCst);
        if let Some(lease) = self.lease.lock().unwrap().as_mut() {
            if let Err(err) = lease.refresh(depth) {
                tracing::warn!(error = %err, "failed to refresh queue lease");
            }
        }
    }

    fn spawn_spec(&self) -> AgentSpawnSpec {
        AgentSpawnSpec {
            agent_command: self.agent_command.clone(),
            cwd: self.cwd.clone(),
        }
    }

    /// Create, append, and return the envelope; `None` once the writer is
    /// torn down during shutdown.
    async fn append(&self, draft: EventDraft, checkpoint: bool) -> Option<AcpxEvent> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut()?;
        let event = writer.create_event(draft);
        if let Err(err) = writer.append_events(std::slice::from_ref(&event), checkpoint) {
            tracing::warn!(error = %err, kind = event.payload.type_str(), "failed to append event");
            return None;
        }
        Some(event)
    }

    /// Reuse the live connection when its process is still up, otherwise
    /// build a fresh one from the factory.
    async fn current_connection(&self) -> Result<Arc<dyn AgentConnection>, OutputError> {
        let mut slot = self.agent.lock().await;
        if let Some(existing) = slot.as_ref() {
            let snapshot = existing.agent_lifecycle_snapshot();
            let alive =
                snapshot.last_exit.is_none() && snapshot.pid.map(pid_alive).unwrap_or(false);
            if alive {
                return Ok(existing.clone());
            }
        }
        let fresh = self
            .factory
            .create(&self.spawn_spec())
            .await
            .map_err(OutputError::from)?;
        *slot = Some(fresh.clone());
        Ok(fresh)
    }
}

/// Direct one-shot control operation: dedicated connection, apply, teardown.
/// Used by the turn controller fallback and by the orchestrator when no
/// owner is running.
pub async fn run_direct_control(
    config: AcpxConfig,
    store: SessionRecordStore,
    record_id: String,
    factory: Arc<dyn AgentConnectionFactory>,
    request: ControlRequest,
) -> Result<Value, OutputError> {
    let mut record = store.read(&record_id).map_err(OutputError::from)?;
    let spec = AgentSpawnSpec {
        agent_command: record.agent_command.clone(),
        cwd: record.cwd.clone(),
    };
    let connection = factory.create(&spec).await.map_err(OutputError::from)?;
    let outcome = connect_and_load(
        connection.as_ref(),
        &store,
        &mut record,
        config.request_timeout_ms,
    )
    .await?;

    let result = match &request {
        ControlRequest::SetMode { mode_id } => {
            connection
                .set_session_mode(&outcome.session_id, mode_id)
                .await
                .map_err(OutputError::from)?;
            Value::String(mode_id.clone())
        }
        ControlRequest::SetConfigOption { config_id, value } => connection
            .set_session_config_option(&outcome.session_id, config_id, value.clone())
            .await
            .map_err(OutputError::from)?,
    };
    connection.close().await;
    Ok(result)
}

/// Run the queue owner until idle timeout, shutdown, or a fatal connect
/// failure with an empty queue. `seed` is the task that caused this process
/// to take the lease.
pub async fn run_queue_owner(
    config: AcpxConfig,
    store: SessionRecordStore,
    record_id: String,
    factory: Arc<dyn AgentConnectionFactory>,
    lease: LeaseGuard,
    seed: OwnerTask,
    options: QueueOwnerOptions,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), OutputError> {
    // A crashed predecessor leaves the events lock behind; it is safe to
    // clear once its pid is gone.
    clear_stale_events_lock(&config, &record_id, pid_alive).map_err(OutputError::from)?;

    let record = store.read(&record_id).map_err(OutputError::from)?;
    let agent_command = record.agent_command.clone();
    let cwd = record.cwd.clone();
    let writer = EventLogWriter::open(store.clone(), record)
        .await
        .map_err(OutputError::from)?;

    let socket_path = lease.socket_path().clone();
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path).map_err(|err| {
        OutputError::runtime(format!("failed to bind owner socket: {err}"))
            .with_origin(ErrorOrigin::Queue)
    })?;

    let (tasks_tx, mut tasks_rx) = mpsc::unbounded_channel();

    let shared = Arc::new_cyclic(|weak: &std::sync::Weak<OwnerShared>| {
        let fallback_weak = weak.clone();
        let fallback: ControlFallback = Arc::new(move |request| {
            let shared = fallback_weak.clone();
            Box::pin(async move {
                let Some(shared) = shared.upgrade() else {
                    return Err(OutputError::runtime("queue owner is gone")
                        .with_detail(detail::QUEUE_OWNER_CLOSED));
                };
                run_direct_control(
                    shared.config.clone(),
                    shared.store.clone(),
                    shared.record_id.clone(),
                    shared.factory.clone(),
                    request,
                )
                .await
            })
        });
        OwnerShared {
            config: config.clone(),
            store: store.clone(),
            record_id: record_id.clone(),
            agent_command,
            cwd,
            turn: TurnController::new(fallback, Duration::from_millis(options.default_timeout_ms)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            tasks_tx,
            queue_depth: AtomicU32::new(0),
            lease: std::sync::Mutex::new(Some(lease)),
            agent: tokio::sync::Mutex::new(None),
            factory,
            options: options.clone(),
        }
    });

    let accept_shared = shared.clone();
    let accept_task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let shared = accept_shared.clone();
                    tokio::spawn(async move {
                        handle_connection(shared, stream).await;
                    });
                }
                Err(err) => {
                    tracing::warn!(error = %err, "owner socket accept failed");
                    break;
                }
            }
        }
    });

    let heartbeat_shared = shared.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(HEARTBEAT_TICK);
        tick.tick().await;
        loop {
            tick.tick().await;
            heartbeat_shared.refresh_lease();
        }
    });

    tracing::info!(session = %record_id, socket = %socket_path.display(), "queue owner serving");

    // The seed task runs first; later tasks in FIFO order of acceptance.
    let mut next = Some(seed);
    let exit_reason: &str = loop {
        let task = match next.take() {
            Some(task) => task,
            None => match wait_for_next(&mut tasks_rx, options.idle_ttl_ms, &mut shutdown).await {
                NextTask::Task(task) => {
                    shared.queue_depth.fetch_sub(1, Ordering::SeqCst);
                    shared.refresh_lease();
                    task
                }
                NextTask::IdleTimeout => break "idle ttl",
                NextTask::Shutdown => break "shutdown requested",
            },
        };
        match run_turn(&shared, task).await {
            TurnEnd::Completed => {}
            TurnEnd::FatalConnect => {
                if shared.queue_depth.load(Ordering::SeqCst) == 0 {
                    break "agent connect failed";
                }
            }
        }
    };
    tracing::info!(session = %record_id, reason = exit_reason, "queue owner stopping");

    shared.turn.begin_closing();
    accept_task.abort();
    heartbeat_task.abort();

    // Drain tasks that will never run.
    tasks_rx.close();
    while let Ok(task) = tasks_rx.try_recv() {
        let err = OutputError::runtime("queue owner is shutting down")
            .with_detail(detail::QUEUE_OWNER_SHUTTING_DOWN)
            .with_origin(ErrorOrigin::Queue);
        task.sink
            .send(OwnerMessage::error(Some(task.request_id.clone()), &err))
            .await;
        task.sink.close().await;
    }

    if let Some(connection) = shared.agent.lock().await.take() {
        connection.close().await;
    }

    // Final checkpoint, release the events lock, then the lease.
    if let Some(writer) = shared.writer.lock().await.take() {
        if let Err(err) = writer.close(true) {
            tracing::warn!(error = %err, "final checkpoint failed");
        }
    }
    if let Some(lease) = shared.lease.lock().unwrap().take() {
        lease.release();
    }
    Ok(())
}

enum NextTask {
    Task(OwnerTask),
    IdleTimeout,
    Shutdown,
}

async fn wait_for_next(
    rx: &mut mpsc::UnboundedReceiver<OwnerTask>,
    idle_ttl_ms: u64,
    shutdown: &mut broadcast::Receiver<()>,
) -> NextTask {
    if idle_ttl_ms == 0 {
        tokio::select! {
            task = rx.recv() => task.map(NextTask::Task).unwrap_or(NextTask::Shutdown),
            _ = wait_shutdown(shutdown) => NextTask::Shutdown,
        }
    } else {
        tokio::select! {
            task = tokio::time::timeout(Duration::from_millis(idle_ttl_ms), rx.recv()) => {
                match task {
                    Ok(Some(task)) => NextTask::Task(task),
                    Ok(None) => NextTask::Shutdown,
                    Err(_) => NextTask::IdleTimeout,
                }
            }
            _ = wait_shutdown(shutdown) => NextTask::Shutdown,
        }
    }
}

/// Resolves only on an actual shutdown signal. A dropped sender means "no
/// one will ever ask us to stop", not "stop now".
async fn wait_shutdown(rx: &mut broadcast::Receiver<()>) {
    loop {
        match rx.recv().await {
            Ok(()) => return,
            Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

async fn handle_connection(shared: Arc<OwnerShared>, stream: UnixStream) {
    let (read_half, write_half) = stream.into_split();
    let sink = Arc::new(SocketSink::new(write_half));
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => return,
        Ok(_) => {}
    }

    let request = match crate::wire::parse_request(line.trim()) {
        Ok(request) => request,
        Err(err) => {
            sink.send(OwnerMessage::error(Some("unknown".to_string()), &err))
                .await;
            sink.close().await;
            return;
        }
    };

    sink.send(OwnerMessage::Accepted {
        request_id: request.request_id().to_string(),
    })
    .await;

    match request {
        QueueRequest::SubmitPrompt {
            request_id,
            message,
            permission_mode,
            non_interactive_permissions,
            timeout_ms,
            wait_for_completion,
        } => {
            let task_sink: Arc<dyn TaskSink> = if wait_for_completion {
                sink.clone()
            } else {
                sink.close().await;
                Arc::new(NullTaskSink)
            };
            let task = OwnerTask {
                request_id: request_id.clone(),
                message,
                permission_mode,
                non_interactive_permissions,
                timeout_ms,
                wait_for_completion,
                queued_behind_turn: shared.turn.state() != TurnState::Idle,
                sink: task_sink,
            };
            shared.queue_depth.fetch_add(1, Ordering::SeqCst);
            shared.refresh_lease();
            if shared.tasks_tx.send(task).is_err() {
                let err = OutputError::runtime("queue owner is shutting down")
                    .with_detail(detail::QUEUE_OWNER_SHUTTING_DOWN)
                    .with_origin(ErrorOrigin::Queue);
                sink.send(OwnerMessage::error(Some(request_id), &err)).await;
                sink.close().await;
            }
        }
        QueueRequest::CancelPrompt { request_id } => {
            let cancelled = shared.turn.request_cancel().await;
            shared
                .append(
                    EventDraft::new(EventPayload::CancelRequested {})
                        .with_request_id(request_id.clone()),
                    false,
                )
                .await;
            shared
                .append(
                    EventDraft::new(EventPayload::CancelResult { cancelled })
                        .with_request_id(request_id.clone()),
                    false,
                )
                .await;
            sink.send(OwnerMessage::CancelResult { cancelled }).await;
            sink.close().await;
        }
        QueueRequest::SetMode {
            request_id,
            mode_id,
            timeout_ms,
        } => {
            match shared.turn.set_session_mode(&mode_id, timeout_ms).await {
                Ok(()) => {
                    shared
                        .append(
                            EventDraft::new(EventPayload::ModeSet {
                                mode_id: mode_id.clone(),
                            })
                            .with_request_id(request_id),
                            true,
                        )
                        .await;
                    sink.send(OwnerMessage::SetModeResult { mode_id }).await;
                }
                Err(err) => {
                    let err = ensure_detail(err, detail::QUEUE_CONTROL_REQUEST_FAILED);
                    sink.send(OwnerMessage::error(Some(request_id), &err)).await;
                }
            }
            sink.close().await;
        }
        QueueRequest::SetConfigOption {
            request_id,
            config_id,
            value,
            timeout_ms,
        } => {
            match shared
                .turn
                .set_session_config_option(&config_id, value.clone(), timeout_ms)
                .await
            {
                Ok(response) => {
                    shared
                        .append(
                            EventDraft::new(EventPayload::ConfigSet {
                                config_id: config_id.clone(),
                                value: value.clone(),
                            })
                            .with_request_id(request_id),
                            true,
                        )
                        .await;
                    sink.send(OwnerMessage::SetConfigOptionResult { response })
                        .await;
                }
                Err(err) => {
                    let err = ensure_detail(err, detail::QUEUE_CONTROL_REQUEST_FAILED);
                    sink.send(OwnerMessage::error(Some(request_id), &err)).await;
                }
            }
            sink.close().await;
        }
    }
}

fn ensure_detail(mut err: OutputError, detail_code: &str) -> OutputError {
    if err.detail_code.is_none() {
        err.detail_code = Some(detail_code.to_string());
    }
    err
}

async fn run_turn(shared: &Arc<OwnerShared>, task: OwnerTask) -> TurnEnd {
    if let Err(err) = shared.turn.begin_turn() {
        task.sink
            .send(OwnerMessage::error(Some(task.request_id.clone()), &err))
            .await;
        task.sink.close().await;
        return TurnEnd::Completed;
    }
    let turn_guard = {
        let shared = shared.clone();
        scopeguard::guard((), move |_| shared.turn.end_turn())
    };
    let end = run_turn_inner(shared, &task).await;
    drop(turn_guard);
    end
}

async fn run_turn_inner(shared: &Arc<OwnerShared>, task: &OwnerTask) -> TurnEnd {
    if task.queued_behind_turn {
        shared
            .append(
                EventDraft::new(EventPayload::PromptQueued {
                    request_id: task.request_id.clone(),
                    wait_for_completion: task.wait_for_completion,
                })
                .with_request_id(task.request_id.clone()),
                false,
            )
            .await;
    }

    let connection = match shared.current_connection().await {
        Ok(connection) => connection,
        Err(err) => {
            let err = ensure_origin(err, ErrorOrigin::Runtime);
            task.sink
                .send(OwnerMessage::error(Some(task.request_id.clone()), &err))
                .await;
            task.sink.close().await;
            return TurnEnd::FatalConnect;
        }
    };

    let timeout_ms = task.timeout_ms.unwrap_or(shared.options.default_timeout_ms);
    let connect = {
        let mut guard = shared.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => {
                connect_and_load(
                    connection.as_ref(),
                    &shared.store,
                    writer.record_mut(),
                    timeout_ms,
                )
                .await
            }
            None => Err(OutputError::runtime("queue owner is shutting down")
                .with_detail(detail::QUEUE_OWNER_SHUTTING_DOWN)),
        }
    };
    let outcome = match connect {
        Ok(outcome) => outcome,
        Err(err) => {
            let err = ensure_origin(err, ErrorOrigin::Runtime);
            task.sink
                .send(OwnerMessage::error(Some(task.request_id.clone()), &err))
                .await;
            task.sink.close().await;
            return TurnEnd::FatalConnect;
        }
    };

    // Projection works on a copy; it is written back when the turn settles.
    let mut projection = {
        let guard = shared.writer.lock().await;
        match guard.as_ref() {
            Some(writer) => {
                let record = writer.record();
                Projection::from_record_parts(record.thread.clone(), record.acpx.clone())
            }
            None => Projection::default(),
        }
    };

    shared
        .append(
            EventDraft::new(EventPayload::SessionEnsured {
                acp_session_id: outcome.session_id.clone(),
                agent_session_id: outcome.agent_session_id.clone(),
                resumed: outcome.resumed,
                created: !outcome.resumed,
                load_error: outcome.load_error.clone(),
            })
            .with_request_id(task.request_id.clone()),
            false,
        )
        .await;
    shared
        .append(
            EventDraft::new(EventPayload::TurnStarted {
                request_id: task.request_id.clone(),
            })
            .with_request_id(task.request_id.clone()),
            false,
        )
        .await;

    // The submitted message becomes the thread's next user entry.
    let user_update = SessionUpdate::UserMessageChunk {
        content: ContentBlock::text(task.message.clone()),
    };
    if let Some(event) = shared
        .append(
            EventDraft::new(event_payload_for_update(&user_update))
                .with_request_id(task.request_id.clone()),
            false,
        )
        .await
    {
        projection.apply_event(&event);
    }

    let policy = PermissionPolicy::resolve(
        Some(task.permission_mode.as_str()),
        task.non_interactive_permissions.as_ref(),
    );
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let inflight = match connection
        .begin_prompt(&outcome.session_id, &task.message, policy, events_tx)
        .await
    {
        Ok(inflight) => inflight,
        Err(err) => {
            let err = ensure_detail(OutputError::from(err), detail::QUEUE_RUNTIME_PROMPT_FAILED);
            finish_failed_turn(shared, task, &projection, &err, true).await;
            return TurnEnd::Completed;
        }
    };

    shared.turn.bind_controller(Arc::new(ConnectionController::new(
        connection.clone(),
        outcome.session_id.clone(),
    )));
    shared.turn.mark_prompt_active();
    shared.turn.apply_pending_cancel().await;

    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let wait_fut = inflight.wait();
    tokio::pin!(wait_fut);
    let mut events_open = true;

    enum PromptEnd {
        Finished(Result<acpx_acp::PromptOutcome, acpx_acp::AcpError>),
        TimedOut,
    }

    let prompt_end = loop {
        tokio::select! {
            event = events_rx.recv(), if events_open => {
                match event {
                    Some(event) => handle_agent_event(shared, task, &mut projection, event).await,
                    None => events_open = false,
                }
            }
            result = &mut wait_fut => break PromptEnd::Finished(result),
            _ = tokio::time::sleep_until(deadline) => break PromptEnd::TimedOut,
        }
    };
    while let Ok(event) = events_rx.try_recv() {
        handle_agent_event(shared, task, &mut projection, event).await;
    }

    match prompt_end {
        PromptEnd::Finished(Ok(prompt)) => {
            let stats = connection.permission_stats();
            {
                let mut guard = shared.writer.lock().await;
                if let Some(writer) = guard.as_mut() {
                    write_back_projection(writer, &projection);
                    let done = writer.create_event(
                        EventDraft::new(EventPayload::TurnDone {
                            stop_reason: prompt.stop_reason,
                            permission_stats: stats,
                        })
                        .with_request_id(task.request_id.clone()),
                    );
                    if let Err(err) = writer.append_events(std::slice::from_ref(&done), true) {
                        tracing::warn!(error = %err, "failed to log turn_done");
                    }
                }
            }
            task.sink
                .send(OwnerMessage::Done {
                    stop_reason: prompt.stop_reason,
                })
                .await;
            let (acp_session_id, agent_session_id) = {
                let guard = shared.writer.lock().await;
                match guard.as_ref() {
                    Some(writer) => {
                        let record = writer.record();
                        (
                            Some(record.acp_session_id.clone()),
                            record.agent_session_id.clone(),
                        )
                    }
                    None => (None, None),
                }
            };
            task.sink
                .send(OwnerMessage::Result {
                    result: SendResult {
                        request_id: task.request_id.clone(),
                        stop_reason: prompt.stop_reason,
                        permission_stats: stats,
                        acp_session_id,
                        agent_session_id,
                    },
                })
                .await;
            task.sink.close().await;
        }
        PromptEnd::Finished(Err(err)) => {
            let err = ensure_detail(OutputError::from(err), detail::QUEUE_RUNTIME_PROMPT_FAILED);
            finish_failed_turn(shared, task, &projection, &err, true).await;
        }
        PromptEnd::TimedOut => {
            if let Err(err) = connection.request_cancel_active_prompt().await {
                tracing::debug!(error = %err, "cancel after timeout failed");
            }
            let err = OutputError::timeout(format!("prompt exceeded {timeout_ms} ms"))
                .with_origin(ErrorOrigin::Queue);
            // Timeouts are surfaced, never logged as error events.
            finish_failed_turn(shared, task, &projection, &err, false).await;
        }
    }
    TurnEnd::Completed
}

async fn finish_failed_turn(
    shared: &Arc<OwnerShared>,
    task: &OwnerTask,
    projection: &Projection,
    err: &OutputError,
    log_event: bool,
) {
    {
        let mut guard = shared.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            write_back_projection(writer, projection);
            if log_event {
                let event = writer.create_event(
                    EventDraft::new(EventPayload::Error(err.clone()))
                        .with_request_id(task.request_id.clone()),
                );
                if let Err(log_err) = writer.append_events(std::slice::from_ref(&event), true) {
                    tracing::warn!(error = %log_err, "failed to log turn error");
                }
            } else if let Err(log_err) = writer.append_events(&[], true) {
                tracing::warn!(error = %log_err, "failed to checkpoint after turn");
            }
        }
    }
    task.sink
        .send(OwnerMessage::error(Some(task.request_id.clone()), err))
        .await;
    task.sink.close().await;
}

fn write_back_projection(writer: &mut EventLogWriter, projection: &Projection) {
    let record = writer.record_mut();
    record.thread = projection.thread.clone();
    record.acpx = projection.acpx.clone();
    record.last_prompt_at = Some(Utc::now());
}

fn ensure_origin(mut err: OutputError, origin: ErrorOrigin) -> OutputError {
    if err.origin.is_none() {
        err.origin = Some(origin);
    }
    err
}

async fn handle_agent_event(
    shared: &Arc<OwnerShared>,
    task: &OwnerTask,
    projection: &mut Projection,
    event: AgentEvent,
) {
    match event {
        AgentEvent::SessionUpdate(notification) => {
            let payload = event_payload_for_update(&notification.update);
            if let Some(envelope) = shared
                .append(
                    EventDraft::new(payload).with_request_id(task.request_id.clone()),
                    false,
                )
                .await
            {
                projection.apply_event(&envelope);
            }
            task.sink
                .send(OwnerMessage::SessionUpdate { notification })
                .await;
        }
        AgentEvent::ClientOperation(operation) => {
            if let Some(envelope) = shared
                .append(
                    EventDraft::new(EventPayload::ClientOperation {
                        operation: serde_json::to_value(&operation).unwrap_or(Value::Null),
                    })
                    .with_request_id(task.request_id.clone()),
                    false,
                )
                .await
            {
                projection.apply_event(&envelope);
            }
            task.sink
                .send(OwnerMessage::ClientOperation { operation })
                .await;
        }
    }
}

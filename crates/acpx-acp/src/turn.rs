//! Turn controller: the deferred-cancel state machine.
//!
//! One prompt turn at a time per owner. Cancels arriving before the prompt
//! is active are held and applied the moment it becomes cancellable; cancels
//! while idle report `false`; at most one cancel is dispatched per turn.
//! Mode and config changes route through the live connection while a prompt
//! runs and through the caller-supplied fallback otherwise, so control
//! operations are never blocked on the absence of a prompt.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use acpx_core::{detail, OutputError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::connection::AgentConnection;
use crate::error::AcpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Starting,
    Active,
    Closing,
}

/// Surface the controller needs from the live connection during a turn.
#[async_trait]
pub trait ActiveController: Send + Sync {
    fn has_active_prompt(&self) -> bool;
    async fn request_cancel_active_prompt(&self);
    async fn set_session_mode(&self, mode_id: &str) -> Result<(), OutputError>;
    async fn set_session_config_option(
        &self,
        config_id: &str,
        value: Value,
    ) -> Result<Value, OutputError>;
}

/// Adapter binding an [`AgentConnection`] and its wire session id.
pub struct ConnectionController {
    connection: Arc<dyn AgentConnection>,
    session_id: String,
}

impl ConnectionController {
    pub fn new(connection: Arc<dyn AgentConnection>, session_id: impl Into<String>) -> Self {
        Self {
            connection,
            session_id: session_id.into(),
        }
    }
}

#[async_trait]
impl ActiveController for ConnectionController {
    fn has_active_prompt(&self) -> bool {
        self.connection.has_active_prompt()
    }

    async fn request_cancel_active_prompt(&self) {
        if let Err(err) = self.connection.request_cancel_active_prompt().await {
            tracing::warn!(error = %err, "failed to send session/cancel");
        }
    }

    async fn set_session_mode(&self, mode_id: &str) -> Result<(), OutputError> {
        self.connection
            .set_session_mode(&self.session_id, mode_id)
            .await
            .map_err(OutputError::from)
    }

    async fn set_session_config_option(
        &self,
        config_id: &str,
        value: Value,
    ) -> Result<Value, OutputError> {
        self.connection
            .set_session_config_option(&self.session_id, config_id, value)
            .await
            .map_err(OutputError::from)
    }
}

/// Control operation routed either through the live prompt connection or
/// the fallback.
#[derive(Debug, Clone)]
pub enum ControlRequest {
    SetMode { mode_id: String },
    SetConfigOption { config_id: String, value: Value },
}

/// Fallback executor for control operations when no prompt is active: opens
/// a dedicated short-lived connection, applies the operation, tears down.
pub type ControlFallback =
    Arc<dyn Fn(ControlRequest) -> BoxFuture<'static, Result<Value, OutputError>> + Send + Sync>;

struct Inner {
    state: TurnState,
    pending_cancel: bool,
    cancel_dispatched: bool,
    controller: Option<Arc<dyn ActiveController>>,
}

pub struct TurnController {
    inner: Mutex<Inner>,
    fallback: ControlFallback,
    control_timeout: Duration,
}

impl TurnController {
    pub fn new(fallback: ControlFallback, control_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: TurnState::Idle,
                pending_cancel: false,
                cancel_dispatched: false,
                controller: None,
            }),
            fallback,
            control_timeout,
        }
    }

    pub fn state(&self) -> TurnState {
        self.inner.lock().unwrap().state
    }

    /// `Idle -> Starting`. Clears any stale pending cancel.
    pub fn begin_turn(&self) -> Result<(), OutputError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            TurnState::Idle => {
                inner.state = TurnState::Starting;
                inner.pending_cancel = false;
                inner.cancel_dispatched = false;
                Ok(())
            }
            TurnState::Closing => Err(OutputError::runtime("queue owner is shutting down")
                .with_detail(detail::QUEUE_OWNER_SHUTTING_DOWN)),
            state => Err(OutputError::runtime(format!(
                "cannot begin turn in state {state:?}"
            ))),
        }
    }

    /// Bind the live connection for the current turn.
    pub fn bind_controller(&self, controller: Arc<dyn ActiveController>) {
        let mut inner = self.inner.lock().unwrap();
        inner.controller = Some(controller);
    }

    /// `Starting -> Active`. Called after `session/prompt` is on the wire
    /// but before its response is awaited.
    pub fn mark_prompt_active(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == TurnState::Starting {
            inner.state = TurnState::Active;
        }
    }

    /// Any state except `Closing` returns to `Idle`; the controller
    /// reference is dropped.
    pub fn end_turn(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != TurnState::Closing {
            inner.state = TurnState::Idle;
        }
        inner.controller = None;
        inner.pending_cancel = false;
    }

    /// Enter `Closing`; all subsequent turn/control requests are rejected.
    pub fn begin_closing(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = TurnState::Closing;
        inner.controller = None;
        inner.pending_cancel = false;
    }

    pub fn is_closing(&self) -> bool {
        self.state() == TurnState::Closing
    }

    /// Handle an IPC cancel. `false` when idle (nothing to cancel), `true`
    /// otherwise; the actual dispatch happens now (active) or when the
    /// prompt becomes active (deferred).
    pub async fn request_cancel(&self) -> bool {
        let dispatch = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                TurnState::Idle | TurnState::Closing => return false,
                TurnState::Starting => {
                    inner.pending_cancel = true;
                    None
                }
                TurnState::Active => {
                    let target = inner
                        .controller
                        .as_ref()
                        .filter(|c| c.has_active_prompt() && !inner.cancel_dispatched)
                        .cloned();
                    if target.is_some() {
                        inner.cancel_dispatched = true;
                    } else if !inner.cancel_dispatched {
                        inner.pending_cancel = true;
                    }
                    target
                }
            }
        };
        if let Some(controller) = dispatch {
            controller.request_cancel_active_prompt().await;
        }
        true
    }

    /// Dispatch a deferred cancel once the prompt is cancellable. Returns
    /// true when a cancel was sent.
    pub async fn apply_pending_cancel(&self) -> bool {
        let dispatch = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.pending_cancel || inner.cancel_dispatched {
                return false;
            }
            let target = inner
                .controller
                .as_ref()
                .filter(|c| c.has_active_prompt())
                .cloned();
            if target.is_some() {
                inner.pending_cancel = false;
                inner.cancel_dispatched = true;
            }
            target
        };
        match dispatch {
            Some(controller) => {
                controller.request_cancel_active_prompt().await;
                true
            }
            None => false,
        }
    }

    pub async fn set_session_mode(
        &self,
        mode_id: &str,
        timeout_ms: Option<u64>,
    ) -> Result<(), OutputError> {
        let routed = self.live_controller();
        let timeout = self.timeout_for(timeout_ms);
        match routed {
            Some(controller) => {
                with_deadline(timeout, controller.set_session_mode(mode_id)).await??;
            }
            None => {
                let fut = (self.fallback)(ControlRequest::SetMode {
                    mode_id: mode_id.to_string(),
                });
                with_deadline(timeout, fut).await??;
            }
        }
        Ok(())
    }

    pub async fn set_session_config_option(
        &self,
        config_id: &str,
        value: Value,
        timeout_ms: Option<u64>,
    ) -> Result<Value, OutputError> {
        let routed = self.live_controller();
        let timeout = self.timeout_for(timeout_ms);
        match routed {
            Some(controller) => {
                with_deadline(timeout, controller.set_session_config_option(config_id, value))
                    .await?
            }
            None => {
                let fut = (self.fallback)(ControlRequest::SetConfigOption {
                    config_id: config_id.to_string(),
                    value,
                });
                with_deadline(timeout, fut).await?
            }
        }
    }

    /// The live controller, only while a prompt is actually running.
    fn live_controller(&self) -> Option<Arc<dyn ActiveController>> {
        let inner = self.inner.lock().unwrap();
        inner
            .controller
            .as_ref()
            .filter(|c| c.has_active_prompt())
            .cloned()
    }

    fn timeout_for(&self, timeout_ms: Option<u64>) -> Duration {
        timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.control_timeout)
    }
}

async fn with_deadline<T>(
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
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeController {
        active: AtomicBool,
        cancels: AtomicUsize,
        modes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ActiveController for FakeController {
        fn has_active_prompt(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }
        async fn request_cancel_active_prompt(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
        async fn set_session_mode(&self, mode_id: &str) -> Result<(), OutputError> {
            self.modes.lock().unwrap().push(mode_id.to_string());
            Ok(())
        }
        async fn set_session_config_option(
            &self,
            _config_id: &str,
            value: Value,
        ) -> Result<Value, OutputError> {
            Ok(value)
        }
    }

    fn controller_with_fallback(
        fallback_hits: Arc<AtomicUsize>,
    ) -> TurnController {
        let fallback: ControlFallback = Arc::new(move |_req| {
            let hits = fallback_hits.clone();
            Box::pin(async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            })
        });
        TurnController::new(fallback, Duration::from_millis(500))
    }

    #[tokio::test]
    async fn cancel_while_idle_reports_false() {
        let turn = controller_with_fallback(Arc::new(AtomicUsize::new(0)));
        assert!(!turn.request_cancel().await);
    }

    #[tokio::test]
    async fn cancel_before_active_is_deferred_then_applied_once() {
        let turn = controller_with_fallback(Arc::new(AtomicUsize::new(0)));
        let fake = Arc::new(FakeController::default());

        turn.begin_turn().unwrap();
        turn.bind_controller(fake.clone());
        // Prompt not yet on the wire: cancel must defer.
        assert!(turn.request_cancel().await);
        assert_eq!(fake.cancels.load(Ordering::SeqCst), 0);

        fake.active.store(true, Ordering::SeqCst);
        turn.mark_prompt_active();
        assert!(turn.apply_pending_cancel().await);
        assert_eq!(fake.cancels.load(Ordering::SeqCst), 1);

        // Second cancel in the same turn does not dispatch again.
        assert!(turn.request_cancel().await);
        assert!(!turn.apply_pending_cancel().await);
        assert_eq!(fake.cancels.load(Ordering::SeqCst), 1);

        turn.end_turn();
        assert_eq!(turn.state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn cancel_while_active_dispatches_immediately() {
        let turn = controller_with_fallback(Arc::new(AtomicUsize::new(0)));
        let fake = Arc::new(FakeController::default());
        fake.active.store(true, Ordering::SeqCst);

        turn.begin_turn().unwrap();
        turn.bind_controller(fake.clone());
        turn.mark_prompt_active();
        assert!(turn.request_cancel().await);
        assert_eq!(fake.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn begin_turn_requires_idle_and_rejects_closing() {
        let turn = controller_with_fallback(Arc::new(AtomicUsize::new(0)));
        turn.begin_turn().unwrap();
        assert!(turn.begin_turn().is_err());
        turn.end_turn();
        turn.begin_closing();
        let err = turn.begin_turn().unwrap_err();
        assert_eq!(
            err.detail_code.as_deref(),
            Some(detail::QUEUE_OWNER_SHUTTING_DOWN)
        );
        // end_turn does not leave Closing.
        turn.end_turn();
        assert_eq!(turn.state(), TurnState::Closing);
    }

    #[tokio::test]
    async fn control_ops_route_live_when_prompt_active_else_fallback() {
        let hits = Arc::new(AtomicUsize::new(0));
        let turn = controller_with_fallback(hits.clone());
        let fake = Arc::new(FakeController::default());

        // Idle: fallback.
        turn.set_session_mode("plan", None).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Active prompt: routed through the live connection.
        turn.begin_turn().unwrap();
        turn.bind_controller(fake.clone());
        fake.active.store(true, Ordering::SeqCst);
        turn.mark_prompt_active();
        turn.set_session_mode("code", None).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(fake.modes.lock().unwrap().as_slice(), ["code"]);
    }
}

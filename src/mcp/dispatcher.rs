//! Tool-call dispatch: validation, policy enforcement, and routing.
//!
//! Every model-issued tool call passes through [`ToolDispatcher::dispatch`],
//! which validates the request against the registry before any network
//! interaction, applies per-tool concurrency and queue limits, and retries
//! transient failures with exponential backoff. Failures come back as
//! structured results, never as panics or raw protocol errors.

use crate::core::provider::ToolCallRequest;
use crate::mcp::error::{ToolCallError, ToolErrorKind};
use crate::mcp::events::{AuditEvent, AuditSink};
use crate::mcp::permissions::ToolPermissionStore;
use crate::mcp::registry::ToolRegistry;
use crate::mcp::session::ServerSession;
use crate::mcp::validate::validate_arguments;
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const RETRY_BACKOFF_BASE_MS: u64 = 250;

/// Sessions keyed by lowercase server id, shared with the engine.
pub type SessionMap = Arc<RwLock<HashMap<String, Arc<ServerSession>>>>;

/// Normalized outcome of one dispatched tool call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    /// The serialized call result, byte-for-byte as the session produced
    /// it.
    Success { payload: String },
    Failure(ToolCallError),
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success { .. })
    }

    pub fn error(&self) -> Option<&ToolCallError> {
        match self {
            ToolOutcome::Success { .. } => None,
            ToolOutcome::Failure(err) => Some(err),
        }
    }

    /// Renders the outcome as conversation data for the next model turn.
    /// Success payloads pass through untouched; failures serialize to a
    /// structure the model can reason about.
    pub fn as_turn_content(&self) -> String {
        match self {
            ToolOutcome::Success { payload } => payload.clone(),
            ToolOutcome::Failure(err) => serde_json::to_string(err)
                .unwrap_or_else(|_| format!("{{\"kind\":\"{}\"}}", err.kind)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub call_id: String,
    pub outcome: ToolOutcome,
}

impl ToolCallResult {
    pub fn success(call_id: &str, payload: String) -> Self {
        Self {
            call_id: call_id.to_string(),
            outcome: ToolOutcome::Success { payload },
        }
    }

    pub fn failure(call_id: &str, error: ToolCallError) -> Self {
        Self {
            call_id: call_id.to_string(),
            outcome: ToolOutcome::Failure(error),
        }
    }
}

/// Tunable dispatch behavior; see the configuration surface for defaults.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub dispatch_timeout: Duration,
    pub retry_count: u32,
    /// `None` means unlimited (bounded only by the owning session).
    pub per_tool_concurrency_cap: Option<usize>,
    pub max_queue_depth: usize,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            dispatch_timeout: Duration::from_secs(30),
            retry_count: 2,
            per_tool_concurrency_cap: None,
            max_queue_depth: 32,
        }
    }
}

struct ToolGate {
    semaphore: Arc<Semaphore>,
    queued: AtomicUsize,
}

/// Routes validated tool calls to their owning sessions under policy.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    sessions: SessionMap,
    policy: DispatchPolicy,
    gates: StdMutex<HashMap<String, Arc<ToolGate>>>,
    permissions: StdMutex<ToolPermissionStore>,
    /// Servers whose calls bypass the permission gate.
    yolo_servers: HashSet<String>,
    audit: AuditSink,
}

/// Runs `operation` unless `cancel` fires first. Cancellation releases the
/// caller's wait without touching the underlying transport.
pub async fn run_cancellable<F, T>(
    cancel: Option<&CancellationToken>,
    operation: F,
) -> Result<T, ToolCallError>
where
    F: Future<Output = Result<T, ToolCallError>>,
{
    if let Some(token) = cancel {
        tokio::select! {
            _ = token.cancelled() => Err(ToolCallError::new(
                ToolErrorKind::NonRecoverable,
                "Tool call interrupted.",
            )),
            result = operation => result,
        }
    } else {
        operation.await
    }
}

impl ToolDispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        sessions: SessionMap,
        policy: DispatchPolicy,
        yolo_servers: HashSet<String>,
        audit: AuditSink,
    ) -> Self {
        Self {
            registry,
            sessions,
            policy,
            gates: StdMutex::new(HashMap::new()),
            permissions: StdMutex::new(ToolPermissionStore::default()),
            yolo_servers,
            audit,
        }
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// Records a permission decision for later dispatches.
    pub fn record_permission(
        &self,
        server_id: &str,
        tool_name: &str,
        decision: crate::mcp::permissions::ToolPermissionDecision,
    ) {
        self.permissions
            .lock()
            .expect("permission lock poisoned")
            .record(server_id, tool_name, decision);
    }

    pub fn clear_server_permissions(&self, server_id: &str) {
        self.permissions
            .lock()
            .expect("permission lock poisoned")
            .clear_server(server_id);
    }

    /// Validates, gates, and routes one tool call, returning a normalized
    /// result. Never panics and never surfaces a raw transport error.
    pub async fn dispatch(
        &self,
        request: &ToolCallRequest,
        cancel: Option<&CancellationToken>,
    ) -> ToolCallResult {
        // Validation happens before any network interaction; untrusted
        // model output must never reach a server unchecked.
        let Some(tool) = self.registry.lookup(&request.tool_name) else {
            let error = ToolCallError::unknown_tool(&request.tool_name);
            self.emit_attempt(request, "", 1, Some(error.kind));
            return ToolCallResult::failure(&request.call_id, error);
        };
        let server_id = tool.descriptor.server_id.clone();

        if let Err(error) = validate_arguments(&tool.validator, request.arguments.as_ref()) {
            self.emit_attempt(request, &server_id, 1, Some(error.kind));
            return ToolCallResult::failure(&request.call_id, error);
        }

        if !self.permitted(&server_id, &request.tool_name) {
            let error = ToolCallError::new(
                ToolErrorKind::PermissionDenied,
                format!("Tool '{}' is blocked for this session.", request.tool_name),
            );
            self.emit_attempt(request, &server_id, 1, Some(error.kind));
            return ToolCallResult::failure(&request.call_id, error);
        }

        let _permit = match self.acquire_slot(&request.tool_name, cancel).await {
            Ok(permit) => permit,
            Err(error) => {
                self.emit_attempt(request, &server_id, 1, Some(error.kind));
                return ToolCallResult::failure(&request.call_id, error);
            }
        };

        match self.invoke_with_retries(request, &server_id, cancel).await {
            Ok(payload) => ToolCallResult::success(&request.call_id, payload),
            Err(error) => ToolCallResult::failure(&request.call_id, error),
        }
    }

    async fn invoke_with_retries(
        &self,
        request: &ToolCallRequest,
        server_id: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<String, ToolCallError> {
        let attempts = self.policy.retry_count.saturating_add(1);
        let mut last_error =
            ToolCallError::new(ToolErrorKind::NonRecoverable, "Dispatch never attempted.");

        for attempt in 1..=attempts {
            let outcome = run_cancellable(cancel, self.invoke_once(request, server_id)).await;
            match outcome {
                Ok(payload) => {
                    self.emit_attempt(request, server_id, attempt, None);
                    return Ok(payload);
                }
                Err(error) => {
                    self.emit_attempt(request, server_id, attempt, Some(error.kind));
                    let retryable = error.is_retryable() && attempt < attempts;
                    last_error = error;
                    if !retryable {
                        break;
                    }
                    let backoff = Duration::from_millis(
                        RETRY_BACKOFF_BASE_MS.saturating_mul(1u64 << (attempt - 1).min(16)),
                    );
                    debug!(
                        call_id = %request.call_id,
                        tool_name = %request.tool_name,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Retrying tool call after transient failure"
                    );
                    if run_cancellable(cancel, async {
                        tokio::time::sleep(backoff).await;
                        Ok(())
                    })
                    .await
                    .is_err()
                    {
                        return Err(ToolCallError::new(
                            ToolErrorKind::NonRecoverable,
                            "Tool call interrupted.",
                        ));
                    }
                }
            }
        }

        Err(last_error)
    }

    async fn invoke_once(
        &self,
        request: &ToolCallRequest,
        server_id: &str,
    ) -> Result<String, ToolCallError> {
        // Re-resolved each attempt so a reconnect between retries is
        // picked up.
        let session = {
            let sessions = self.sessions.read().expect("session map lock poisoned");
            sessions.get(&server_id.to_ascii_lowercase()).cloned()
        };
        let Some(session) = session else {
            return Err(ToolCallError::new(
                ToolErrorKind::ConnectionClosed,
                format!("Server '{server_id}' is no longer connected."),
            ));
        };
        session.invoke(request, self.policy.dispatch_timeout).await
    }

    fn permitted(&self, server_id: &str, tool_name: &str) -> bool {
        if self.yolo_servers.contains(&server_id.to_ascii_lowercase()) {
            return true;
        }
        self.permissions
            .lock()
            .expect("permission lock poisoned")
            .permits(server_id, tool_name)
    }

    /// Takes a concurrency slot for the tool, queueing when the cap is
    /// busy. Queue growth is bounded: beyond `max_queue_depth` waiting
    /// calls the dispatch fails immediately with Overloaded.
    async fn acquire_slot(
        &self,
        tool_name: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<tokio::sync::OwnedSemaphorePermit>, ToolCallError> {
        let Some(cap) = self.policy.per_tool_concurrency_cap else {
            return Ok(None);
        };

        let gate = {
            let mut gates = self.gates.lock().expect("gate lock poisoned");
            gates
                .entry(tool_name.to_string())
                .or_insert_with(|| {
                    Arc::new(ToolGate {
                        semaphore: Arc::new(Semaphore::new(cap.max(1))),
                        queued: AtomicUsize::new(0),
                    })
                })
                .clone()
        };

        if let Ok(permit) = gate.semaphore.clone().try_acquire_owned() {
            return Ok(Some(permit));
        }

        if gate.queued.fetch_add(1, Ordering::SeqCst) >= self.policy.max_queue_depth {
            gate.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(ToolCallError::new(
                ToolErrorKind::Overloaded,
                format!("Tool '{tool_name}' queue is full."),
            ));
        }

        let semaphore = gate.semaphore.clone();
        let acquired = run_cancellable(cancel, async move {
            semaphore.acquire_owned().await.map_err(|_| {
                ToolCallError::new(ToolErrorKind::NonRecoverable, "Tool gate closed.")
            })
        })
        .await;
        gate.queued.fetch_sub(1, Ordering::SeqCst);
        acquired.map(Some)
    }

    fn emit_attempt(
        &self,
        request: &ToolCallRequest,
        server_id: &str,
        attempt: u32,
        error: Option<ToolErrorKind>,
    ) {
        self.audit.emit(AuditEvent::DispatchAttempt {
            call_id: request.call_id.clone(),
            tool_name: request.tool_name.clone(),
            server_id: server_id.to_string(),
            attempt,
            error,
            timestamp: Utc::now(),
        });
    }
}

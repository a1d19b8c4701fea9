//! One live connection to an MCP server.
//!
//! A session owns its transport, performs the handshake, caches the tool
//! catalog, and correlates concurrent in-flight requests with their
//! responses. Callers of [`ServerSession::invoke`] suspend on a oneshot
//! channel until the receive loop routes the matching response back.

use crate::core::config::data::McpServerConfig;
use crate::core::provider::ToolCallRequest;
use crate::mcp::error::{ToolCallError, ToolErrorKind, TransportError};
use crate::mcp::protocol::{
    is_supported_protocol_version, parse_call_tool, parse_initialize_result, parse_list_tools,
    requested_protocol_version,
};
use crate::mcp::transport::{
    Frame, McpTransport, McpTransportKind, StdioTransport, StreamableHttpTransport,
};
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::{
    CallToolRequestParams, ClientCapabilities, Implementation, InitializeRequestParams,
    InitializeResult, PaginatedRequestParams, RequestId, RpcError, Tool,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Largest tool catalog accepted from one server; longer lists are
/// truncated while following pagination cursors.
pub const MCP_MAX_TOOL_LIST: usize = 100;

const SETUP_REQUEST_TIMEOUT_SECONDS: u64 = 30;

/// Consecutive invoke timeouts before the session assumes protocol desync.
const DESYNC_TIMEOUT_THRESHOLD: u32 = 2;

/// Lifecycle of a server session.
///
/// Degraded sessions stop accepting new calls but let outstanding ones
/// finish; Closed is terminal and triggers deregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Ready,
    Degraded,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Ready => "ready",
            SessionState::Degraded => "degraded",
            SessionState::Closed => "closed",
        }
    }
}

/// Terminal notice sent to the owning engine when a session closes, so its
/// tools can be deregistered.
#[derive(Debug, Clone)]
pub struct SessionClosed {
    pub server_id: String,
    pub reason: String,
}

type PendingMap = Arc<StdMutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;

/// Removes the correlation entry when its waiter goes away, so abandoned
/// calls (timeout, cancellation) do not leak map entries.
struct PendingEntryGuard {
    pending: PendingMap,
    id: RequestId,
}

impl Drop for PendingEntryGuard {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

pub struct ServerSession {
    server_id: String,
    transport: Arc<dyn McpTransport>,
    state: Arc<StdMutex<SessionState>>,
    pending: PendingMap,
    next_request_id: AtomicI64,
    consecutive_timeouts: AtomicU32,
    server_details: StdMutex<Option<InitializeResult>>,
    cached_tools: StdMutex<Option<Vec<Tool>>>,
    allowed_tools: Option<Vec<String>>,
    close_notified: Arc<AtomicBool>,
    closed_tx: Option<mpsc::UnboundedSender<SessionClosed>>,
}

impl ServerSession {
    /// Builds the transport named by config and brings the session up to
    /// Ready. Handshake failures close the session and report why.
    pub async fn connect(
        config: &McpServerConfig,
        closed_tx: Option<mpsc::UnboundedSender<SessionClosed>>,
    ) -> Result<Arc<Self>, ToolCallError> {
        let kind = McpTransportKind::from_config(config)
            .map_err(|message| ToolCallError::new(ToolErrorKind::NonRecoverable, message))?;
        let transport: Arc<dyn McpTransport> = match kind {
            McpTransportKind::Stdio => Arc::new(StdioTransport::spawn(&config.id, config)?),
            McpTransportKind::StreamableHttp => {
                Arc::new(StreamableHttpTransport::connect(&config.id, config)?)
            }
        };
        Self::establish(config, transport, closed_tx).await
    }

    /// Handshakes over an already-built transport. Split out so tests can
    /// drive a session over a scripted transport.
    pub(crate) async fn establish(
        config: &McpServerConfig,
        transport: Arc<dyn McpTransport>,
        closed_tx: Option<mpsc::UnboundedSender<SessionClosed>>,
    ) -> Result<Arc<Self>, ToolCallError> {
        let session = Arc::new(Self {
            server_id: config.id.clone(),
            transport,
            state: Arc::new(StdMutex::new(SessionState::Connecting)),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            next_request_id: AtomicI64::new(0),
            consecutive_timeouts: AtomicU32::new(0),
            server_details: StdMutex::new(None),
            cached_tools: StdMutex::new(None),
            allowed_tools: config.allowed_tools.clone(),
            close_notified: Arc::new(AtomicBool::new(false)),
            closed_tx,
        });

        session.spawn_receive_loop();
        session.set_state(SessionState::Handshaking);

        match session.handshake(config).await {
            Ok(()) => {
                session.set_state(SessionState::Ready);
                Ok(session)
            }
            Err(err) => {
                session.close("handshake failed").await;
                Err(err)
            }
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock poisoned")
    }

    pub fn server_details(&self) -> Option<InitializeResult> {
        self.server_details
            .lock()
            .expect("session details lock poisoned")
            .clone()
    }

    pub fn cached_tools(&self) -> Option<Vec<Tool>> {
        self.cached_tools
            .lock()
            .expect("session tools lock poisoned")
            .clone()
    }

    async fn handshake(&self, config: &McpServerConfig) -> Result<(), ToolCallError> {
        let params = client_details_for(config);
        let response = self
            .request(
                RequestFromClient::InitializeRequest(params),
                setup_timeout(),
            )
            .await?;
        let result = parse_initialize_result(response)?;

        if !is_supported_protocol_version(config, &result.protocol_version) {
            return Err(ToolCallError::new(
                ToolErrorKind::NonRecoverable,
                format!(
                    "No mutually supported protocol version: server offered {}.",
                    result.protocol_version
                ),
            ));
        }
        self.transport.note_protocol_version(&result.protocol_version);
        debug!(
            server_id = %self.server_id,
            protocol_version = %result.protocol_version,
            server_name = %result.server_info.name,
            "MCP handshake complete"
        );
        *self
            .server_details
            .lock()
            .expect("session details lock poisoned") = Some(result);

        self.send_notification(NotificationFromClient::InitializedNotification(None))
            .await
    }

    /// Fetches the server's tool catalog, following pagination cursors and
    /// truncating at [`MCP_MAX_TOOL_LIST`]. Caches the filtered result.
    pub async fn list_tools(&self) -> Result<Vec<Tool>, ToolCallError> {
        self.ensure_accepting_calls()?;

        let mut tools: Vec<Tool> = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.take().map(|cursor| PaginatedRequestParams {
                cursor: Some(cursor),
                meta: None,
            });
            let response = self
                .request(RequestFromClient::ListToolsRequest(params), setup_timeout())
                .await?;
            let page = parse_list_tools(response)?;
            tools.extend(page.tools);
            if tools.len() >= MCP_MAX_TOOL_LIST {
                tools.truncate(MCP_MAX_TOOL_LIST);
                break;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if let Some(allowed) = &self.allowed_tools {
            tools.retain(|tool| allowed.iter().any(|name| name == &tool.name));
        }

        *self
            .cached_tools
            .lock()
            .expect("session tools lock poisoned") = Some(tools.clone());
        Ok(tools)
    }

    /// Sends one tool call and suspends until the correlated response
    /// arrives or `timeout` elapses. Returns the result payload exactly as
    /// serialized, so it can be folded into the conversation byte-for-byte.
    pub async fn invoke(
        &self,
        request: &ToolCallRequest,
        timeout: std::time::Duration,
    ) -> Result<String, ToolCallError> {
        self.ensure_accepting_calls()?;

        let mut params = CallToolRequestParams::new(&request.tool_name);
        if let Some(arguments) = request.arguments.clone() {
            params = params.with_arguments(arguments);
        }

        let response = self
            .request(RequestFromClient::CallToolRequest(params), timeout)
            .await?;
        let result = parse_call_tool(response)?;
        serde_json::to_string(&result)
            .map_err(|err| ToolCallError::new(ToolErrorKind::ProtocolViolation, err.to_string()))
    }

    /// Tears the session down. Outstanding calls resolve to
    /// ConnectionClosed; the terminal notice is sent exactly once.
    pub async fn close(&self, reason: &str) {
        self.set_state(SessionState::Closed);
        self.transport.close().await;
        self.pending.lock().expect("pending lock poisoned").clear();
        self.notify_closed(reason);
    }

    fn ensure_accepting_calls(&self) -> Result<(), ToolCallError> {
        match self.state() {
            SessionState::Ready => Ok(()),
            SessionState::Degraded => Err(ToolCallError::new(
                ToolErrorKind::NonRecoverable,
                format!(
                    "Session '{}' is degraded and not accepting new calls.",
                    self.server_id
                ),
            )),
            SessionState::Closed => Err(ToolCallError::new(
                ToolErrorKind::ConnectionClosed,
                format!("Session '{}' is closed.", self.server_id),
            )),
            SessionState::Connecting | SessionState::Handshaking => Err(ToolCallError::new(
                ToolErrorKind::TransportError,
                format!("Session '{}' is not ready yet.", self.server_id),
            )),
        }
    }

    async fn request(
        &self,
        request: RequestFromClient,
        timeout: std::time::Duration,
    ) -> Result<ServerMessage, ToolCallError> {
        let request_id = self.next_request_id();
        debug!(server_id = %self.server_id, request_id = ?request_id, "Sending MCP request");
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id.clone()),
        )
        .map_err(|err| ToolCallError::new(ToolErrorKind::TransportError, err.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(request_id.clone(), tx);
        let _entry_guard = PendingEntryGuard {
            pending: self.pending.clone(),
            id: request_id.clone(),
        };

        self.transport.send(&message).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => {
                self.consecutive_timeouts.store(0, Ordering::SeqCst);
                Ok(message)
            }
            Ok(Err(_)) => Err(ToolCallError::new(
                ToolErrorKind::ConnectionClosed,
                format!("Connection to '{}' closed mid-call.", self.server_id),
            )),
            Err(_) => {
                let strikes = self.consecutive_timeouts.fetch_add(1, Ordering::SeqCst) + 1;
                if strikes >= DESYNC_TIMEOUT_THRESHOLD && self.state() == SessionState::Ready {
                    warn!(
                        server_id = %self.server_id,
                        strikes,
                        "Consecutive timeouts; marking session degraded"
                    );
                    self.set_state(SessionState::Degraded);
                }
                Err(ToolCallError::timeout(format!(
                    "No response from '{}' within {}ms.",
                    self.server_id,
                    timeout.as_millis()
                )))
            }
        }
    }

    async fn send_notification(
        &self,
        notification: NotificationFromClient,
    ) -> Result<(), ToolCallError> {
        let message = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(notification),
            None,
        )
        .map_err(|err| ToolCallError::new(ToolErrorKind::TransportError, err.to_string()))?;
        self.transport.send(&message).await.map_err(Into::into)
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::SeqCst))
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock().expect("session state lock poisoned");
        if *state != SessionState::Closed {
            *state = next;
        }
    }

    fn notify_closed(&self, reason: &str) {
        if self.close_notified.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = &self.closed_tx {
            let _ = tx.send(SessionClosed {
                server_id: self.server_id.clone(),
                reason: reason.to_string(),
            });
        }
    }

    fn spawn_receive_loop(self: &Arc<Self>) {
        let session = self.clone();
        tokio::spawn(async move {
            let reason = loop {
                match session.transport.receive().await {
                    Ok(Frame::Message(message)) => session.dispatch_message(message).await,
                    Ok(Frame::Malformed(detail)) => {
                        warn!(
                            server_id = %session.server_id,
                            detail = %detail,
                            "Protocol violation; marking session degraded"
                        );
                        if session.state() == SessionState::Ready {
                            session.set_state(SessionState::Degraded);
                        }
                    }
                    Err(TransportError::Closed) => break "connection closed".to_string(),
                    Err(err) => break err.to_string(),
                }
            };
            debug!(server_id = %session.server_id, reason = %reason, "Session receive loop ended");
            session.set_state(SessionState::Closed);
            session
                .pending
                .lock()
                .expect("pending lock poisoned")
                .clear();
            session.notify_closed(&reason);
        });
    }

    async fn dispatch_message(&self, message: ServerMessage) {
        match &message {
            ServerMessage::Response(response) => {
                let id = response.id.clone();
                let waiter = self.pending.lock().expect("pending lock poisoned").remove(&id);
                if let Some(tx) = waiter {
                    let _ = tx.send(message);
                } else {
                    warn!(
                        server_id = %self.server_id,
                        response_id = ?id,
                        "Discarding response with unknown correlation id"
                    );
                }
            }
            ServerMessage::Error(error) => {
                let id = error.id.clone();
                match id {
                    Some(id) => {
                        let waiter =
                            self.pending.lock().expect("pending lock poisoned").remove(&id);
                        if let Some(tx) = waiter {
                            let _ = tx.send(message);
                        } else {
                            warn!(
                                server_id = %self.server_id,
                                error_id = ?id,
                                "Discarding error with unknown correlation id"
                            );
                        }
                    }
                    None => warn!(
                        server_id = %self.server_id,
                        code = error.error.code,
                        message = %error.error.message,
                        "Server reported an uncorrelated error"
                    ),
                }
            }
            ServerMessage::Request(request) => {
                // Server-initiated requests are outside this client's
                // capabilities; refuse politely instead of going silent.
                debug!(
                    server_id = %self.server_id,
                    method = %request.method(),
                    "Refusing unsupported server-initiated request"
                );
                let error = RpcError::method_not_found()
                    .with_message("Client does not service server-initiated requests.");
                if let Ok(reply) = ClientMessage::from_message(
                    MessageFromClient::Error(error),
                    Some(request.request_id().clone()),
                ) {
                    let _ = self.transport.send(&reply).await;
                }
            }
            ServerMessage::Notification(_) => {
                debug!(server_id = %self.server_id, "Received server notification");
            }
        }
    }
}

fn setup_timeout() -> std::time::Duration {
    std::time::Duration::from_secs(SETUP_REQUEST_TIMEOUT_SECONDS)
}

fn client_details_for(config: &McpServerConfig) -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "tandem".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Tandem MCP Client".to_string()),
            description: Some("Tandem tool orchestration runtime".to_string()),
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version: requested_protocol_version(config),
    }
}

//! Assembles the shared server pool and hands out conversations.
//!
//! One engine owns one set of MCP sessions, one tool registry, and one
//! dispatcher; conversations share the pool but each keeps its own
//! transcript. Initialization and teardown are explicit (connect on
//! startup, close everything on shutdown) rather than ambient state.

use crate::core::config::data::Config;
use crate::core::conversation::Conversation;
use crate::core::provider::ChatProvider;
use crate::mcp::dispatcher::{DispatchPolicy, SessionMap, ToolDispatcher};
use crate::mcp::error::ToolCallError;
use crate::mcp::events::{AuditEvent, AuditSink};
use crate::mcp::registry::{ToolDescriptor, ToolRegistry};
use crate::mcp::session::{ServerSession, SessionClosed, SessionState};
use chrono::Utc;
use futures_util::{stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How many servers are brought up at once during startup.
const MCP_STARTUP_CONCURRENCY_LIMIT: usize = 3;

/// The shared orchestration pool.
pub struct Engine {
    config: Config,
    registry: Arc<ToolRegistry>,
    sessions: SessionMap,
    dispatcher: Arc<ToolDispatcher>,
    audit_rx: StdMutex<Option<mpsc::UnboundedReceiver<AuditEvent>>>,
    audit: AuditSink,
    closed_tx: mpsc::UnboundedSender<SessionClosed>,
}

impl Engine {
    pub fn new(config: Config) -> Arc<Self> {
        let (audit_tx, audit_rx) = mpsc::unbounded_channel();
        let audit = AuditSink::new(audit_tx);
        let registry = Arc::new(ToolRegistry::new(audit.clone()));
        let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));

        let policy = DispatchPolicy {
            dispatch_timeout: Duration::from_millis(config.orchestrator.dispatch_timeout_ms),
            retry_count: config.orchestrator.retry_count,
            per_tool_concurrency_cap: config.orchestrator.per_tool_concurrency_cap,
            max_queue_depth: config.orchestrator.max_queue_depth,
        };
        let yolo_servers: HashSet<String> = config
            .mcp_servers
            .iter()
            .filter(|server| server.is_yolo())
            .map(|server| server.id.to_ascii_lowercase())
            .collect();
        let dispatcher = Arc::new(ToolDispatcher::new(
            registry.clone(),
            sessions.clone(),
            policy,
            yolo_servers,
            audit.clone(),
        ));

        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            config,
            registry,
            sessions,
            dispatcher,
            audit_rx: StdMutex::new(Some(audit_rx)),
            audit,
            closed_tx,
        });
        engine.spawn_close_monitor(closed_rx);
        engine
    }

    /// Connects every enabled server, a few at a time. A server that fails
    /// to come up is logged and skipped; the rest of the pool still forms.
    pub async fn connect_all(&self) {
        let configs: Vec<_> = self.config.enabled_servers().cloned().collect();
        let closed_tx = self.closed_tx.clone();

        let outcomes: Vec<_> = stream::iter(configs)
            .map(|server_config| {
                let closed_tx = closed_tx.clone();
                async move {
                    let server_id = server_config.id.clone();
                    let result =
                        ServerSession::connect(&server_config, Some(closed_tx.clone())).await;
                    (server_id, result)
                }
            })
            .buffer_unordered(MCP_STARTUP_CONCURRENCY_LIMIT)
            .collect()
            .await;

        for (server_id, result) in outcomes {
            match result {
                Ok(session) => self.adopt_session(session).await,
                Err(err) => {
                    warn!(server_id = %server_id, error = %err, "MCP server failed to connect");
                }
            }
        }
    }

    /// Connects (or reconnects) one configured server and registers its
    /// tools. An existing session for the id is closed first.
    pub async fn connect_server(&self, id: &str) -> Result<(), ToolCallError> {
        let server_config = self
            .config
            .find_server(id)
            .cloned()
            .ok_or_else(|| {
                ToolCallError::new(
                    crate::mcp::error::ToolErrorKind::NonRecoverable,
                    format!("Unknown MCP server: {id}"),
                )
            })?;

        self.disconnect_server(id).await;
        let session = ServerSession::connect(&server_config, Some(self.closed_tx.clone())).await?;
        self.adopt_session(session).await;
        Ok(())
    }

    /// Re-fetches one server's catalog and swaps its registry contribution
    /// atomically.
    pub async fn refresh_tools(&self, id: &str) -> Result<(), ToolCallError> {
        let session = self.session(id).ok_or_else(|| {
            ToolCallError::new(
                crate::mcp::error::ToolErrorKind::ConnectionClosed,
                format!("Server '{id}' is not connected."),
            )
        })?;
        let tools = session.list_tools().await?;
        self.registry.register(session.server_id(), &tools);
        Ok(())
    }

    /// Closes one session and removes its tools.
    pub async fn disconnect_server(&self, id: &str) {
        let session = {
            let mut sessions = self.sessions.write().expect("session map lock poisoned");
            sessions.remove(&id.to_ascii_lowercase())
        };
        if let Some(session) = session {
            session.close("disconnect requested").await;
        }
        self.registry.deregister(id);
        self.dispatcher.clear_server_permissions(id);
    }

    /// Tears the whole pool down: every session closed, every tool
    /// deregistered.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = {
            let sessions = self.sessions.read().expect("session map lock poisoned");
            sessions.keys().cloned().collect()
        };
        for id in ids {
            self.disconnect_server(&id).await;
        }
    }

    /// A new conversation over the shared pool. The transcript is isolated
    /// per conversation; the sessions and registry are not.
    pub fn new_conversation(&self, provider: Arc<dyn ChatProvider>) -> Conversation {
        Conversation::new(
            provider,
            self.dispatcher.clone(),
            self.config.orchestrator.max_tool_rounds_per_turn,
        )
    }

    pub fn dispatcher(&self) -> Arc<ToolDispatcher> {
        self.dispatcher.clone()
    }

    pub fn registry(&self) -> Arc<ToolRegistry> {
        self.registry.clone()
    }

    /// Tools currently advertised to the model.
    pub fn visible_tools(&self) -> Vec<ToolDescriptor> {
        self.registry.visible_tools()
    }

    /// Connection states by server id, for status surfaces.
    pub fn server_states(&self) -> Vec<(String, SessionState)> {
        let sessions = self.sessions.read().expect("session map lock poisoned");
        let mut states: Vec<(String, SessionState)> = sessions
            .values()
            .map(|session| (session.server_id().to_string(), session.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Takes the audit event stream. There is one consumer; a second call
    /// returns `None`.
    pub fn take_audit_events(&self) -> Option<mpsc::UnboundedReceiver<AuditEvent>> {
        self.audit_rx
            .lock()
            .expect("audit receiver lock poisoned")
            .take()
    }

    pub fn session(&self, id: &str) -> Option<Arc<ServerSession>> {
        let sessions = self.sessions.read().expect("session map lock poisoned");
        sessions.get(&id.to_ascii_lowercase()).cloned()
    }

    async fn adopt_session(&self, session: Arc<ServerSession>) {
        let server_id = session.server_id().to_string();
        match session.list_tools().await {
            Ok(tools) => {
                debug!(server_id = %server_id, tool_count = tools.len(), "Registering server tools");
                self.registry.register(&server_id, &tools);
            }
            Err(err) => {
                warn!(server_id = %server_id, error = %err, "Tool listing failed; server joins with no tools");
                self.registry.register(&server_id, &[]);
            }
        }
        let mut sessions = self.sessions.write().expect("session map lock poisoned");
        sessions.insert(server_id.to_ascii_lowercase(), session);
    }

    fn spawn_close_monitor(&self, mut closed_rx: mpsc::UnboundedReceiver<SessionClosed>) {
        let registry = self.registry.clone();
        let sessions = self.sessions.clone();
        let dispatcher = self.dispatcher.clone();
        let audit = self.audit.clone();
        tokio::spawn(async move {
            while let Some(notice) = closed_rx.recv().await {
                debug!(
                    server_id = %notice.server_id,
                    reason = %notice.reason,
                    "Session closed; deregistering its tools"
                );
                registry.deregister(&notice.server_id);
                dispatcher.clear_server_permissions(&notice.server_id);
                {
                    let mut sessions = sessions.write().expect("session map lock poisoned");
                    sessions.remove(&notice.server_id.to_ascii_lowercase());
                }
                audit.emit(AuditEvent::SessionClosed {
                    server_id: notice.server_id,
                    reason: notice.reason,
                    timestamp: Utc::now(),
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::data::McpServerConfig;
    use crate::mcp::testing::{schema_tool, ScriptedTransport};
    use crate::mcp::transport::McpTransport;
    use std::time::Duration;

    fn stdio_server(id: &str, command: &str) -> McpServerConfig {
        let mut config = McpServerConfig::stub(id);
        config.transport = Some("stdio".to_string());
        config.base_url = None;
        config.command = Some(command.to_string());
        config
    }

    #[tokio::test]
    async fn connect_all_attempts_each_enabled_server_when_all_fail() {
        let mut config = Config::default();
        config
            .mcp_servers
            .push(stdio_server("alpha", "/definitely-missing-command"));
        config
            .mcp_servers
            .push(stdio_server("beta", "/definitely-missing-command-2"));

        let engine = Engine::new(config);
        engine.connect_all().await;

        assert!(engine.server_states().is_empty());
        assert!(engine.visible_tools().is_empty());
    }

    #[tokio::test]
    async fn disabled_servers_are_skipped_at_startup() {
        let mut config = Config::default();
        let mut parked = stdio_server("parked", "/definitely-missing-command");
        parked.enabled = Some(false);
        config.mcp_servers.push(parked);

        let engine = Engine::new(config);
        engine.connect_all().await;

        assert!(engine.server_states().is_empty());
    }

    #[tokio::test]
    async fn a_dying_session_is_deregistered_by_the_close_monitor() {
        let engine = Engine::new(Config::default());

        let transport = Arc::new(ScriptedTransport::with_handshake(&[schema_tool("search")]));
        let session = ServerSession::establish(
            &McpServerConfig::stub("alpha"),
            transport.clone(),
            Some(engine.closed_tx.clone()),
        )
        .await
        .expect("session should connect");
        engine.adopt_session(session).await;
        assert!(engine.registry().lookup("search").is_some());

        // Server goes away: the transport closes, the session ends, and
        // the monitor must drop its tools from the registry.
        transport.close().await;
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if engine.registry().lookup("search").is_none() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("registry should drop the dead server's tools");

        assert!(engine.session("alpha").is_none());
    }

    #[tokio::test]
    async fn shutdown_closes_every_session() {
        let engine = Engine::new(Config::default());

        let transport = Arc::new(ScriptedTransport::with_handshake(&[schema_tool("search")]));
        let session = ServerSession::establish(
            &McpServerConfig::stub("alpha"),
            transport,
            Some(engine.closed_tx.clone()),
        )
        .await
        .expect("session should connect");
        engine.adopt_session(session.clone()).await;

        engine.shutdown().await;

        assert_eq!(session.state(), SessionState::Closed);
        assert!(engine.server_states().is_empty());
        assert!(engine.visible_tools().is_empty());
    }

    #[tokio::test]
    async fn audit_stream_has_a_single_consumer() {
        let engine = Engine::new(Config::default());
        assert!(engine.take_audit_events().is_some());
        assert!(engine.take_audit_events().is_none());
    }
}

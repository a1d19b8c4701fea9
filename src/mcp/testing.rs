//! Scripted doubles for exercising sessions and dispatch without real
//! server processes.

use crate::core::config::data::McpServerConfig;
use crate::mcp::error::TransportError;
use crate::mcp::session::ServerSession;
use crate::mcp::transport::{decode_frame, Frame, McpTransport};
use async_trait::async_trait;
use rust_mcp_schema::schema_utils::ClientMessage;
use rust_mcp_schema::{Tool, LATEST_PROTOCOL_VERSION};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

pub(crate) fn tool_with_schema(name: &str, schema: Value) -> Tool {
    serde_json::from_value(json!({"name": name, "inputSchema": schema}))
        .expect("tool should parse")
}

pub(crate) fn schema_tool(name: &str) -> Tool {
    tool_with_schema(
        name,
        json!({"type": "object", "properties": {"query": {"type": "string"}}}),
    )
}

pub(crate) fn default_initialize_result() -> Value {
    json!({
        "capabilities": {"tools": {}},
        "protocolVersion": LATEST_PROTOCOL_VERSION,
        "serverInfo": {"name": "scripted", "version": "0.1.0"}
    })
}

pub(crate) fn text_call_result(text: &str) -> Value {
    json!({"content": [{"type": "text", "text": text}]})
}

/// How the scripted server answers one request for a given method.
pub(crate) enum ScriptedReply {
    Result(Value),
    Error { code: i64, message: String },
    /// Never respond; lets timeout paths run their course.
    Silent,
    /// Push an unparseable frame instead of a response.
    Garbage,
    /// Respond with a correlation id no caller is waiting on.
    WrongId(Value),
}

/// In-process transport that answers requests from a script.
///
/// Per-method reply queues are consumed first; when a queue runs dry the
/// method's default reply (if any) answers every further request.
pub(crate) struct ScriptedTransport {
    replies: StdMutex<HashMap<String, VecDeque<ScriptedReply>>>,
    defaults: StdMutex<HashMap<String, Value>>,
    sent_methods: StdMutex<Vec<String>>,
    inbound_tx: mpsc::UnboundedSender<Frame>,
    inbound: Mutex<mpsc::UnboundedReceiver<Frame>>,
    shutdown: CancellationToken,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            replies: StdMutex::new(HashMap::new()),
            defaults: StdMutex::new(HashMap::new()),
            sent_methods: StdMutex::new(Vec::new()),
            inbound_tx,
            inbound: Mutex::new(inbound_rx),
            shutdown: CancellationToken::new(),
        }
    }

    /// A transport that completes the handshake and advertises `tools`.
    pub(crate) fn with_handshake(tools: &[Tool]) -> Self {
        let transport = Self::new();
        transport.default_reply("initialize", default_initialize_result());
        transport.default_reply(
            "tools/list",
            json!({"tools": serde_json::to_value(tools).expect("tools serialize")}),
        );
        transport
    }

    pub(crate) fn default_reply(&self, method: &str, result: Value) {
        self.defaults
            .lock()
            .expect("defaults lock poisoned")
            .insert(method.to_string(), result);
    }

    pub(crate) fn on(&self, method: &str, reply: ScriptedReply) {
        self.replies
            .lock()
            .expect("replies lock poisoned")
            .entry(method.to_string())
            .or_default()
            .push_back(reply);
    }

    pub(crate) fn sent_methods(&self) -> Vec<String> {
        self.sent_methods
            .lock()
            .expect("sent lock poisoned")
            .clone()
    }

    pub(crate) fn call_count(&self, method: &str) -> usize {
        self.sent_methods()
            .iter()
            .filter(|sent| sent.as_str() == method)
            .count()
    }

    /// Injects an unsolicited frame, as if the server pushed it.
    pub(crate) fn push_payload(&self, payload: &str) {
        for frame in decode_frame(payload) {
            let _ = self.inbound_tx.send(frame);
        }
    }

    fn queue_value(&self, value: Value) {
        let payload = value.to_string();
        for frame in decode_frame(&payload) {
            let _ = self.inbound_tx.send(frame);
        }
    }

    fn next_reply(&self, method: &str) -> Option<ScriptedReply> {
        let scripted = self
            .replies
            .lock()
            .expect("replies lock poisoned")
            .get_mut(method)
            .and_then(VecDeque::pop_front);
        if scripted.is_some() {
            return scripted;
        }
        self.defaults
            .lock()
            .expect("defaults lock poisoned")
            .get(method)
            .cloned()
            .map(ScriptedReply::Result)
    }
}

#[async_trait]
impl McpTransport for ScriptedTransport {
    async fn send(&self, message: &ClientMessage) -> Result<(), TransportError> {
        let value =
            serde_json::to_value(message).map_err(|err| TransportError::Write(err.to_string()))?;
        let Some(method) = value.get("method").and_then(Value::as_str) else {
            // Responses and errors sent back to the server carry no method.
            return Ok(());
        };
        self.sent_methods
            .lock()
            .expect("sent lock poisoned")
            .push(method.to_string());

        let Some(id) = value.get("id").cloned().filter(|id| !id.is_null()) else {
            // Notifications expect no reply.
            return Ok(());
        };

        match self.next_reply(method) {
            Some(ScriptedReply::Result(result)) => {
                self.queue_value(json!({"jsonrpc": "2.0", "id": id, "result": result}));
            }
            Some(ScriptedReply::Error { code, message }) => {
                self.queue_value(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": code, "message": message}
                }));
            }
            Some(ScriptedReply::Silent) => {}
            Some(ScriptedReply::Garbage) => {
                let _ = self
                    .inbound_tx
                    .send(Frame::Malformed("scripted garbage".to_string()));
            }
            Some(ScriptedReply::WrongId(result)) => {
                self.queue_value(json!({"jsonrpc": "2.0", "id": 999_999, "result": result}));
            }
            None => {
                self.queue_value(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": format!("Method not scripted: {method}")}
                }));
            }
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Frame, TransportError> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(TransportError::Closed),
            frame = inbound.recv() => frame.ok_or(TransportError::Closed),
        }
    }

    async fn close(&self) {
        self.shutdown.cancel();
    }
}

/// Brings a session up over a scripted transport.
pub(crate) async fn scripted_session(
    server_id: &str,
    transport: Arc<ScriptedTransport>,
) -> Arc<ServerSession> {
    let config = McpServerConfig::stub(server_id);
    ServerSession::establish(&config, transport, None)
        .await
        .expect("scripted session should connect")
}

//! Transport adapters for MCP server connections.
//!
//! Implementations normalize framing differences across stdio and streamable
//! HTTP so the session layer can run one receive loop over either. Retry and
//! reconnect policy belong to the layers above; a transport only reports
//! what happened on the wire.

use crate::core::config::data::McpServerConfig;
use crate::mcp::error::TransportError;
use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{ClientMessage, ServerMessage};

pub mod http;
pub mod stdio;

pub use http::StreamableHttpTransport;
pub use stdio::StdioTransport;

/// One deframed unit read off the wire.
#[derive(Debug)]
pub enum Frame {
    Message(ServerMessage),
    /// Bytes that framed correctly but did not parse as a protocol
    /// message. The session treats this as a protocol violation.
    Malformed(String),
}

/// Bidirectional message channel to one MCP server.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Writes one framed client message to the server.
    async fn send(&self, message: &ClientMessage) -> Result<(), TransportError>;

    /// Returns the next framed server message, suspending until one
    /// arrives. Resolves to [`TransportError::Closed`] once the peer has
    /// disconnected and the inbound buffer is drained.
    async fn receive(&self) -> Result<Frame, TransportError>;

    /// Records the protocol version negotiated during the handshake.
    /// Transports that stamp a version onto outbound frames override this.
    fn note_protocol_version(&self, _version: &str) {}

    /// Tears the connection down. Idempotent.
    async fn close(&self);
}

/// Supported MCP transport backends.
///
/// - [`McpTransportKind::Stdio`] for locally spawned processes.
/// - [`McpTransportKind::StreamableHttp`] for remote servers over HTTP/SSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpTransportKind {
    StreamableHttp,
    Stdio,
}

impl McpTransportKind {
    /// Resolves transport type from config, defaulting to streamable HTTP.
    pub fn from_config(config: &McpServerConfig) -> Result<Self, String> {
        let transport = config
            .transport
            .as_deref()
            .unwrap_or("streamable-http")
            .to_ascii_lowercase();
        match transport.as_str() {
            "streamable-http" | "streamable_http" | "http" => Ok(McpTransportKind::StreamableHttp),
            "stdio" => Ok(McpTransportKind::Stdio),
            other => Err(format!("Unsupported MCP transport: {}", other)),
        }
    }
}

/// Decodes one wire frame into protocol messages.
///
/// Servers may batch several JSON-RPC messages into a single array frame;
/// each element is yielded in order.
pub(crate) fn decode_frame(payload: &str) -> Vec<Frame> {
    let value = match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(value) => value,
        Err(err) => return vec![Frame::Malformed(format!("invalid JSON frame: {err}"))],
    };

    if let Some(items) = value.as_array() {
        items
            .iter()
            .map(|item| match serde_json::from_value::<ServerMessage>(item.clone()) {
                Ok(message) => Frame::Message(message),
                Err(err) => Frame::Malformed(format!("unrecognized batch element: {err}")),
            })
            .collect()
    } else {
        match serde_json::from_value::<ServerMessage>(value) {
            Ok(message) => vec![Frame::Message(message)],
            Err(err) => vec![Frame::Malformed(format!("unrecognized message: {err}"))],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_json(id: i64) -> String {
        format!(r#"{{"jsonrpc":"2.0","id":{id},"result":{{}}}}"#)
    }

    #[test]
    fn transport_kind_defaults_to_streamable_http() {
        let config = McpServerConfig::stub("alpha");
        assert_eq!(
            McpTransportKind::from_config(&config),
            Ok(McpTransportKind::StreamableHttp)
        );
    }

    #[test]
    fn transport_kind_rejects_unknown_names() {
        let mut config = McpServerConfig::stub("alpha");
        config.transport = Some("carrier-pigeon".to_string());
        assert!(McpTransportKind::from_config(&config).is_err());
    }

    #[test]
    fn decode_frame_accepts_single_message() {
        let frames = decode_frame(&response_json(1));
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::Message(_)));
    }

    #[test]
    fn decode_frame_splits_batches_in_order() {
        let payload = format!("[{},{}]", response_json(1), response_json(2));
        let frames = decode_frame(&payload);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| matches!(f, Frame::Message(_))));
    }

    #[test]
    fn decode_frame_flags_garbage() {
        let frames = decode_frame("not json");
        assert!(matches!(frames[0], Frame::Malformed(_)));
    }
}

use crate::core::config::data::McpServerConfig;
use crate::mcp::error::TransportError;
use crate::mcp::transport::{decode_frame, Frame, McpTransport};
use async_trait::async_trait;
use futures_util::StreamExt;
use rust_mcp_schema::schema_utils::ClientMessage;
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const MCP_JSON_CONTENT_TYPE: &str = "application/json";
pub const MCP_JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
pub const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

const MCP_HTTP_CONNECT_TIMEOUT_SECONDS: u64 = 10;
const MCP_HTTP_REQUEST_TIMEOUT_SECONDS: u64 = 60;
const MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;
const MCP_HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;

pub fn require_http_base_url(config: &McpServerConfig) -> Result<String, String> {
    config
        .base_url
        .clone()
        .ok_or_else(|| "MCP base_url is required for HTTP transports.".to_string())
}

fn build_mcp_http_client() -> Result<reqwest::Client, String> {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(MCP_HTTP_CONNECT_TIMEOUT_SECONDS))
        .timeout(std::time::Duration::from_secs(MCP_HTTP_REQUEST_TIMEOUT_SECONDS))
        .pool_idle_timeout(std::time::Duration::from_secs(MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS))
        .pool_max_idle_per_host(MCP_HTTP_POOL_MAX_IDLE_PER_HOST)
        .build()
        .map_err(|err| err.to_string())
}

pub fn apply_post_headers(request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    request
        .header("Content-Type", MCP_JSON_CONTENT_TYPE)
        .header("Accept", MCP_JSON_AND_SSE_ACCEPT)
}

pub fn apply_protocol_version_header(
    request: reqwest::RequestBuilder,
    protocol_version: Option<&str>,
) -> reqwest::RequestBuilder {
    match protocol_version {
        Some(protocol_version) if !protocol_version.trim().is_empty() => {
            request.header(MCP_PROTOCOL_VERSION_HEADER, protocol_version)
        }
        _ => request,
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

pub fn sse_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// Reassembles SSE lines across chunk boundaries.
#[derive(Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    pub fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = self.buffer[search_index..].iter().position(|b| *b == b'\n')
        {
            let newline_index = search_index + relative_pos;
            let mut line_end = newline_index;
            if line_end > search_index && self.buffer[line_end - 1] == b'\r' {
                line_end -= 1;
            }

            let line_bytes = &self.buffer[search_index..line_end];
            if let Ok(text) = std::str::from_utf8(line_bytes) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }

            search_index = newline_index + 1;
        }

        if flush {
            if let Ok(text) = std::str::from_utf8(&self.buffer[search_index..]) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }
            self.buffer.clear();
        } else if search_index > 0 {
            self.buffer.drain(..search_index);
        }

        lines
    }
}

/// JSON-RPC over streamable HTTP.
///
/// Each `send` POSTs one client message to the base URL. Response bodies
/// arrive either as a single JSON document or as a `text/event-stream`;
/// both are deframed into the shared inbound queue that `receive` drains,
/// so the session's correlation loop works the same as over stdio. The
/// server's `mcp-session-id` header is captured on first contact and
/// replayed on every subsequent request.
pub struct StreamableHttpTransport {
    client: reqwest::Client,
    base_url: String,
    headers: Vec<(String, String)>,
    session_id: StdMutex<Option<String>>,
    protocol_version: StdMutex<Option<String>>,
    inbound_tx: mpsc::UnboundedSender<Frame>,
    inbound: Mutex<mpsc::UnboundedReceiver<Frame>>,
    shutdown: CancellationToken,
    server_id: String,
}

impl StreamableHttpTransport {
    pub fn connect(server_id: &str, config: &McpServerConfig) -> Result<Self, TransportError> {
        let base_url = require_http_base_url(config).map_err(TransportError::Write)?;
        let client = build_mcp_http_client().map_err(TransportError::Write)?;
        let headers = config
            .headers
            .clone()
            .map(|headers| headers.into_iter().collect())
            .unwrap_or_default();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Ok(Self {
            client,
            base_url,
            headers,
            session_id: StdMutex::new(None),
            protocol_version: StdMutex::new(config.protocol_version.clone()),
            inbound_tx,
            inbound: Mutex::new(inbound_rx),
            shutdown: CancellationToken::new(),
            server_id: server_id.to_string(),
        })
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|guard| guard.clone())
    }

    fn remember_session_id(&self, response: &reqwest::Response) {
        let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string())
        else {
            return;
        };
        if let Ok(mut guard) = self.session_id.lock() {
            *guard = Some(session_id);
        }
    }

    fn protocol_version(&self) -> Option<String> {
        self.protocol_version
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }

    fn build_post(&self, payload: String) -> reqwest::RequestBuilder {
        let protocol_version = self.protocol_version();
        let mut request = apply_protocol_version_header(
            apply_post_headers(self.client.post(&self.base_url)),
            protocol_version.as_deref(),
        )
        .body(payload);

        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        if let Some(session_id) = self.session_id() {
            request = request.header(MCP_SESSION_ID_HEADER, session_id);
        }
        request
    }

    fn queue_frames(&self, payload: &str) {
        for frame in decode_frame(payload) {
            let _ = self.inbound_tx.send(frame);
        }
    }

    /// Drains an event-stream body in the background so concurrent sends
    /// are not serialized behind a slow response.
    fn spawn_sse_drain(&self, response: reqwest::Response) {
        let inbound_tx = self.inbound_tx.clone();
        let shutdown = self.shutdown.clone();
        let server_id = self.server_id.clone();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = SseLineBuffer::default();
            loop {
                let chunk = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    chunk = stream.next() => chunk,
                };
                let Some(chunk) = chunk else { break };
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        debug!(server_id = %server_id, error = %err, "MCP event stream ended with error");
                        return;
                    }
                };
                for line in buffer.push(&chunk) {
                    forward_sse_line(&inbound_tx, &line);
                }
            }
            for line in buffer.finish() {
                forward_sse_line(&inbound_tx, &line);
            }
        });
    }
}

fn forward_sse_line(inbound_tx: &mpsc::UnboundedSender<Frame>, line: &str) {
    let Some(payload) = sse_data_payload(line) else {
        return;
    };
    if payload.is_empty() {
        return;
    }
    for frame in decode_frame(payload) {
        let _ = inbound_tx.send(frame);
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn send(&self, message: &ClientMessage) -> Result<(), TransportError> {
        let payload =
            serde_json::to_string(message).map_err(|err| TransportError::Write(err.to_string()))?;
        debug!(server_id = %self.server_id, url = %self.base_url, bytes = payload.len(), "Sending MCP HTTP request");

        let response = self
            .build_post(payload)
            .send()
            .await
            .map_err(|err| TransportError::Write(err.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::Write(format!(
                "HTTP error: {}",
                response.status()
            )));
        }
        self.remember_session_id(&response);

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        if is_event_stream_content_type(&content_type) {
            self.spawn_sse_drain(response);
        } else if content_type.starts_with(MCP_JSON_CONTENT_TYPE) {
            let body = response
                .bytes()
                .await
                .map_err(|err| TransportError::Read(err.to_string()))?;
            if !body.is_empty() {
                let text = String::from_utf8_lossy(&body);
                self.queue_frames(text.trim());
            }
        }
        // Other content types (e.g. an empty 202 for a notification) carry
        // no protocol messages.

        Ok(())
    }

    async fn receive(&self) -> Result<Frame, TransportError> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(TransportError::Closed),
            frame = inbound.recv() => frame.ok_or(TransportError::Closed),
        }
    }

    fn note_protocol_version(&self, version: &str) {
        if let Ok(mut guard) = self.protocol_version.lock() {
            *guard = Some(version.to_string());
        }
    }

    async fn close(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_buffer_handles_partial_lines() {
        let mut buffer = SseLineBuffer::default();
        assert!(buffer.push(b"data: one").is_empty());
        assert_eq!(buffer.push(b"\n\n"), vec!["data: one"]);
        assert!(buffer.finish().is_empty());
    }

    #[test]
    fn sse_buffer_handles_chunk_boundaries() {
        let mut buffer = SseLineBuffer::default();
        assert_eq!(buffer.push(b"data: one\n\n"), vec!["data: one"]);
        assert_eq!(buffer.push(b"data: t"), Vec::<String>::new());
        assert_eq!(buffer.push(b"wo\n"), vec!["data: two"]);
        assert_eq!(buffer.finish(), Vec::<String>::new());
    }

    #[test]
    fn detects_event_stream_content_type() {
        assert!(is_event_stream_content_type(
            "text/event-stream; charset=utf-8"
        ));
        assert!(!is_event_stream_content_type("application/json"));
    }

    #[test]
    fn extracts_sse_payload() {
        assert_eq!(sse_data_payload("data: {\"id\":1}"), Some("{\"id\":1}"));
        assert_eq!(sse_data_payload("event: ping"), None);
    }

    #[test]
    fn post_headers_include_json_and_sse_accept() {
        let client = reqwest::Client::new();
        let request = apply_post_headers(client.post("https://example.com"))
            .build()
            .expect("request should build");

        assert_eq!(
            request
                .headers()
                .get("Content-Type")
                .and_then(|v| v.to_str().ok()),
            Some(MCP_JSON_CONTENT_TYPE)
        );
        assert_eq!(
            request
                .headers()
                .get("Accept")
                .and_then(|v| v.to_str().ok()),
            Some(MCP_JSON_AND_SSE_ACCEPT)
        );
    }

    #[test]
    fn protocol_header_ignored_when_blank() {
        let client = reqwest::Client::new();
        let request =
            apply_protocol_version_header(client.post("https://example.com"), Some("  "))
                .build()
                .expect("request should build");
        assert!(request.headers().get(MCP_PROTOCOL_VERSION_HEADER).is_none());
    }

    #[test]
    fn connect_requires_base_url() {
        let mut config = McpServerConfig::stub("alpha");
        config.base_url = None;
        assert!(StreamableHttpTransport::connect("alpha", &config).is_err());
    }

    #[tokio::test]
    async fn negotiated_version_is_stamped_on_later_posts() {
        let mut config = McpServerConfig::stub("alpha");
        config.base_url = Some("https://mcp.example.com".to_string());
        let transport =
            StreamableHttpTransport::connect("alpha", &config).expect("connect should succeed");

        transport.note_protocol_version("2025-11-25");
        let request = transport
            .build_post("{}".to_string())
            .build()
            .expect("request should build");
        assert_eq!(
            request
                .headers()
                .get(MCP_PROTOCOL_VERSION_HEADER)
                .and_then(|value| value.to_str().ok()),
            Some("2025-11-25")
        );
    }
}

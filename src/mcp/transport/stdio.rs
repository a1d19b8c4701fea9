use crate::core::config::data::McpServerConfig;
use crate::mcp::error::TransportError;
use crate::mcp::transport::{decode_frame, Frame, McpTransport};
use async_trait::async_trait;
use rust_mcp_schema::schema_utils::ClientMessage;
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const STDIO_WRITE_TIMEOUT_SECONDS: u64 = 10;
const STDIO_LOCK_TIMEOUT_SECONDS: u64 = 10;

pub fn require_stdio_command(config: &McpServerConfig) -> Result<String, String> {
    config
        .command
        .clone()
        .ok_or_else(|| "MCP command is required for stdio transport.".to_string())
}

fn stdio_args(config: &McpServerConfig) -> Vec<String> {
    config.args.clone().unwrap_or_default()
}

fn stdio_env(config: &McpServerConfig) -> Option<HashMap<String, String>> {
    config.env.clone()
}

/// Newline-delimited JSON over a child process's stdin/stdout.
///
/// A reader task deframes stdout into the inbound queue; stderr is drained
/// and discarded. When the child exits, the inbound queue closes and
/// `receive` reports the connection as closed.
pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    inbound: Mutex<mpsc::UnboundedReceiver<Frame>>,
    shutdown: CancellationToken,
    server_id: String,
}

impl StdioTransport {
    pub fn spawn(server_id: &str, config: &McpServerConfig) -> Result<Self, TransportError> {
        let command = require_stdio_command(config).map_err(TransportError::Write)?;
        let args = stdio_args(config);
        debug!(server_id = %server_id, command = %command, args = ?args, "Starting MCP stdio server");
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        if let Some(env) = stdio_env(config) {
            cmd.envs(env);
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| TransportError::Write(err.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Write("Unable to retrieve stdin.".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Write("Unable to retrieve stdout.".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Write("Unable to retrieve stderr.".to_string()))?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        {
            let inbound_tx = inbound_tx.clone();
            let server_id = server_id.to_string();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    for frame in decode_frame(trimmed) {
                        if inbound_tx.send(frame).is_err() {
                            return;
                        }
                    }
                }
                debug!(server_id = %server_id, "MCP stdio stdout reached EOF");
            });
        }

        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(_)) = reader.next_line().await {}
        });

        {
            let shutdown = shutdown.clone();
            let server_id = server_id.to_string();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    }
                    status = child.wait() => {
                        debug!(server_id = %server_id, status = ?status, "MCP stdio server exited");
                    }
                }
                // Dropping inbound_tx here closes the queue once the reader
                // has drained whatever the child flushed before exiting.
                drop(inbound_tx);
            });
        }

        Ok(Self {
            stdin: Mutex::new(stdin),
            inbound: Mutex::new(inbound_rx),
            shutdown,
            server_id: server_id.to_string(),
        })
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send(&self, message: &ClientMessage) -> Result<(), TransportError> {
        let payload =
            serde_json::to_string(message).map_err(|err| TransportError::Write(err.to_string()))?;
        let lock_timeout = tokio::time::Duration::from_secs(STDIO_LOCK_TIMEOUT_SECONDS);
        let write_timeout = tokio::time::Duration::from_secs(STDIO_WRITE_TIMEOUT_SECONDS);

        let mut stdin = tokio::time::timeout(lock_timeout, self.stdin.lock())
            .await
            .map_err(|_| {
                TransportError::Write("Timed out waiting for MCP stdio stdin lock.".to_string())
            })?;
        debug!(server_id = %self.server_id, bytes = payload.len(), "Writing MCP stdio client message");
        tokio::time::timeout(write_timeout, stdin.write_all(payload.as_bytes()))
            .await
            .map_err(|_| TransportError::Write("Timed out writing MCP stdio message.".to_string()))?
            .map_err(|err| TransportError::Write(err.to_string()))?;
        tokio::time::timeout(write_timeout, stdin.write_all(b"\n"))
            .await
            .map_err(|_| TransportError::Write("Timed out writing MCP stdio newline.".to_string()))?
            .map_err(|err| TransportError::Write(err.to_string()))?;
        tokio::time::timeout(write_timeout, stdin.flush())
            .await
            .map_err(|_| TransportError::Write("Timed out flushing MCP stdio message.".to_string()))?
            .map_err(|err| TransportError::Write(err.to_string()))?;
        Ok(())
    }

    async fn receive(&self) -> Result<Frame, TransportError> {
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_mcp_schema::schema_utils::{FromMessage, MessageFromClient, RequestFromClient};
    use rust_mcp_schema::RequestId;

    #[test]
    fn stdio_requires_a_command() {
        let config = McpServerConfig::stub("alpha");
        let err = require_stdio_command(&config).expect_err("expected missing command error");
        assert_eq!(err, "MCP command is required for stdio transport.");
    }

    #[tokio::test]
    async fn spawn_fails_for_missing_binary() {
        let mut config = McpServerConfig::stub("alpha");
        config.transport = Some("stdio".to_string());
        config.command = Some("/definitely-missing-command".to_string());
        assert!(StdioTransport::spawn("alpha", &config).is_err());
    }

    #[tokio::test]
    async fn receive_reports_closed_after_child_exits() {
        let mut config = McpServerConfig::stub("alpha");
        config.transport = Some("stdio".to_string());
        config.command = Some("true".to_string());

        let transport = StdioTransport::spawn("alpha", &config).expect("spawn should succeed");
        let result = transport.receive().await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn echoed_lines_come_back_as_frames() {
        let mut config = McpServerConfig::stub("alpha");
        config.transport = Some("stdio".to_string());
        config.command = Some("cat".to_string());

        let transport = StdioTransport::spawn("alpha", &config).expect("spawn should succeed");
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(RequestFromClient::PingRequest(None)),
            Some(RequestId::Integer(7)),
        )
        .expect("message should build");

        transport.send(&message).await.expect("send should succeed");
        // `cat` echoes the frame straight back; whatever it parses as, it
        // must come through the inbound queue rather than being dropped.
        let frame = transport.receive().await.expect("frame expected");
        assert!(matches!(frame, Frame::Message(_) | Frame::Malformed(_)));
        transport.close().await;
    }
}

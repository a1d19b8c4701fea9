use crate::core::config::data::McpServerConfig;
use crate::mcp::error::{ToolCallError, ToolErrorKind};
use rust_mcp_schema::schema_utils::ServerMessage;
use rust_mcp_schema::{
    CallToolResult, InitializeResult, ListToolsResult, RpcError, LATEST_PROTOCOL_VERSION,
};
use serde_json::Value;

/// Protocol revisions this client can speak, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[
    LATEST_PROTOCOL_VERSION,
    "2025-06-18",
    "2025-03-26",
    "2024-11-05",
];

pub(crate) fn requested_protocol_version(config: &McpServerConfig) -> String {
    config
        .protocol_version
        .clone()
        .unwrap_or_else(|| LATEST_PROTOCOL_VERSION.to_string())
}

/// Whether a server-negotiated protocol version is acceptable.
///
/// A config override counts as supported; operators pinning a version are
/// taken at their word.
pub(crate) fn is_supported_protocol_version(config: &McpServerConfig, negotiated: &str) -> bool {
    if SUPPORTED_PROTOCOL_VERSIONS.contains(&negotiated) {
        return true;
    }
    config
        .protocol_version
        .as_deref()
        .is_some_and(|pinned| pinned == negotiated)
}

pub(crate) fn format_rpc_error(error: &RpcError) -> String {
    format!("Server error {}: {}", error.code, error.message)
}

pub(crate) fn format_unexpected_server_message(message: &ServerMessage) -> String {
    match message {
        ServerMessage::Request(request) => {
            format!("Unexpected server request: {}", request.method())
        }
        ServerMessage::Notification(_) => "Unexpected server notification.".to_string(),
        _ => "Unexpected server message.".to_string(),
    }
}

pub(crate) fn parse_initialize_result(
    message: ServerMessage,
) -> Result<InitializeResult, ToolCallError> {
    let value = parse_response_value(message)?;
    let result = serde_json::from_value::<InitializeResult>(value).map_err(|err| {
        ToolCallError::new(
            ToolErrorKind::ProtocolViolation,
            format!("Malformed initialize response: {err}"),
        )
    })?;
    if result.protocol_version.trim().is_empty() {
        return Err(ToolCallError::new(
            ToolErrorKind::ProtocolViolation,
            "Initialize response carried no protocol version.",
        ));
    }
    Ok(result)
}

pub(crate) fn parse_list_tools(message: ServerMessage) -> Result<ListToolsResult, ToolCallError> {
    parse_response(message)
}

pub(crate) fn parse_call_tool(message: ServerMessage) -> Result<CallToolResult, ToolCallError> {
    parse_response(message)
}

fn parse_response<T: serde::de::DeserializeOwned>(
    message: ServerMessage,
) -> Result<T, ToolCallError> {
    let value = parse_response_value(message)?;
    serde_json::from_value::<T>(value).map_err(|err| {
        ToolCallError::new(
            ToolErrorKind::ProtocolViolation,
            format!("Malformed response payload: {err}"),
        )
    })
}

/// Unwraps a correlated response into its result value.
///
/// A JSON-RPC error response is deterministic for the call chain that sent
/// it; it maps to `NonRecoverable` so the dispatcher never retries it.
pub(crate) fn parse_response_value(message: ServerMessage) -> Result<Value, ToolCallError> {
    match message {
        ServerMessage::Response(response) => serde_json::to_value(&response.result)
            .map_err(|err| ToolCallError::new(ToolErrorKind::ProtocolViolation, err.to_string())),
        ServerMessage::Error(error) => Err(ToolCallError::new(
            ToolErrorKind::NonRecoverable,
            format_rpc_error(&error.error),
        )),
        other => Err(ToolCallError::new(
            ToolErrorKind::ProtocolViolation,
            format_unexpected_server_message(&other),
        )),
    }
}

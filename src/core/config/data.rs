use crate::core::config::defaults;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One configured MCP server.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct McpServerConfig {
    pub id: String,
    pub display_name: String,
    /// Endpoint for HTTP transports.
    pub base_url: Option<String>,
    /// Launch command for stdio transports.
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<HashMap<String, String>>,
    /// Extra headers sent on every HTTP request (e.g. bearer tokens).
    pub headers: Option<HashMap<String, String>>,
    /// "stdio" or "streamable-http"; defaults to streamable HTTP.
    pub transport: Option<String>,
    /// When set, only these tools are accepted from the server's catalog.
    pub allowed_tools: Option<Vec<String>>,
    /// Pinned protocol revision; overrides the negotiation default.
    pub protocol_version: Option<String>,
    pub enabled: Option<bool>,
    /// Skip the permission gate for this server's tools.
    pub yolo: Option<bool>,
}

impl McpServerConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn is_yolo(&self) -> bool {
        self.yolo.unwrap_or(false)
    }
}

#[cfg(test)]
impl McpServerConfig {
    pub fn stub(id: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: id.to_string(),
            base_url: Some("https://mcp.example.com".to_string()),
            command: None,
            args: None,
            env: None,
            headers: None,
            transport: None,
            allowed_tools: None,
            protocol_version: None,
            enabled: Some(true),
            yolo: None,
        }
    }
}

/// Dispatch and turn-loop tuning.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on tool-call rounds per user turn; the loop safeguard
    /// against a model that calls tools forever.
    #[serde(default = "defaults::max_tool_rounds_per_turn")]
    pub max_tool_rounds_per_turn: u32,
    /// Concurrent calls allowed per tool; absent means unlimited (bounded
    /// only by the owning session).
    pub per_tool_concurrency_cap: Option<usize>,
    #[serde(default = "defaults::dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
    /// Retries for transient failures; deterministic failures never retry.
    #[serde(default = "defaults::retry_count")]
    pub retry_count: u32,
    /// Calls allowed to queue behind a saturated concurrency cap before
    /// dispatch fails with an overload error.
    #[serde(default = "defaults::max_queue_depth")]
    pub max_queue_depth: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds_per_turn: defaults::max_tool_rounds_per_turn(),
            per_tool_concurrency_cap: None,
            dispatch_timeout_ms: defaults::dispatch_timeout_ms(),
            retry_count: defaults::retry_count(),
            max_queue_depth: defaults::max_queue_depth(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

impl Config {
    pub fn find_server(&self, id: &str) -> Option<&McpServerConfig> {
        self.mcp_servers
            .iter()
            .find(|server| server.id.eq_ignore_ascii_case(id))
    }

    pub fn enabled_servers(&self) -> impl Iterator<Item = &McpServerConfig> {
        self.mcp_servers.iter().filter(|server| server.is_enabled())
    }

    /// Checks the configuration for problems worth refusing startup over.
    /// Returns human-readable issues; empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        let mut seen_ids: Vec<String> = Vec::new();
        for server in &self.mcp_servers {
            let id = server.id.to_ascii_lowercase();
            if id.is_empty() {
                issues.push("An MCP server entry is missing an id.".to_string());
                continue;
            }
            if seen_ids.contains(&id) {
                issues.push(format!("Duplicate MCP server id: {}", server.id));
            }
            seen_ids.push(id);

            if !server.is_enabled() {
                continue;
            }
            match crate::mcp::transport::McpTransportKind::from_config(server) {
                Ok(crate::mcp::transport::McpTransportKind::Stdio) => {
                    if server.command.is_none() {
                        issues.push(format!(
                            "MCP server '{}' uses stdio transport but has no command.",
                            server.id
                        ));
                    }
                }
                Ok(crate::mcp::transport::McpTransportKind::StreamableHttp) => {
                    if server.base_url.is_none() {
                        issues.push(format!(
                            "MCP server '{}' uses HTTP transport but has no base_url.",
                            server.id
                        ));
                    }
                }
                Err(message) => issues.push(format!("MCP server '{}': {}", server.id, message)),
            }
        }

        if self.orchestrator.max_tool_rounds_per_turn == 0 {
            issues.push("orchestrator.max_tool_rounds_per_turn must be at least 1.".to_string());
        }
        if self.orchestrator.dispatch_timeout_ms == 0 {
            issues.push("orchestrator.dispatch_timeout_ms must be at least 1.".to_string());
        }

        issues
    }
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}

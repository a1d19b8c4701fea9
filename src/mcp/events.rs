use crate::mcp::error::ToolErrorKind;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Observable audit events emitted by the orchestration layer.
///
/// Events travel on an unbounded channel owned by the engine; observability
/// tooling consumes them without blocking dispatch.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// One dispatch attempt for a tool call completed (successfully or not).
    /// Emitted exactly once per attempt, including retries.
    DispatchAttempt {
        call_id: String,
        tool_name: String,
        server_id: String,
        /// 1-based attempt number within this dispatch.
        attempt: u32,
        /// `None` on success, otherwise the failure kind observed.
        error: Option<ToolErrorKind>,
        timestamp: DateTime<Utc>,
    },
    /// Two servers advertised the same tool name; the later registration
    /// now shadows the earlier one. Configuration drift to surface, not a
    /// failure.
    ToolShadowed {
        tool_name: String,
        shadowed_server_id: String,
        winning_server_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A server advertised a tool whose input schema did not compile; the
    /// tool was excluded from the registry.
    ToolSchemaRejected {
        tool_name: String,
        server_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// A session reached its terminal state and its tools were
    /// deregistered.
    SessionClosed {
        server_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl AuditEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            AuditEvent::DispatchAttempt { timestamp, .. }
            | AuditEvent::ToolShadowed { timestamp, .. }
            | AuditEvent::ToolSchemaRejected { timestamp, .. }
            | AuditEvent::SessionClosed { timestamp, .. } => *timestamp,
        }
    }
}

/// Shared handle for emitting audit events.
///
/// Cloned into every component that reports; send failures mean the
/// consumer is gone and are deliberately ignored.
#[derive(Debug, Clone, Default)]
pub struct AuditSink {
    tx: Option<tokio::sync::mpsc::UnboundedSender<AuditEvent>>,
}

impl AuditSink {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<AuditEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that drops every event. Used when no observer is attached.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: AuditEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

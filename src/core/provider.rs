use crate::core::message::ConversationContext;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// A model-issued request to call one registered tool.
///
/// Arguments are untrusted model output; they are validated against the
/// tool's input schema before dispatch.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    /// Unique within one conversation turn; pairs the eventual result with
    /// this call.
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Option<Map<String, Value>>,
}

impl ToolCallRequest {
    pub fn arguments_json(&self) -> String {
        match &self.arguments {
            Some(arguments) => serde_json::to_string(&Value::Object(arguments.clone()))
                .unwrap_or_else(|_| "{}".to_string()),
            None => "{}".to_string(),
        }
    }
}

/// What the model produced for one turn: a final answer, or tool calls to
/// run before it will continue.
#[derive(Debug)]
pub enum ModelTurn {
    Answer(String),
    ToolCalls(Vec<ToolCallRequest>),
}

/// The local inference engine, consumed as an opaque capability.
///
/// Prompting format, model loading, and sampling mechanics live behind
/// this seam and are no concern of the orchestration layer.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn generate_turn(&self, context: &ConversationContext) -> Result<ModelTurn, String>;
}

use serde::{Deserialize, Serialize};

/// Role of one transcript turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
    ToolCall,
    ToolResult,
}

impl TurnRole {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
            TurnRole::ToolCall => "tool/call",
            TurnRole::ToolResult => "tool/result",
        }
    }

    pub fn is_tool(self) -> bool {
        matches!(self, TurnRole::ToolCall | TurnRole::ToolResult)
    }
}

impl AsRef<str> for TurnRole {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// One exchange unit in a conversation.
///
/// Tool turns carry the originating call id so the model can pair a result
/// with the call that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            call_id: None,
            tool_name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            call_id: None,
            tool_name: None,
        }
    }

    pub fn tool_call(call_id: &str, tool_name: &str, arguments_json: String) -> Self {
        Self {
            role: TurnRole::ToolCall,
            content: arguments_json,
            call_id: Some(call_id.to_string()),
            tool_name: Some(tool_name.to_string()),
        }
    }

    pub fn tool_result(call_id: &str, tool_name: &str, content: String) -> Self {
        Self {
            role: TurnRole::ToolResult,
            content,
            call_id: Some(call_id.to_string()),
            tool_name: Some(tool_name.to_string()),
        }
    }
}

/// Ordered transcript of one conversation.
///
/// Append-only within an exchange and owned by exactly one conversation;
/// never shared across conversations.
#[derive(Debug, Default, Clone)]
pub struct ConversationContext {
    turns: Vec<Turn>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_serialize_as_snake_case() {
        assert_eq!(
            serde_json::to_string(&TurnRole::ToolResult).expect("role serializes"),
            "\"tool_result\""
        );
    }

    #[test]
    fn tool_turns_carry_their_call_id() {
        let turn = Turn::tool_result("call-1", "search", "{}".to_string());
        assert_eq!(turn.call_id.as_deref(), Some("call-1"));
        assert_eq!(turn.tool_name.as_deref(), Some("search"));
        assert!(turn.role.is_tool());
    }

    #[test]
    fn context_appends_in_order() {
        let mut context = ConversationContext::new();
        context.push(Turn::user("hi"));
        context.push(Turn::assistant("hello"));

        let roles: Vec<TurnRole> = context.turns().iter().map(|turn| turn.role).collect();
        assert_eq!(roles, vec![TurnRole::User, TurnRole::Assistant]);
    }
}

//! Conversation data types.
//!
//! These types model the data flowing between the agent loop, the model
//! client, and the tool host.  They are provider-agnostic; translating them
//! into a particular wire format is the model client's business.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions that shape model behavior.
    System,
    /// Input from the human user.
    User,
    /// Output from the model.
    Assistant,
    /// Result of a tool invocation, fed back to the model.
    Tool,
}

impl Role {
    /// Label used when rendering a transcript for summarization.
    pub fn label(self) -> &'static str {
        match self {
            Self::System => "System",
            Self::User => "User",
            Self::Assistant => "Assistant",
            Self::Tool => "Tool",
        }
    }
}

/// A single message in a conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who produced this message.
    pub role: Role,

    /// The textual content of the message.
    ///
    /// For [`Role::Tool`] messages this is the observation text.  For
    /// [`Role::Assistant`] messages carrying tool calls it is the reasoning
    /// streamed before the calls, and may be empty.
    #[serde(default)]
    pub content: String,

    /// Tool calls requested by the assistant (only present when
    /// `role == Role::Assistant`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Identifies which tool call this message answers (only present when
    /// `role == Role::Tool`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant text message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create an assistant message that requests tool calls, keeping the
    /// reasoning text that preceded them.
    pub fn assistant_tool_calls(reasoning: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, reasoning)
        }
    }

    /// Create a tool result message.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }
}

// ---------------------------------------------------------------------------
// Tool calls
// ---------------------------------------------------------------------------

/// A tool invocation requested by the model.  Immutable once issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier assigned by the model for correlating results.
    pub id: String,

    /// The name of the tool to invoke.
    pub name: String,

    /// Arguments as a JSON value, normally an object.
    pub arguments: Value,
}

impl ToolCall {
    /// Create a tool call.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Look up a string argument by key.
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(Value::as_str)
    }
}

/// The observation produced by executing (or refusing) one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The [`ToolCall::id`] this result corresponds to.
    pub tool_call_id: String,

    /// Name of the tool that produced the result.
    pub tool: String,

    /// Output text; empty when the tool failed.
    #[serde(default)]
    pub output: String,

    /// Error text when the tool failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    /// A successful observation.
    pub fn ok(call: &ToolCall, output: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool: call.name.clone(),
            output: output.into(),
            error: None,
        }
    }

    /// A failed observation.
    pub fn failed(call: &ToolCall, error: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool: call.name.clone(),
            output: String::new(),
            error: Some(error.into()),
        }
    }

    /// Whether the tool reported an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Render as the `tool` message fed back into history.
    pub fn to_message(&self) -> Message {
        let content = match &self.error {
            Some(err) => format!("Error: {err}"),
            None => self.output.clone(),
        };
        Message::tool_result(&self.tool_call_id, content)
    }
}

/// A tool definition exposed to the model so it knows what it may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,

    /// Human-readable description of what the tool does.
    pub description: String,

    /// JSON Schema describing the tool's input parameters.
    pub input_schema: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_result_message_carries_error_prefix() {
        let call = ToolCall::new("tc_1", "read_file", json!({"path": "/nope"}));
        let msg = ToolResult::failed(&call, "no such file").to_message();
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("tc_1"));
        assert_eq!(msg.content, "Error: no such file");
    }

    #[test]
    fn tool_result_ok_keeps_output() {
        let call = ToolCall::new("tc_2", "list_dir", json!({"path": "/tmp"}));
        let result = ToolResult::ok(&call, "a.txt\nb.txt");
        assert!(!result.is_error());
        assert_eq!(result.tool, "list_dir");
        assert_eq!(result.to_message().content, "a.txt\nb.txt");
    }

    #[test]
    fn assistant_tool_calls_keeps_reasoning() {
        let call = ToolCall::new("tc_3", "grep", json!({"pattern": "fn main"}));
        let msg = Message::assistant_tool_calls("looking for main", vec![call]);
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.content, "looking for main");
        assert_eq!(msg.tool_calls.len(), 1);
    }

    #[test]
    fn str_arg_reads_string_values_only() {
        let call = ToolCall::new("tc_4", "bash", json!({"command": "ls", "timeout": 5}));
        assert_eq!(call.str_arg("command"), Some("ls"));
        assert_eq!(call.str_arg("timeout"), None);
        assert_eq!(call.str_arg("missing"), None);
    }

    #[test]
    fn message_serialization_skips_empty_fields() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        assert_eq!(json["role"], "user");
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("tool_call_id").is_none());
    }
}

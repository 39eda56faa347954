use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message::{ChatMessage, Role, ToolCall};

// =============================================================================
// Chat Protocol Surface
// =============================================================================

/// Inbound chat-completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,

    pub messages: Vec<ChatMessage>,

    #[serde(default)]
    pub stream: bool,

    /// Client-declared tool schemas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSchema>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,

    /// Arguments to use for a forced server capability when the model
    /// supplies none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl ChatCompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            model: None,
            messages,
            stream: false,
            tools: None,
            tool_choice: None,
            tool_input: None,
            session_id: None,
            context: None,
            group_name: None,
            temperature: None,
        }
    }

    /// Whether the client opted into explicit function calling.
    pub fn wants_function_calling(&self) -> bool {
        self.tools.as_ref().is_some_and(|t| !t.is_empty()) || self.tool_choice.is_some()
    }
}

/// OpenAI-style tool schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionSchema,
}

fn function_kind() -> String {
    "function".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_object")]
    pub parameters: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// Tool choice directive: a mode string or a named function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(ToolChoiceMode),
    Named {
        #[serde(rename = "type", default = "function_kind")]
        kind: String,
        function: NamedFunction,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceMode {
    None,
    Auto,
    Required,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedFunction {
    pub name: String,
}

impl ToolChoice {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named {
            kind: function_kind(),
            function: NamedFunction { name: name.into() },
        }
    }

    /// Name of the forced capability, if any.
    pub fn forced_name(&self) -> Option<&str> {
        match self {
            Self::Named { function, .. } => Some(function.name.as_str()),
            Self::Mode(_) => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::Mode(ToolChoiceMode::None))
    }
}

// =============================================================================
// Responses
// =============================================================================

/// Non-streaming chat-completion envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: String,
}

/// One incremental streaming frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkFrame {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChunkFrame {
    pub fn is_terminal(&self) -> bool {
        self.choices.iter().any(|c| c.finish_reason.is_some())
    }
}

// =============================================================================
// Invocations
// =============================================================================

/// A capability invocation about to be executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub id: String,
    pub capability: String,
    pub arguments: Value,
}

impl InvocationRequest {
    pub fn new(capability: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            capability: capability.into(),
            arguments,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Outcome of a tracked invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub id: String,
    pub capability: String,
    pub payload: Value,
    pub success: bool,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_choice_parsing() {
        let none: ToolChoice = serde_json::from_value(json!("none")).unwrap();
        assert!(none.is_none());
        assert_eq!(none.forced_name(), None);

        let auto: ToolChoice = serde_json::from_value(json!("auto")).unwrap();
        assert_eq!(auto, ToolChoice::Mode(ToolChoiceMode::Auto));

        let named: ToolChoice =
            serde_json::from_value(json!({"type": "function", "function": {"name": "greet"}})).unwrap();
        assert_eq!(named.forced_name(), Some("greet"));
    }

    #[test]
    fn test_request_minimal() {
        let req: ChatCompletionRequest =
            serde_json::from_value(json!({"messages": [{"role": "user", "content": "hi"}]})).unwrap();
        assert!(!req.stream);
        assert!(!req.wants_function_calling());
    }

    #[test]
    fn test_request_with_tools_wants_function_calling() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"type": "function", "function": {"name": "lookup"}}]
        }))
        .unwrap();
        assert!(req.wants_function_calling());
        let tools = req.tools.unwrap();
        assert!(tools[0].function.parameters.is_object());
    }
}

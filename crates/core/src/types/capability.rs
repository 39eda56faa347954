use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::chat::{FunctionSchema, ToolSchema};
use super::message::ChatMessage;

// =============================================================================
// Capability Types
// =============================================================================

/// Router label that ends the turn normally.
pub const LABEL_END: &str = "end";

/// Router label that ends the turn in error.
pub const LABEL_ERROR: &str = "error";

/// Name of the synthetic capability that delegates to a remote workflow.
pub const RUN_BEST_WORKFLOW: &str = "run_best_workflow";

/// Where a capability actually executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    /// In-process function.
    #[default]
    Local,
    /// Forwarded to an external workflow service.
    RemoteDelegate,
}

/// Machine-readable description of a capability, as shown to the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Unique name within a registry snapshot.
    pub name: String,

    /// Human-readable description used in routing prompts.
    pub description: String,

    /// JSON Schema object for the arguments.
    pub parameters: Value,

    /// Optional network path for remote delegates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_path: Option<String>,

    /// Contexts this capability is offered in. Empty means every context.
    #[serde(default)]
    pub contexts: Vec<String>,

    /// Groups allowed to use this capability. Empty means every group.
    #[serde(default)]
    pub allowed_groups: Vec<String>,

    #[serde(default)]
    pub kind: CapabilityKind,
}

impl CapabilityDescriptor {
    /// Create a local descriptor with no restrictions.
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            network_path: None,
            contexts: Vec::new(),
            allowed_groups: Vec::new(),
            kind: CapabilityKind::Local,
        }
    }

    pub fn with_contexts(mut self, contexts: Vec<String>) -> Self {
        self.contexts = contexts;
        self
    }

    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.allowed_groups = groups;
        self
    }

    pub fn with_kind(mut self, kind: CapabilityKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_network_path(mut self, path: impl Into<String>) -> Self {
        self.network_path = Some(path.into());
        self
    }

    /// Whether this capability is offered for the given context and group.
    ///
    /// An empty restriction list is unrestricted. A non-empty list requires
    /// the request to carry a matching value.
    pub fn matches(&self, context: Option<&str>, group: Option<&str>) -> bool {
        tag_matches(&self.contexts, context) && tag_matches(&self.allowed_groups, group)
    }

    /// Check structural well-formedness. Returns the reason on failure.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.name.is_empty() {
            return Err("empty name".into());
        }
        if self.name.chars().any(char::is_whitespace) {
            return Err(format!("name '{}' contains whitespace", self.name));
        }
        if self.name == LABEL_END || self.name == LABEL_ERROR {
            return Err(format!("name '{}' is a reserved routing label", self.name));
        }
        if !self.parameters.is_object() {
            return Err(format!("parameters of '{}' are not a JSON object", self.name));
        }
        Ok(())
    }

    /// Render as an OpenAI-style function tool schema.
    pub fn to_tool_schema(&self) -> ToolSchema {
        ToolSchema {
            kind: "function".into(),
            function: FunctionSchema {
                name: self.name.clone(),
                description: Some(self.description.clone()),
                parameters: self.parameters.clone(),
            },
        }
    }
}

fn tag_matches(allowed: &[String], value: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match value {
        Some(v) => allowed.iter().any(|a| a == v),
        None => false,
    }
}

/// Output from a capability invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityOutput {
    /// Whether the invocation was successful.
    pub success: bool,

    /// Text content shown to the user or fed back to the model.
    pub content: String,

    /// Optional structured data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Requested next label for conditional edges, or `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

impl CapabilityOutput {
    /// Create a successful text output.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            data: None,
            next: None,
        }
    }

    /// Attach structured data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Request a specific next label.
    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    /// Create a failed output that routes the turn to the error terminal.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            content: message.into(),
            data: None,
            next: Some(LABEL_ERROR.into()),
        }
    }

    pub fn is_error_route(&self) -> bool {
        self.next.as_deref() == Some(LABEL_ERROR)
    }

    /// Serialized form used when the result is fed back to a model.
    pub fn payload(&self) -> Value {
        match &self.data {
            Some(data) => data.clone(),
            None => Value::String(self.content.clone()),
        }
    }
}

/// A non-default transition declared by a capability module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialEdge {
    pub source: String,
    #[serde(flatten)]
    pub route: EdgeRoute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EdgeRoute {
    /// Always continue to `target`.
    Standard { target: String },
    /// Continue to whichever of `targets` the output's `next` names.
    Conditional { targets: Vec<String> },
}

impl SpecialEdge {
    pub fn standard(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            route: EdgeRoute::Standard {
                target: target.into(),
            },
        }
    }

    pub fn conditional(source: impl Into<String>, targets: Vec<String>) -> Self {
        Self {
            source: source.into(),
            route: EdgeRoute::Conditional { targets },
        }
    }

    /// All names this edge may lead to.
    pub fn targets(&self) -> Vec<&str> {
        match &self.route {
            EdgeRoute::Standard { target } => vec![target.as_str()],
            EdgeRoute::Conditional { targets } => targets.iter().map(String::as_str).collect(),
        }
    }
}

/// Request-scoped information handed to a capability.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    pub session_id: Option<String>,
    pub turn_number: u32,
    pub context: Option<String>,
    pub group: Option<String>,
    /// Conversation so far, oldest first.
    pub messages: Vec<ChatMessage>,
}

impl InvocationContext {
    /// Latest user utterance, if any.
    pub fn last_user_message(&self) -> Option<&str> {
        super::message::last_user_content(&self.messages)
    }
}

/// A remote workflow advertised by an external capability provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteWorkflow {
    pub name: String,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_matches_unrestricted() {
        let d = CapabilityDescriptor::new("greet", "Say hello", json!({"type": "object"}));
        assert!(d.matches(None, None));
        assert!(d.matches(Some("support"), Some("staff")));
    }

    #[test]
    fn test_matches_restricted() {
        let d = CapabilityDescriptor::new("refund", "Refund", json!({"type": "object"}))
            .with_contexts(vec!["support".into()])
            .with_groups(vec!["staff".into()]);
        assert!(d.matches(Some("support"), Some("staff")));
        assert!(!d.matches(Some("sales"), Some("staff")));
        assert!(!d.matches(Some("support"), None));
        assert!(!d.matches(None, Some("staff")));
    }

    #[test]
    fn test_validate_rejects_malformed() {
        let obj = json!({"type": "object"});
        assert!(CapabilityDescriptor::new("", "x", obj.clone()).validate().is_err());
        assert!(CapabilityDescriptor::new("two words", "x", obj.clone()).validate().is_err());
        assert!(CapabilityDescriptor::new("end", "x", obj.clone()).validate().is_err());
        assert!(CapabilityDescriptor::new("ok", "x", json!("string")).validate().is_err());
        assert!(CapabilityDescriptor::new("ok", "x", obj).validate().is_ok());
    }

    #[test]
    fn test_error_output_routes_to_error() {
        let out = CapabilityOutput::error("boom");
        assert!(!out.success);
        assert!(out.is_error_route());
        assert!(!CapabilityOutput::text("fine").is_error_route());
    }

    #[test]
    fn test_edge_serialization() {
        let edge = SpecialEdge::standard("human_approval", "process_approval");
        let v = serde_json::to_value(&edge).unwrap();
        assert_eq!(
            v,
            json!({"type": "standard", "source": "human_approval", "target": "process_approval"})
        );
    }
}

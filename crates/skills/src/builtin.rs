//! Built-in capability modules.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use capgraph_core::{
    traits::{Capability, CapabilityModule},
    types::{CapabilityDescriptor, CapabilityOutput, InvocationContext, Role, SpecialEdge},
    Error, Result,
};

/// Every built-in module.
pub fn builtin_modules() -> Vec<Arc<dyn CapabilityModule>> {
    vec![
        Arc::new(BasicModule),
        Arc::new(GreetingModule),
        Arc::new(HumanModule),
        Arc::new(LinksModule),
        Arc::new(VisualizeModule),
    ]
}

fn schema<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| json!({"type": "object"}))
}

fn parse_args<T: DeserializeOwned>(capability: &str, args: Value) -> Result<T> {
    serde_json::from_value(args)
        .map_err(|e| Error::invalid_request(format!("invalid arguments for {}: {}", capability, e)))
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TextArgs {
    /// The text to transform.
    #[serde(alias = "input")]
    pub text: String,
}

// =============================================================================
// Basic Module
// =============================================================================

/// Simple text transforms.
pub struct BasicModule;

impl CapabilityModule for BasicModule {
    fn name(&self) -> &str {
        "basic"
    }

    fn capabilities(&self) -> Result<Vec<Arc<dyn Capability>>> {
        Ok(vec![Arc::new(ToUppercase), Arc::new(ReverseString)])
    }
}

pub struct ToUppercase;

#[async_trait]
impl Capability for ToUppercase {
    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            "to_uppercase",
            "Converts the given text to uppercase",
            schema::<TextArgs>(),
        )
    }

    async fn invoke(&self, args: Value, _ctx: &InvocationContext) -> Result<CapabilityOutput> {
        let args: TextArgs = parse_args("to_uppercase", args)?;
        Ok(CapabilityOutput::text(args.text.to_uppercase()))
    }
}

pub struct ReverseString;

#[async_trait]
impl Capability for ReverseString {
    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            "reverse_string",
            "Reverses the characters of the given text",
            schema::<TextArgs>(),
        )
    }

    async fn invoke(&self, args: Value, _ctx: &InvocationContext) -> Result<CapabilityOutput> {
        let args: TextArgs = parse_args("reverse_string", args)?;
        Ok(CapabilityOutput::text(args.text.chars().rev().collect::<String>()))
    }
}

// =============================================================================
// Greeting Module
// =============================================================================

pub const GREETING_TEXT: &str = "Hello! How can I help you today?";

pub struct GreetingModule;

impl CapabilityModule for GreetingModule {
    fn name(&self) -> &str {
        "greeting"
    }

    fn capabilities(&self) -> Result<Vec<Arc<dyn Capability>>> {
        Ok(vec![Arc::new(Greet)])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GreetArgs {
    /// What the user said.
    #[serde(default)]
    pub input: Option<String>,
}

pub struct Greet;

#[async_trait]
impl Capability for Greet {
    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            "greet",
            "Responds to a greeting such as hello or hi",
            schema::<GreetArgs>(),
        )
    }

    async fn invoke(&self, _args: Value, _ctx: &InvocationContext) -> Result<CapabilityOutput> {
        Ok(CapabilityOutput::text(GREETING_TEXT))
    }
}

// =============================================================================
// Human Approval Module
// =============================================================================

pub const HUMAN_APPROVAL: &str = "human_approval";
pub const PROCESS_APPROVAL: &str = "process_approval";

/// Approval request plus its follow-up, chained by a standard edge.
pub struct HumanModule;

impl CapabilityModule for HumanModule {
    fn name(&self) -> &str {
        "human"
    }

    fn capabilities(&self) -> Result<Vec<Arc<dyn Capability>>> {
        Ok(vec![Arc::new(HumanApproval), Arc::new(ProcessApproval)])
    }

    fn edges(&self) -> Vec<SpecialEdge> {
        vec![SpecialEdge::standard(HUMAN_APPROVAL, PROCESS_APPROVAL)]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalArgs {
    /// The action that needs sign-off.
    #[serde(default, alias = "input")]
    pub action: Option<String>,
}

pub struct HumanApproval;

#[async_trait]
impl Capability for HumanApproval {
    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            HUMAN_APPROVAL,
            "Asks a human to approve or reject an action before continuing",
            schema::<ApprovalArgs>(),
        )
    }

    async fn invoke(&self, args: Value, _ctx: &InvocationContext) -> Result<CapabilityOutput> {
        let args: ApprovalArgs = parse_args(HUMAN_APPROVAL, args)?;
        let action = args.action.unwrap_or_else(|| "this action".to_string());
        Ok(CapabilityOutput::text(format!(
            "Human approval required for: {}. Please reply 'approve' or 'reject'.",
            action
        ))
        .with_data(json!({"awaiting_approval": true, "action": action})))
    }
}

pub struct ProcessApproval;

/// Whether a reply grants approval.
pub fn is_approval(reply: &str) -> bool {
    reply
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .any(|w| w == "approve" || w == "approved")
}

#[async_trait]
impl Capability for ProcessApproval {
    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            PROCESS_APPROVAL,
            "Processes the user's approve or reject answer to a pending approval request",
            json!({"type": "object", "properties": {}}),
        )
    }

    async fn invoke(&self, _args: Value, ctx: &InvocationContext) -> Result<CapabilityOutput> {
        let reply = ctx.last_user_message().unwrap_or("");
        let approved = is_approval(reply);
        let content = if approved {
            "Approval received. Proceeding with the action."
        } else {
            "The action was rejected."
        };
        Ok(CapabilityOutput::text(content).with_data(json!({"approved": approved})))
    }
}

// =============================================================================
// Links Module
// =============================================================================

/// URLs mentioned in free text, in order of appearance.
pub fn extract_urls(text: &str) -> Vec<url::Url> {
    text.split_whitespace()
        .filter_map(|word| {
            let start = word.find("http://").or_else(|| word.find("https://"))?;
            let raw = word[start..].trim_end_matches(['.', ',', ')', ';', '!', '?', '>', '"', '\'']);
            url::Url::parse(raw).ok()
        })
        .collect()
}

pub struct LinksModule;

impl CapabilityModule for LinksModule {
    fn name(&self) -> &str {
        "links"
    }

    fn capabilities(&self) -> Result<Vec<Arc<dyn Capability>>> {
        Ok(vec![Arc::new(InspectLink)])
    }
}

pub struct InspectLink;

#[async_trait]
impl Capability for InspectLink {
    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            "inspect_link",
            "Extracts and describes the web links mentioned in a message",
            schema::<TextArgs>(),
        )
    }

    async fn invoke(&self, args: Value, _ctx: &InvocationContext) -> Result<CapabilityOutput> {
        let args: TextArgs = parse_args("inspect_link", args)?;
        let urls = extract_urls(&args.text);
        if urls.is_empty() {
            return Ok(CapabilityOutput::text("No links found in the message."));
        }

        let described: Vec<Value> = urls
            .iter()
            .map(|u| {
                json!({
                    "url": u.as_str(),
                    "scheme": u.scheme(),
                    "host": u.host_str(),
                    "path": u.path(),
                })
            })
            .collect();
        let lines: Vec<String> = urls
            .iter()
            .map(|u| format!("- {} (host: {})", u, u.host_str().unwrap_or("unknown")))
            .collect();

        Ok(CapabilityOutput::text(format!("Found {} link(s):\n{}", urls.len(), lines.join("\n")))
            .with_data(json!({ "links": described })))
    }
}

// =============================================================================
// Visualize Module
// =============================================================================

pub struct VisualizeModule;

impl CapabilityModule for VisualizeModule {
    fn name(&self) -> &str {
        "visualize"
    }

    fn capabilities(&self) -> Result<Vec<Arc<dyn Capability>>> {
        Ok(vec![Arc::new(VisualizeConversation)])
    }
}

/// Renders the conversation so far as a node/edge flow document.
pub struct VisualizeConversation;

const NODE_PREVIEW: usize = 80;

#[async_trait]
impl Capability for VisualizeConversation {
    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            "visualize_conversation",
            "Renders the current conversation as a flow diagram of nodes and edges",
            json!({"type": "object", "properties": {}}),
        )
    }

    async fn invoke(&self, _args: Value, ctx: &InvocationContext) -> Result<CapabilityOutput> {
        let visible: Vec<_> = ctx
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .collect();

        let nodes: Vec<Value> = visible
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let label: String = if m.has_tool_calls() {
                    let names: Vec<&str> = m.tool_calls.iter().map(|c| c.function.name.as_str()).collect();
                    format!("calls: {}", names.join(", "))
                } else {
                    m.text().chars().take(NODE_PREVIEW).collect()
                };
                json!({
                    "id": format!("node-{}", i),
                    "type": m.role.as_str(),
                    "position": {"x": 0, "y": i * 120},
                    "data": {"label": label},
                })
            })
            .collect();

        let edges: Vec<Value> = (1..visible.len())
            .map(|i| {
                json!({
                    "id": format!("edge-{}-{}", i - 1, i),
                    "source": format!("node-{}", i - 1),
                    "target": format!("node-{}", i),
                })
            })
            .collect();

        let flow = json!({
            "name": "conversation",
            "data": {"nodes": nodes, "edges": edges},
        });
        let rendered = serde_json::to_string_pretty(&flow)?;
        Ok(CapabilityOutput::text(rendered).with_data(flow))
    }
}

//! Routing traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{CapabilityDescriptor, ChatMessage, LABEL_END, LABEL_ERROR};

/// Next step chosen by a router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteLabel {
    Capability(String),
    End,
    Error,
}

impl RouteLabel {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Capability(name) => name,
            Self::End => LABEL_END,
            Self::Error => LABEL_ERROR,
        }
    }

    pub fn capability(&self) -> Option<&str> {
        match self {
            Self::Capability(name) => Some(name),
            _ => None,
        }
    }
}

/// How a decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Model,
    Override,
}

/// Per-call routing options.
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub session_id: Option<String>,
    pub turn_number: u32,
    /// Whether the keyword and URL override may short-circuit the model.
    pub allow_override: bool,
}

/// Result of one routing step.
#[derive(Debug, Clone)]
pub struct RouterDecision {
    pub label: RouteLabel,
    pub last_user_utterance: Option<String>,
    /// Messages the router wants appended to the conversation.
    pub appended: Vec<ChatMessage>,
    pub source: DecisionSource,
}

impl RouterDecision {
    pub fn is_error(&self) -> bool {
        self.label == RouteLabel::Error
    }
}

/// Maps a conversation to a next-capability label.
///
/// Never fails: every failure mode is expressed as [`RouteLabel::Error`]
/// with a diagnostic in `appended`.
#[async_trait]
pub trait CapabilityRouter: Send + Sync {
    async fn decide(
        &self,
        messages: &[ChatMessage],
        descriptors: &[CapabilityDescriptor],
        options: &RouteOptions,
    ) -> RouterDecision;
}

/// A proactive capability suggestion.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSuggestion {
    pub name: String,
    pub score: f32,
}

/// Suggests a capability for an utterance in auto tool-choice mode.
#[async_trait]
pub trait AutoRouter: Send + Sync {
    async fn suggest(&self, utterance: &str, candidates: &[CapabilityDescriptor]) -> Option<ToolSuggestion>;
}

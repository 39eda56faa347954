use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::capability::InvocationContext;
use super::chat::ToolChoice;
use super::message::{last_user_content, ChatMessage};

/// Per-turn conversation state.
///
/// The message log is append-only: there is no way to edit or remove an
/// entry once it has been pushed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationState {
    messages: Vec<ChatMessage>,

    /// Label chosen by the most recent router step.
    pub routing_decision: Option<String>,

    /// Free-form scratch data shared between nodes.
    #[serde(default)]
    pub scratch: Map<String, Value>,

    pub session_id: Option<String>,
    pub requested_tool_choice: Option<ToolChoice>,

    /// Set once the auto-router has nudged a call this turn.
    #[serde(default)]
    pub proactive_call_made: bool,

    pub model: Option<String>,
    pub context: Option<String>,
    pub group: Option<String>,
    #[serde(default)]
    pub turn_number: u32,
    pub original_input: Option<String>,
}

impl ConversationState {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_context(mut self, context: Option<String>, group: Option<String>) -> Self {
        self.context = context;
        self.group = group;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_turn(mut self, turn_number: u32) -> Self {
        self.turn_number = turn_number;
        self
    }

    pub fn append(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = ChatMessage>) {
        self.messages.extend(messages);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn last_user_message(&self) -> Option<&str> {
        last_user_content(&self.messages)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Snapshot of the request-scoped data handed to capabilities.
    pub fn invocation_context(&self) -> InvocationContext {
        InvocationContext {
            session_id: self.session_id.clone(),
            turn_number: self.turn_number,
            context: self.context.clone(),
            group: self.group.clone(),
            messages: self.messages.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_only_log() {
        let mut state = ConversationState::new(vec![ChatMessage::user("hi")]);
        state.append(ChatMessage::assistant("hello"));
        state.append(ChatMessage::user("bye"));
        assert_eq!(state.len(), 3);
        assert_eq!(state.last_user_message(), Some("bye"));
        assert_eq!(state.messages()[0].text(), "hi");
    }

    #[test]
    fn test_checkpoint_roundtrip_preserves_flags() {
        let mut state = ConversationState::new(vec![ChatMessage::user("hi")])
            .with_session(Some("s1".into()))
            .with_turn(3);
        state.proactive_call_made = true;
        let json = serde_json::to_string(&state).unwrap();
        let back: ConversationState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.turn_number, 3);
        assert!(back.proactive_call_made);
        assert_eq!(back.messages().len(), 1);
    }
}

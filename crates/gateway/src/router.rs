//! Model-backed router selecting the next capability for a turn.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use capgraph_core::{
    config::RouterConfig,
    traits::{
        CapabilityRouter, CompletionProvider, CompletionRequest, ConversationStore, DecisionSource, RouteLabel,
        RouteOptions, RouterDecision,
    },
    types::{last_user_content, CapabilityDescriptor, ChatMessage, ExecutionRecord, Role, LABEL_ERROR},
    Error, Result,
};
use capgraph_skills::PROCESS_APPROVAL;

/// Name attached to the router's own reply in the conversation.
pub const ROUTER_NAME: &str = "router";

/// Shape the model must answer with.
#[derive(Debug, Deserialize)]
struct RouterChoice {
    next_tool: Option<String>,
}

/// Chooses the next capability by asking the completion provider.
///
/// A deterministic override runs first: when the latest user message holds a
/// URL and one of the configured keywords as a whole word outside the URL, the
/// configured capability is picked without a model call.
pub struct RouterDecisionEngine {
    provider: Arc<dyn CompletionProvider>,
    url_pattern: Regex,
    keyword_pattern: Option<Regex>,
    override_capability: String,
    store: Option<Arc<dyn ConversationStore>>,
}

impl RouterDecisionEngine {
    pub fn new(provider: Arc<dyn CompletionProvider>, config: &RouterConfig) -> Result<Self> {
        let url_pattern = Regex::new(r"(?i)https?://\S+")
            .map_err(|e| Error::configuration(format!("invalid URL pattern: {}", e)))?;
        Ok(Self {
            provider,
            url_pattern,
            keyword_pattern: keyword_pattern(&config.override_keywords)?,
            override_capability: config.override_capability.clone(),
            store: None,
        })
    }

    /// Persist selection events to a conversation store.
    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn override_target(&self, utterance: &str, descriptors: &[CapabilityDescriptor]) -> Option<String> {
        if !descriptors.iter().any(|d| d.name == self.override_capability) {
            return None;
        }
        if !self.url_pattern.is_match(utterance) {
            return None;
        }
        let keywords = self.keyword_pattern.as_ref()?;
        let prose = self.url_pattern.replace_all(utterance, " ");
        keywords
            .is_match(&prose)
            .then(|| self.override_capability.clone())
    }

    async fn persist(&self, options: &RouteOptions, decision: &RouterDecision) {
        let (Some(store), Some(session_id)) = (&self.store, &options.session_id) else {
            return;
        };
        let record = ExecutionRecord::new(
            session_id.clone(),
            Role::System,
            format!("[router] selected {}", decision.label.as_str()),
        )
        .with_turn(options.turn_number)
        .with_success(!decision.is_error())
        .with_metadata("next_tool", json!(decision.label.as_str()))
        .with_metadata("source", json!(source_label(decision.source)));

        if let Err(e) = store.append_message(record).await {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to persist router decision");
        }
    }

    async fn finish(&self, options: &RouteOptions, decision: RouterDecision) -> RouterDecision {
        capgraph_governance::track_route_decision(decision.label.as_str(), source_label(decision.source));
        self.persist(options, &decision).await;
        decision
    }
}

/// Case-insensitive whole-word alternation of the override keywords.
fn keyword_pattern(keywords: &[String]) -> Result<Option<Regex>> {
    let alternatives: Vec<String> = keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .map(regex::escape)
        .collect();
    if alternatives.is_empty() {
        return Ok(None);
    }
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|")))
        .map(Some)
        .map_err(|e| Error::configuration(format!("invalid override keywords: {}", e)))
}

/// System instruction listing every candidate capability.
pub fn routing_prompt(descriptors: &[CapabilityDescriptor]) -> String {
    let listing = descriptors
        .iter()
        .map(|d| format!("- '{}': {}", d.name, d.description))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Select the capability best suited to the user's request from the following list.\n\
         {listing}\n\n\
         Special rule:\n\
         - If the previous system message asked for approval and the user replied with something \
         like 'approve' or 'reject', you must choose '{PROCESS_APPROVAL}'.\n\n\
         Respond only with JSON of the form: {{\"next_tool\": \"<capability name>\"}}"
    )
}

/// Extract a capability name from the model reply.
fn parse_choice(content: &str, descriptors: &[CapabilityDescriptor]) -> std::result::Result<String, String> {
    let choice: RouterChoice =
        serde_json::from_str(content.trim()).map_err(|e| format!("reply is not valid JSON ({})", e))?;
    let name = choice
        .next_tool
        .filter(|n| !n.is_empty())
        .ok_or_else(|| "reply has no 'next_tool' field".to_string())?;
    if descriptors.iter().any(|d| d.name == name) {
        Ok(name)
    } else {
        Err(format!("'{}' is not an available capability", name))
    }
}

fn source_label(source: DecisionSource) -> &'static str {
    match source {
        DecisionSource::Model => "model",
        DecisionSource::Override => "override",
    }
}

fn diagnostic(message: String) -> ChatMessage {
    ChatMessage::system(message).with_name(LABEL_ERROR)
}

#[async_trait]
impl CapabilityRouter for RouterDecisionEngine {
    async fn decide(
        &self,
        messages: &[ChatMessage],
        descriptors: &[CapabilityDescriptor],
        options: &RouteOptions,
    ) -> RouterDecision {
        let utterance = last_user_content(messages).map(str::to_string);

        if options.allow_override {
            if let Some(target) = utterance
                .as_deref()
                .and_then(|u| self.override_target(u, descriptors))
            {
                tracing::info!(capability = %target, "Router override matched");
                let decision = RouterDecision {
                    label: RouteLabel::Capability(target),
                    last_user_utterance: utterance,
                    appended: Vec::new(),
                    source: DecisionSource::Override,
                };
                return self.finish(options, decision).await;
            }
        }

        let mut prompt = messages.to_vec();
        prompt.push(ChatMessage::system(routing_prompt(descriptors)));
        let request = CompletionRequest::new(prompt)
            .with_model(options.model.clone())
            .with_temperature(options.temperature)
            .json_mode();

        let decision = match self.provider.complete(request).await {
            Err(e) => {
                tracing::error!(error = %e, "Router completion call failed");
                RouterDecision {
                    label: RouteLabel::Error,
                    last_user_utterance: utterance,
                    appended: vec![diagnostic(format!("Router completion call failed: {}", e))],
                    source: DecisionSource::Model,
                }
            }
            Ok(reply) => {
                let parsed = parse_choice(reply.text(), descriptors);
                let reply = reply.with_name(ROUTER_NAME);
                match parsed {
                    Ok(name) => {
                        tracing::info!(capability = %name, "Router selected capability");
                        RouterDecision {
                            label: RouteLabel::Capability(name),
                            last_user_utterance: utterance,
                            appended: vec![reply],
                            source: DecisionSource::Model,
                        }
                    }
                    Err(reason) => {
                        tracing::warn!(reason = %reason, "Router reply rejected");
                        RouterDecision {
                            label: RouteLabel::Error,
                            last_user_utterance: utterance,
                            appended: vec![
                                reply,
                                diagnostic(format!("Router failed to parse the model reply: {}", reason)),
                            ],
                            source: DecisionSource::Model,
                        }
                    }
                }
            }
        };

        self.finish(options, decision).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capgraph_core::config::AppConfig;
    use capgraph_core::mocks::{RecordingStore, ScriptedProvider};
    use capgraph_core::traits::ResponseFormat;
    use serde_json::json;

    fn descriptors(names: &[&str]) -> Vec<CapabilityDescriptor> {
        names
            .iter()
            .map(|n| CapabilityDescriptor::new(*n, format!("{} things", n), json!({"type": "object"})))
            .collect()
    }

    fn engine(provider: Arc<ScriptedProvider>) -> RouterDecisionEngine {
        RouterDecisionEngine::new(provider, &AppConfig::default().router).unwrap()
    }

    fn options() -> RouteOptions {
        RouteOptions {
            allow_override: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_model_selection() {
        let provider = Arc::new(ScriptedProvider::texts(&[r#"{"next_tool": "greet"}"#]));
        let router = engine(provider.clone());
        let decision = router
            .decide(&[ChatMessage::user("hello")], &descriptors(&["greet", "to_uppercase"]), &options())
            .await;

        assert_eq!(decision.label, RouteLabel::Capability("greet".into()));
        assert_eq!(decision.last_user_utterance.as_deref(), Some("hello"));
        assert_eq!(decision.appended.len(), 1);
        assert_eq!(decision.appended[0].name.as_deref(), Some(ROUTER_NAME));

        let requests = provider.requests();
        assert_eq!(requests[0].response_format, ResponseFormat::JsonObject);
        let prompt = requests[0].messages.last().unwrap().text().to_string();
        assert!(prompt.contains("- 'greet': greet things"));
        assert!(prompt.contains("process_approval"));
        assert!(prompt.contains("next_tool"));
    }

    #[tokio::test]
    async fn test_unknown_capability_is_error() {
        let provider = Arc::new(ScriptedProvider::texts(&[r#"{"next_tool": "launch_rockets"}"#]));
        let decision = engine(provider)
            .decide(&[ChatMessage::user("hello")], &descriptors(&["greet"]), &options())
            .await;

        assert!(decision.is_error());
        let diag = decision.appended.last().unwrap();
        assert_eq!(diag.role, Role::System);
        assert_eq!(diag.name.as_deref(), Some(LABEL_ERROR));
        assert!(diag.text().contains("launch_rockets"));
    }

    #[tokio::test]
    async fn test_unparseable_reply_is_error() {
        let provider = Arc::new(ScriptedProvider::texts(&["I think greet would be best"]));
        let decision = engine(provider)
            .decide(&[ChatMessage::user("hello")], &descriptors(&["greet"]), &options())
            .await;
        assert!(decision.is_error());
    }

    #[tokio::test]
    async fn test_missing_field_is_error() {
        let provider = Arc::new(ScriptedProvider::texts(&[r#"{"tool": "greet"}"#]));
        let decision = engine(provider)
            .decide(&[ChatMessage::user("hello")], &descriptors(&["greet"]), &options())
            .await;
        assert!(decision.is_error());
    }

    #[tokio::test]
    async fn test_provider_failure_is_error() {
        let provider = Arc::new(ScriptedProvider::failing("connection reset"));
        let decision = engine(provider)
            .decide(&[ChatMessage::user("hello")], &descriptors(&["greet"]), &options())
            .await;
        assert!(decision.is_error());
        assert_eq!(decision.appended.len(), 1);
        assert!(decision.appended[0].text().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_override_skips_model() {
        let provider = Arc::new(ScriptedProvider::texts(&[]));
        let decision = engine(provider.clone())
            .decide(
                &[ChatMessage::user("Summarize this LINK: https://example.com/post")],
                &descriptors(&["greet", "inspect_link"]),
                &options(),
            )
            .await;

        assert_eq!(decision.label, RouteLabel::Capability("inspect_link".into()));
        assert_eq!(decision.source, DecisionSource::Override);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_override_requires_keyword_and_capability() {
        // URL without keyword goes to the model.
        let provider = Arc::new(ScriptedProvider::texts(&[r#"{"next_tool": "greet"}"#]));
        let decision = engine(provider.clone())
            .decide(
                &[ChatMessage::user("https://example.com")],
                &descriptors(&["greet", "inspect_link"]),
                &options(),
            )
            .await;
        assert_eq!(decision.source, DecisionSource::Model);
        assert_eq!(provider.call_count(), 1);

        // Override target not offered.
        let provider = Arc::new(ScriptedProvider::texts(&[r#"{"next_tool": "greet"}"#]));
        let decision = engine(provider.clone())
            .decide(
                &[ChatMessage::user("open this link https://example.com")],
                &descriptors(&["greet"]),
                &options(),
            )
            .await;
        assert_eq!(decision.source, DecisionSource::Model);

        // Override disabled by the caller.
        let provider = Arc::new(ScriptedProvider::texts(&[r#"{"next_tool": "greet"}"#]));
        let decision = engine(provider.clone())
            .decide(
                &[ChatMessage::user("open this link https://example.com")],
                &descriptors(&["greet", "inspect_link"]),
                &RouteOptions::default(),
            )
            .await;
        assert_eq!(decision.label, RouteLabel::Capability("greet".into()));
    }

    #[tokio::test]
    async fn test_override_matches_whole_words_outside_url() {
        for text in [
            "run curl https://sh.rustup.rs to install rust",
            "the blinking cursor at https://example.com is odd",
            "what is https://example.com/link/page about",
        ] {
            let provider = Arc::new(ScriptedProvider::texts(&[r#"{"next_tool": "greet"}"#]));
            let decision = engine(provider.clone())
                .decide(&[ChatMessage::user(text)], &descriptors(&["greet", "inspect_link"]), &options())
                .await;
            assert_eq!(decision.source, DecisionSource::Model, "{}", text);
            assert_eq!(decision.label, RouteLabel::Capability("greet".into()));
            assert_eq!(provider.call_count(), 1);
        }

        let provider = Arc::new(ScriptedProvider::texts(&[]));
        let decision = engine(provider)
            .decide(
                &[ChatMessage::user("what does this url say? https://example.com")],
                &descriptors(&["greet", "inspect_link"]),
                &options(),
            )
            .await;
        assert_eq!(decision.source, DecisionSource::Override);
    }

    #[tokio::test]
    async fn test_selection_is_persisted_best_effort() {
        let store = Arc::new(RecordingStore::new());
        let provider = Arc::new(ScriptedProvider::texts(&[r#"{"next_tool": "greet"}"#]));
        let router = engine(provider).with_store(store.clone());
        let opts = RouteOptions {
            session_id: Some("s1".into()),
            turn_number: 3,
            ..Default::default()
        };
        router.decide(&[ChatMessage::user("hi")], &descriptors(&["greet"]), &opts).await;

        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].turn_number, 3);
        assert_eq!(records[0].metadata["next_tool"], "greet");

        let failing = Arc::new(RecordingStore::failing());
        let provider = Arc::new(ScriptedProvider::texts(&[r#"{"next_tool": "greet"}"#]));
        let decision = engine(provider)
            .with_store(failing)
            .decide(&[ChatMessage::user("hi")], &descriptors(&["greet"]), &opts)
            .await;
        assert_eq!(decision.label, RouteLabel::Capability("greet".into()));
    }
}

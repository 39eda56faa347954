//! OpenAI-style function calling with mixed server and client tools.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use capgraph_core::{
    traits::{AutoRouter, CompletionProvider, CompletionRequest},
    types::{
        ChatMessage, ConversationState, InvocationRequest, InvocationResult, ToolCall, ToolChoice,
        ToolChoiceMode, ToolSchema, RUN_BEST_WORKFLOW,
    },
    Error, Result,
};
use capgraph_skills::CapabilityRegistry;

use crate::tracker::ExecutionTracker;

/// Client-side options for one function-calling turn.
#[derive(Debug, Clone, Default)]
pub struct FunctionCallOptions {
    /// Tool schemas declared by the client.
    pub client_tools: Vec<ToolSchema>,
    pub tool_choice: Option<ToolChoice>,
    /// Fallback arguments for a forced server capability.
    pub tool_input: Option<Value>,
    pub temperature: Option<f32>,
}

/// Result of a function-calling turn.
#[derive(Debug, Clone)]
pub struct FunctionCallOutcome {
    pub state: ConversationState,
    /// Message to return to the client.
    pub response: ChatMessage,
    pub server_results: Vec<InvocationResult>,
    /// Calls the client must execute itself.
    pub deferred: Vec<ToolCall>,
    pub second_pass: bool,
}

/// Merge schemas by function name. Later entries replace earlier ones in place.
pub fn merge_tool_schemas(server: Vec<ToolSchema>, client: Vec<ToolSchema>) -> Vec<ToolSchema> {
    let mut merged: Vec<ToolSchema> = Vec::new();
    for schema in server.into_iter().chain(client) {
        match merged.iter_mut().find(|s| s.function.name == schema.function.name) {
            Some(existing) => *existing = schema,
            None => merged.push(schema),
        }
    }
    merged
}

pub struct FunctionCallingFlow {
    provider: Arc<dyn CompletionProvider>,
    registry: Arc<CapabilityRegistry>,
    tracker: Arc<ExecutionTracker>,
    auto_router: Option<Arc<dyn AutoRouter>>,
}

impl FunctionCallingFlow {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        registry: Arc<CapabilityRegistry>,
        tracker: Arc<ExecutionTracker>,
    ) -> Self {
        Self {
            provider,
            registry,
            tracker,
            auto_router: None,
        }
    }

    pub fn with_auto_router(mut self, auto_router: Arc<dyn AutoRouter>) -> Self {
        self.auto_router = Some(auto_router);
        self
    }

    pub async fn run(&self, mut state: ConversationState, options: FunctionCallOptions) -> Result<FunctionCallOutcome> {
        let view = self
            .registry
            .for_context(state.context.as_deref(), state.group.as_deref())
            .await;
        let server_descriptors: Vec<_> = view
            .descriptors
            .iter()
            .filter(|d| d.name != RUN_BEST_WORKFLOW)
            .cloned()
            .collect();
        let server_schemas = server_descriptors.iter().map(|d| d.to_tool_schema()).collect();
        let tools = merge_tool_schemas(server_schemas, options.client_tools.clone());
        let allowed: HashSet<&str> = tools.iter().map(|t| t.function.name.as_str()).collect();

        state.requested_tool_choice = options.tool_choice.clone();

        let mut choice = options.tool_choice.clone();
        if let Some(forced) = choice.as_ref().and_then(ToolChoice::forced_name) {
            if !allowed.contains(forced) {
                return Err(Error::invalid_request(format!(
                    "tool_choice names unknown function '{}'",
                    forced
                )));
            }
        }

        let tools_disabled = choice.as_ref().is_some_and(ToolChoice::is_none);
        let nudgeable = matches!(choice, None | Some(ToolChoice::Mode(ToolChoiceMode::Auto)));
        if nudgeable && !state.proactive_call_made {
            if let Some(auto_router) = &self.auto_router {
                let utterance = state.last_user_message().unwrap_or_default().to_string();
                if let Some(suggestion) = auto_router.suggest(&utterance, &server_descriptors).await {
                    if allowed.contains(suggestion.name.as_str()) {
                        tracing::info!(capability = %suggestion.name, score = suggestion.score, "Auto-router nudging tool choice");
                        state.append(ChatMessage::system(format!(
                            "The capability '{}' is likely relevant to this request. Call it if it helps.",
                            suggestion.name
                        )));
                        choice = Some(ToolChoice::named(suggestion.name.clone()));
                        state.proactive_call_made = true;
                    }
                }
            }
        }

        let mut request = CompletionRequest::new(state.messages().to_vec())
            .with_model(state.model.clone())
            .with_temperature(options.temperature);
        if !tools_disabled {
            request = request.with_tools(tools.clone()).with_tool_choice(choice.clone());
        }

        let first = self.provider.complete(request).await?;
        state.append(first.clone());

        if tools_disabled || !first.has_tool_calls() {
            return Ok(FunctionCallOutcome {
                state,
                response: first,
                server_results: Vec::new(),
                deferred: Vec::new(),
                second_pass: false,
            });
        }

        let (server_calls, deferred): (Vec<ToolCall>, Vec<ToolCall>) = first
            .tool_calls
            .iter()
            .cloned()
            .partition(|call| view.get(&call.function.name).is_some());

        let forced_name = options.tool_choice.as_ref().and_then(ToolChoice::forced_name);
        let mut server_results = Vec::new();
        for call in &server_calls {
            let name = call.function.name.as_str();
            let Some(capability) = view.get(name) else {
                continue;
            };

            let args = match parse_arguments(&call.function.arguments) {
                Ok(args) if is_empty_args(&args) && forced_name == Some(name) => {
                    options.tool_input.clone().unwrap_or(args)
                }
                Ok(args) => args,
                Err(e) => {
                    tracing::warn!(capability = %name, error = %e, "Invalid tool call arguments");
                    state.append(ChatMessage::tool(
                        call.id.clone(),
                        name,
                        format!("Error executing tool: {}", e),
                    ));
                    continue;
                }
            };

            let request = InvocationRequest::new(name, args).with_id(call.id.clone());
            let tracked = self.tracker.run(&capability, request, &state.invocation_context()).await;
            let content = if tracked.success() {
                tracked.output.content.clone()
            } else {
                format!("Error executing tool: {}", tracked.output.content)
            };
            state.append(ChatMessage::tool(call.id.clone(), name, content));
            server_results.push(tracked.result);
        }

        tracing::info!(
            server = server_calls.len(),
            deferred = deferred.len(),
            "Tool calls partitioned"
        );

        if server_calls.is_empty() || !deferred.is_empty() {
            return Ok(FunctionCallOutcome {
                state,
                response: first,
                server_results,
                deferred,
                second_pass: false,
            });
        }

        let follow_up = CompletionRequest::new(state.messages().to_vec())
            .with_model(state.model.clone())
            .with_temperature(options.temperature);
        let second = self.provider.complete(follow_up).await?;
        state.append(second.clone());

        Ok(FunctionCallOutcome {
            state,
            response: second,
            server_results,
            deferred,
            second_pass: true,
        })
    }
}

fn parse_arguments(raw: &str) -> Result<Value> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    Ok(serde_json::from_str(raw)?)
}

fn is_empty_args(args: &Value) -> bool {
    match args {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use capgraph_core::config::TrackerConfig;
    use capgraph_core::mocks::{ScriptedProvider, StaticCapability, StaticModule};
    use capgraph_core::traits::{Capability, ToolSuggestion};
    use capgraph_core::types::{CapabilityDescriptor, FunctionSchema, Role};
    use serde_json::json;

    fn tracker() -> Arc<ExecutionTracker> {
        Arc::new(ExecutionTracker::new(&TrackerConfig {
            preview_limit: 100,
            content_limit: 200,
            timeout_ms: 1_000,
        }))
    }

    async fn registry(caps: Vec<Arc<dyn Capability>>) -> Arc<CapabilityRegistry> {
        let registry = CapabilityRegistry::new(vec![Arc::new(StaticModule::new("m", caps))]);
        registry.load().await.unwrap();
        Arc::new(registry)
    }

    fn client_tool(name: &str) -> ToolSchema {
        ToolSchema {
            kind: "function".into(),
            function: FunctionSchema {
                name: name.into(),
                description: Some("client side".into()),
                parameters: json!({"type": "object"}),
            },
        }
    }

    fn state(text: &str) -> ConversationState {
        ConversationState::new(vec![ChatMessage::user(text)])
    }

    #[test]
    fn test_merge_later_wins_in_place() {
        let server = vec![client_tool("a"), client_tool("b")];
        let mut replacement = client_tool("a");
        replacement.function.description = Some("client version".into());
        let merged = merge_tool_schemas(server, vec![replacement, client_tool("c")]);
        let names: Vec<_> = merged.iter().map(|t| t.function.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(merged[0].function.description.as_deref(), Some("client version"));
    }

    #[tokio::test]
    async fn test_forced_client_only_tool_returns_first_pass() {
        let provider = Arc::new(ScriptedProvider::new(vec![ChatMessage::assistant_tool_calls(vec![
            ToolCall::new("call_1", "open_drawer", r#"{"id": 3}"#),
        ])]));
        let flow = FunctionCallingFlow::new(provider.clone(), registry(vec![]).await, tracker());

        let outcome = flow
            .run(
                state("open the drawer"),
                FunctionCallOptions {
                    client_tools: vec![client_tool("open_drawer")],
                    tool_choice: Some(ToolChoice::named("open_drawer")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(provider.call_count(), 1);
        assert!(!outcome.second_pass);
        assert_eq!(outcome.deferred.len(), 1);
        assert_eq!(outcome.response.tool_calls[0].function.name, "open_drawer");
        let request = &provider.requests()[0];
        assert_eq!(request.tool_choice, Some(ToolChoice::named("open_drawer")));
    }

    #[tokio::test]
    async fn test_server_call_executes_then_second_pass() {
        let upper = Arc::new(StaticCapability::new("to_uppercase", "upper", "HELLO"));
        let provider = Arc::new(ScriptedProvider::new(vec![
            ChatMessage::assistant_tool_calls(vec![ToolCall::new("call_9", "to_uppercase", r#"{"text": "hello"}"#)]),
            ChatMessage::assistant("The result is HELLO"),
        ]));
        let flow = FunctionCallingFlow::new(provider.clone(), registry(vec![upper.clone()]).await, tracker());

        let outcome = flow.run(state("shout hello"), FunctionCallOptions::default()).await.unwrap();
        assert!(outcome.second_pass);
        assert_eq!(outcome.response.text(), "The result is HELLO");
        assert_eq!(upper.calls()[0], json!({"text": "hello"}));
        assert_eq!(outcome.server_results[0].id, "call_9");

        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        assert!(!requests[0].tools.is_empty());
        assert!(requests[1].tools.is_empty());
        let tool_msg = requests[1].messages.iter().find(|m| m.role == Role::Tool).unwrap();
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_9"));
        assert_eq!(tool_msg.text(), "HELLO");
    }

    #[tokio::test]
    async fn test_mixed_calls_skip_second_pass() {
        let upper = Arc::new(StaticCapability::new("to_uppercase", "upper", "HELLO"));
        let provider = Arc::new(ScriptedProvider::new(vec![ChatMessage::assistant_tool_calls(vec![
            ToolCall::new("c1", "to_uppercase", "{}"),
            ToolCall::new("c2", "client_only", "{}"),
        ])]));
        let flow = FunctionCallingFlow::new(provider.clone(), registry(vec![upper.clone()]).await, tracker());
        let outcome = flow
            .run(
                state("both"),
                FunctionCallOptions {
                    client_tools: vec![client_tool("client_only")],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(provider.call_count(), 1);
        assert_eq!(upper.call_count(), 1);
        assert_eq!(outcome.deferred[0].id, "c2");
        assert!(!outcome.second_pass);
    }

    #[tokio::test]
    async fn test_none_choice_attaches_no_tools() {
        let provider = Arc::new(ScriptedProvider::texts(&["plain answer"]));
        let flow = FunctionCallingFlow::new(provider.clone(), registry(vec![]).await, tracker());
        let outcome = flow
            .run(
                state("hi"),
                FunctionCallOptions {
                    client_tools: vec![client_tool("x")],
                    tool_choice: Some(ToolChoice::Mode(ToolChoiceMode::None)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.response.text(), "plain answer");
        let request = &provider.requests()[0];
        assert!(request.tools.is_empty());
        assert!(request.tool_choice.is_none());
    }

    #[tokio::test]
    async fn test_unknown_forced_choice_is_rejected() {
        let provider = Arc::new(ScriptedProvider::texts(&[]));
        let flow = FunctionCallingFlow::new(provider.clone(), registry(vec![]).await, tracker());
        let result = flow
            .run(
                state("hi"),
                FunctionCallOptions {
                    tool_choice: Some(ToolChoice::named("ghost")),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_tool_input_fills_empty_forced_arguments() {
        let upper = Arc::new(StaticCapability::new("to_uppercase", "upper", "ABC"));
        let provider = Arc::new(ScriptedProvider::new(vec![
            ChatMessage::assistant_tool_calls(vec![ToolCall::new("c1", "to_uppercase", "")]),
            ChatMessage::assistant("ABC"),
        ]));
        let flow = FunctionCallingFlow::new(provider.clone(), registry(vec![upper.clone()]).await, tracker());
        flow.run(
            state("go"),
            FunctionCallOptions {
                tool_choice: Some(ToolChoice::named("to_uppercase")),
                tool_input: Some(json!({"text": "abc"})),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(upper.calls()[0], json!({"text": "abc"}));
    }

    #[tokio::test]
    async fn test_invalid_arguments_produce_error_tool_message() {
        let upper = Arc::new(StaticCapability::new("to_uppercase", "upper", "X"));
        let provider = Arc::new(ScriptedProvider::new(vec![
            ChatMessage::assistant_tool_calls(vec![ToolCall::new("c1", "to_uppercase", "{not json")]),
            ChatMessage::assistant("sorry"),
        ]));
        let flow = FunctionCallingFlow::new(provider.clone(), registry(vec![upper.clone()]).await, tracker());
        let outcome = flow.run(state("go"), FunctionCallOptions::default()).await.unwrap();
        assert_eq!(upper.call_count(), 0);
        let tool_msg = outcome.state.messages().iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_msg.text().starts_with("Error executing tool:"));
    }

    struct AlwaysSuggest(&'static str);

    #[async_trait]
    impl AutoRouter for AlwaysSuggest {
        async fn suggest(&self, _utterance: &str, _candidates: &[CapabilityDescriptor]) -> Option<ToolSuggestion> {
            Some(ToolSuggestion {
                name: self.0.to_string(),
                score: 1.0,
            })
        }
    }

    #[tokio::test]
    async fn test_auto_router_nudges_once() {
        let upper = Arc::new(StaticCapability::new("to_uppercase", "upper", "X"));
        let provider = Arc::new(ScriptedProvider::texts(&["no call"]));
        let flow = FunctionCallingFlow::new(provider.clone(), registry(vec![upper]).await, tracker())
            .with_auto_router(Arc::new(AlwaysSuggest("to_uppercase")));

        let outcome = flow.run(state("shout"), FunctionCallOptions::default()).await.unwrap();
        assert!(outcome.state.proactive_call_made);
        let request = &provider.requests()[0];
        assert_eq!(request.tool_choice, Some(ToolChoice::named("to_uppercase")));
        assert!(request.messages.iter().any(|m| m.role == Role::System && m.text().contains("to_uppercase")));
    }

    #[tokio::test]
    async fn test_auto_router_never_overrides_explicit_choice() {
        let upper = Arc::new(StaticCapability::new("to_uppercase", "upper", "X"));
        let provider = Arc::new(ScriptedProvider::texts(&["no call"]));
        let flow = FunctionCallingFlow::new(provider.clone(), registry(vec![upper]).await, tracker())
            .with_auto_router(Arc::new(AlwaysSuggest("to_uppercase")));

        let outcome = flow
            .run(
                state("shout"),
                FunctionCallOptions {
                    tool_choice: Some(ToolChoice::Mode(ToolChoiceMode::Required)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!outcome.state.proactive_call_made);
        assert_eq!(
            provider.requests()[0].tool_choice,
            Some(ToolChoice::Mode(ToolChoiceMode::Required))
        );
    }
}

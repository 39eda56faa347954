//! Two-phase select/execute dispatch for contexts served without the graph.

use serde_json::{json, Value};
use std::sync::Arc;

use capgraph_core::{
    traits::{CapabilityRouter, CompletionProvider, CompletionRequest, RouteLabel, RouteOptions},
    types::{ChatMessage, ConversationState, InvocationRequest, RemoteWorkflow, LABEL_ERROR, RUN_BEST_WORKFLOW},
    Result,
};
use capgraph_skills::{CapabilityRegistry, ContextView};

use crate::tracker::{ExecutionTracker, TrackedInvocation};

/// Outcome of one dispatched turn.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub state: ConversationState,
    /// Local capability or remote workflow that ran, if any.
    pub capability: Option<String>,
    pub success: bool,
}

impl DispatchOutcome {
    pub fn reply(&self) -> Option<&ChatMessage> {
        self.state.last_message()
    }
}

/// Selects one capability for a context and executes it.
pub struct DispatchCoordinator {
    provider: Arc<dyn CompletionProvider>,
    router: Arc<dyn CapabilityRouter>,
    registry: Arc<CapabilityRegistry>,
    tracker: Arc<ExecutionTracker>,
    visualize_capability: String,
}

impl DispatchCoordinator {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        router: Arc<dyn CapabilityRouter>,
        registry: Arc<CapabilityRegistry>,
        tracker: Arc<ExecutionTracker>,
    ) -> Self {
        Self {
            provider,
            router,
            registry,
            tracker,
            visualize_capability: "visualize_conversation".into(),
        }
    }

    /// Capability whose raw output is returned without synthesis.
    pub fn with_visualize_capability(mut self, name: impl Into<String>) -> Self {
        self.visualize_capability = name.into();
        self
    }

    pub async fn dispatch(&self, mut state: ConversationState) -> Result<DispatchOutcome> {
        let view = self
            .registry
            .for_context(state.context.as_deref(), state.group.as_deref())
            .await;
        let utterance = state.last_user_message().unwrap_or_default().to_string();
        state.original_input = Some(utterance.clone());

        if view.descriptors.is_empty() {
            return Ok(abort(state, "No capabilities are available for this context."));
        }

        // Select
        let options = RouteOptions {
            model: state.model.clone(),
            temperature: Some(0.0),
            session_id: state.session_id.clone(),
            turn_number: state.turn_number,
            allow_override: false,
        };
        let decision = self.router.decide(state.messages(), &view.descriptors, &options).await;
        state.routing_decision = Some(decision.label.as_str().to_string());
        let cause = decision
            .appended
            .iter()
            .rev()
            .find(|m| m.name.as_deref() == Some(LABEL_ERROR))
            .map(|m| m.text().to_string());
        state.extend(decision.appended);

        let name = match decision.label {
            RouteLabel::Capability(name) => name,
            label => {
                tracing::warn!(label = %label.as_str(), cause = ?cause, "Dispatch selection failed");
                let message = match cause {
                    Some(cause) => format!(
                        "I couldn't determine which capability should handle this request ({}).",
                        cause
                    ),
                    None => "I couldn't determine which capability should handle this request.".to_string(),
                };
                return Ok(abort(state, &message));
            }
        };

        // Execute
        let args = json!({ "input": utterance });
        let (executed, tracked) = if name == RUN_BEST_WORKFLOW {
            let Some(workflow) = self.pick_workflow(&state, &view, &utterance).await else {
                return Ok(abort(state, "I couldn't find a suitable workflow for this request."));
            };
            let Some(capability) = view.workflow(&workflow) else {
                return Ok(abort(state, "The selected workflow is not available."));
            };
            tracing::info!(workflow = %workflow, "Delegating to remote workflow");
            let tracked = self
                .tracker
                .run(&capability, InvocationRequest::new(workflow.clone(), args), &state.invocation_context())
                .await;
            (workflow, tracked)
        } else {
            let Some(capability) = view.get(&name) else {
                return Ok(abort(state, &format!("Capability '{}' is not available.", name)));
            };
            let tracked = self
                .tracker
                .run(&capability, InvocationRequest::new(name.clone(), args), &state.invocation_context())
                .await;
            (name, tracked)
        };

        if executed == self.visualize_capability {
            state.append(ChatMessage::assistant(tracked.output.content.clone()).with_name(executed.clone()));
            return Ok(DispatchOutcome {
                state,
                success: tracked.success(),
                capability: Some(executed),
            });
        }

        self.synthesize(state, executed, tracked).await
    }

    async fn synthesize(
        &self,
        mut state: ConversationState,
        executed: String,
        tracked: TrackedInvocation,
    ) -> Result<DispatchOutcome> {
        let payload = serde_json::to_string(&tracked.output.payload())?;
        state.append(
            ChatMessage::system(format!("Result of capability '{}': {}", executed, payload))
                .with_name(executed.clone()),
        );

        let request = CompletionRequest::new(state.messages().to_vec()).with_model(state.model.clone());
        let reply = self.provider.complete(request).await?;
        state.append(reply);

        Ok(DispatchOutcome {
            state,
            success: tracked.success(),
            capability: Some(executed),
        })
    }

    /// Ask the model to choose one workflow by exact name.
    async fn pick_workflow(
        &self,
        state: &ConversationState,
        view: &ContextView,
        utterance: &str,
    ) -> Option<String> {
        let prompt = workflow_prompt(&view.workflows);
        let request = CompletionRequest::new(vec![ChatMessage::system(prompt), ChatMessage::user(utterance)])
            .with_model(state.model.clone())
            .with_temperature(Some(0.0))
            .json_mode();

        let reply = match self.provider.complete(request).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(error = %e, "Workflow selection call failed");
                return None;
            }
        };

        let chosen = serde_json::from_str::<Value>(reply.text())
            .ok()
            .and_then(|v| v.get("workflow").and_then(Value::as_str).map(str::to_string));
        match chosen {
            Some(name) if view.workflows.iter().any(|w| w.name == name) => Some(name),
            other => {
                tracing::warn!(reply = %reply.text(), chosen = ?other, "Workflow selection out of set");
                None
            }
        }
    }
}

fn workflow_prompt(workflows: &[RemoteWorkflow]) -> String {
    let listing: Vec<String> = workflows
        .iter()
        .map(|w| format!("- '{}': {}", w.name, w.description))
        .collect();
    format!(
        "Choose the single workflow that best serves the user's request.\n\
         Available workflows:\n{}\n\n\
         Respond with a JSON object only, in the form {{\"workflow\": \"<name>\"}}, \
         using one of the names above exactly.",
        listing.join("\n")
    )
}

fn abort(mut state: ConversationState, message: &str) -> DispatchOutcome {
    state.append(ChatMessage::assistant(message));
    DispatchOutcome {
        state,
        capability: None,
        success: false,
    }
}

//! Per-request protocol selection and session bookkeeping.

use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;

use capgraph_controller::{
    ConversationGraph, DispatchCoordinator, ExecutionTracker, FunctionCallOptions, FunctionCallingFlow, GraphRun,
    InMemoryCheckpointStore, InMemoryConversationStore, RunStatus,
};
use capgraph_core::{
    config::{AppConfig, GraphConfig},
    traits::{AutoRouter, CapabilityRouter, CheckpointStore, CompletionProvider, ConversationStore},
    types::{
        last_user_content, CapabilityDescriptor, ChatCompletionRequest, ChatMessage, ConversationState,
        ExecutionRecord, Role,
    },
    Error, Result,
};
use capgraph_skills::{CapabilityRegistry, RegistrySnapshot};

use crate::auto_router::KeywordAutoRouter;
use crate::router::RouterDecisionEngine;
use crate::streaming::StreamingResponder;

/// Reply used when a completed graph run produced no assistant message.
pub const NO_REPLY_TEXT: &str = "I don't have a response for that request.";

const LOG_LIMIT: usize = 400;

/// Collapse whitespace and cap length for request logs.
pub fn shorten_for_log(text: &str, limit: usize) -> String {
    let compact = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let total = compact.chars().count();
    if total <= limit {
        return compact;
    }
    let head: String = compact.chars().take(limit).collect();
    format!("{}…(+{} chars)", head, total - limit)
}

// =============================================================================
// Application Context
// =============================================================================

/// Collaborators shared by every request, built once at startup.
pub struct AppContext {
    pub provider: Arc<dyn CompletionProvider>,
    pub registry: Arc<CapabilityRegistry>,
    pub router: Arc<dyn CapabilityRouter>,
    pub auto_router: Option<Arc<dyn AutoRouter>>,
    pub tracker: Arc<ExecutionTracker>,
    pub store: Arc<dyn ConversationStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub streaming: StreamingResponder,
    pub graph: GraphConfig,
    pub history_window: usize,
    pub default_model: String,
}

impl AppContext {
    /// Wire the default in-memory stores, the model-backed router and the
    /// keyword auto-router around a provider and registry.
    pub fn from_config(
        config: &AppConfig,
        provider: Arc<dyn CompletionProvider>,
        registry: Arc<CapabilityRegistry>,
    ) -> Result<Self> {
        let store: Arc<dyn ConversationStore> = Arc::new(InMemoryConversationStore::new());
        let router = RouterDecisionEngine::new(provider.clone(), &config.router)?.with_store(store.clone());
        let tracker = ExecutionTracker::new(&config.tracker).with_store(store.clone());

        Ok(Self {
            provider,
            registry,
            router: Arc::new(router),
            auto_router: Some(Arc::new(KeywordAutoRouter::new())),
            tracker: Arc::new(tracker),
            store,
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            streaming: StreamingResponder::from_config(&config.streaming),
            graph: config.graph.clone(),
            history_window: config.server.history_window,
            default_model: config.provider.default_model.clone(),
        })
    }

    fn build_graph(&self, snapshot: &RegistrySnapshot) -> Result<ConversationGraph> {
        let approval: Vec<String> = self
            .graph
            .approval_capabilities
            .iter()
            .filter(|name| {
                let present = snapshot.contains(name);
                if !present {
                    tracing::warn!(capability = %name, "Approval capability not registered; ignoring");
                }
                present
            })
            .cloned()
            .collect();

        ConversationGraph::builder()
            .with_snapshot(snapshot)
            .with_router(self.router.clone())
            .with_tracker(self.tracker.clone())
            .with_checkpoints(self.checkpoints.clone())
            .with_approval(approval)
            .with_max_steps(self.graph.max_steps)
            .build()
    }
}

// =============================================================================
// Turn Results
// =============================================================================

/// Protocol used to serve one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnMode {
    /// Continue a run suspended for human approval.
    Resume,
    FunctionCalling,
    Dispatch,
    Graph,
}

impl TurnMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnMode::Resume => "resume",
            TurnMode::FunctionCalling => "function_calling",
            TurnMode::Dispatch => "dispatch",
            TurnMode::Graph => "graph",
        }
    }
}

/// Final message of a turn plus what produced it.
#[derive(Debug, Clone)]
pub struct TurnReply {
    pub mode: TurnMode,
    pub model: String,
    pub message: ChatMessage,
    /// Last capability executed during the turn.
    pub capability: Option<String>,
    pub success: bool,
    /// Set when the turn ended in the error terminal.
    pub error: Option<String>,
    /// Whether the turn is waiting on a human reply.
    pub suspended: bool,
}

impl TurnReply {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    fn from_graph(mode: TurnMode, model: String, run: GraphRun) -> Self {
        let capability = run.executed.last().cloned();
        match &run.status {
            RunStatus::Failed => {
                let error = run.diagnostic().unwrap_or("The turn failed.").to_string();
                Self {
                    mode,
                    model,
                    message: ChatMessage::assistant(error.clone()),
                    capability,
                    success: false,
                    error: Some(error),
                    suspended: false,
                }
            }
            status => {
                let text = run.reply().map(|m| m.text().to_string());
                Self {
                    mode,
                    model,
                    message: ChatMessage::assistant(text.unwrap_or_else(|| NO_REPLY_TEXT.to_string())),
                    capability,
                    success: true,
                    error: None,
                    suspended: matches!(status, RunStatus::Suspended { .. }),
                }
            }
        }
    }
}

// =============================================================================
// Chat Service
// =============================================================================

/// Serves chat turns over the graph, dispatcher and function-calling flow.
pub struct ChatService {
    ctx: AppContext,
    graph: RwLock<Arc<ConversationGraph>>,
    dispatcher: DispatchCoordinator,
    function_calling: FunctionCallingFlow,
}

impl ChatService {
    /// Load the registry and build the conversation graph.
    pub async fn new(ctx: AppContext) -> Result<Self> {
        let snapshot = ctx.registry.load().await?;
        let graph = ctx.build_graph(&snapshot)?;

        let dispatcher = DispatchCoordinator::new(
            ctx.provider.clone(),
            ctx.router.clone(),
            ctx.registry.clone(),
            ctx.tracker.clone(),
        )
        .with_visualize_capability(ctx.graph.visualize_capability.clone());

        let mut function_calling =
            FunctionCallingFlow::new(ctx.provider.clone(), ctx.registry.clone(), ctx.tracker.clone());
        if let Some(auto_router) = &ctx.auto_router {
            function_calling = function_calling.with_auto_router(auto_router.clone());
        }

        tracing::info!(capabilities = snapshot.len(), "Chat service ready");
        Ok(Self {
            ctx,
            graph: RwLock::new(Arc::new(graph)),
            dispatcher,
            function_calling,
        })
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    async fn graph(&self) -> Arc<ConversationGraph> {
        self.graph.read().await.clone()
    }

    /// Rebuild the registry snapshot and the graph. Nothing is swapped unless
    /// both succeed.
    pub async fn reload(&self) -> Result<Arc<RegistrySnapshot>> {
        let candidate = self.ctx.registry.build_snapshot()?;
        let graph = self.ctx.build_graph(&candidate)?;
        let snapshot = self.ctx.registry.reload().await?;
        *self.graph.write().await = Arc::new(graph);
        tracing::info!(capabilities = snapshot.len(), "Capabilities reloaded");
        Ok(snapshot)
    }

    /// Descriptors visible to a context and group.
    pub async fn capabilities(&self, context: Option<&str>, group: Option<&str>) -> Vec<CapabilityDescriptor> {
        self.ctx.registry.for_context(context, group).await.descriptors
    }

    /// Serve one chat turn.
    pub async fn handle(&self, request: ChatCompletionRequest) -> Result<TurnReply> {
        if request.messages.is_empty() {
            return Err(Error::invalid_request("messages must not be empty"));
        }

        let model = request
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.ctx.default_model.clone());
        let utterance = last_user_content(&request.messages).unwrap_or_default().to_string();
        let turn = match &request.session_id {
            Some(id) => self.session_turn(id).await,
            None => 1,
        };
        let mode = self.select_mode(&request).await;

        tracing::info!(
            session_id = request.session_id.as_deref().unwrap_or(""),
            context = request.context.as_deref().unwrap_or(""),
            group = request.group_name.as_deref().unwrap_or(""),
            mode = mode.as_str(),
            model = %model,
            user = %shorten_for_log(&utterance, LOG_LIMIT),
            "Chat request"
        );

        let result = match mode {
            TurnMode::Resume => self.resume(&request, &utterance, model).await,
            TurnMode::FunctionCalling => {
                let state = self.initial_state(&request, &model, turn).await;
                self.run_function_calling(&request, state, model).await
            }
            TurnMode::Dispatch => {
                let state = self.initial_state(&request, &model, turn).await;
                self.run_dispatch(state, model).await
            }
            TurnMode::Graph => {
                let state = self.initial_state(&request, &model, turn).await;
                let graph = self.graph().await;
                graph
                    .run(state)
                    .await
                    .map(|run| TurnReply::from_graph(mode, model, run))
            }
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(mode = mode.as_str(), error = %e, "Chat turn failed");
                capgraph_governance::track_turn(mode.as_str(), "error");
                return Err(e);
            }
        };

        let outcome = if reply.failed() { "failed" } else { "ok" };
        capgraph_governance::track_turn(mode.as_str(), outcome);
        tracing::info!(
            mode = mode.as_str(),
            capability = reply.capability.as_deref().unwrap_or(""),
            outcome,
            "Chat turn finished"
        );

        if let Some(session_id) = &request.session_id {
            self.persist_turn(session_id, turn, &utterance, &reply).await;
        }
        Ok(reply)
    }

    async fn select_mode(&self, request: &ChatCompletionRequest) -> TurnMode {
        if let Some(session_id) = &request.session_id {
            match self.graph().await.has_pending(session_id).await {
                Ok(true) => return TurnMode::Resume,
                Ok(false) => {}
                Err(e) => tracing::warn!(session_id = %session_id, error = %e, "Checkpoint lookup failed"),
            }
        }
        if request.wants_function_calling() {
            TurnMode::FunctionCalling
        } else if request.context.as_deref().is_some_and(|c| !c.is_empty()) {
            TurnMode::Dispatch
        } else {
            TurnMode::Graph
        }
    }

    async fn session_turn(&self, session_id: &str) -> u32 {
        match self.ctx.store.get_or_create_session(session_id).await {
            Ok(session) => session.current_turn(),
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Session lookup failed");
                1
            }
        }
    }

    /// Stored user and assistant messages, oldest first.
    async fn history(&self, session_id: &str) -> Vec<ChatMessage> {
        match self.ctx.store.recent_messages(session_id, self.ctx.history_window).await {
            Ok(records) => records
                .into_iter()
                .filter_map(|r| match r.role {
                    Role::User => Some(ChatMessage::user(r.content)),
                    Role::Assistant => Some(ChatMessage::assistant(r.content)),
                    _ => None,
                })
                .collect(),
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "History lookup failed");
                Vec::new()
            }
        }
    }

    async fn initial_state(&self, request: &ChatCompletionRequest, model: &str, turn: u32) -> ConversationState {
        let mut messages = match &request.session_id {
            Some(id) => self.history(id).await,
            None => Vec::new(),
        };
        messages.extend(request.messages.iter().cloned());

        ConversationState::new(messages)
            .with_session(request.session_id.clone())
            .with_context(request.context.clone(), request.group_name.clone())
            .with_model(Some(model.to_string()))
            .with_turn(turn)
    }

    async fn resume(&self, request: &ChatCompletionRequest, utterance: &str, model: String) -> Result<TurnReply> {
        let session_id = request
            .session_id
            .as_deref()
            .ok_or_else(|| Error::invalid_request("resuming requires a session_id"))?;
        let run = self.graph().await.resume(session_id, utterance).await?;
        Ok(TurnReply::from_graph(TurnMode::Resume, model, run))
    }

    async fn run_function_calling(
        &self,
        request: &ChatCompletionRequest,
        state: ConversationState,
        model: String,
    ) -> Result<TurnReply> {
        let options = FunctionCallOptions {
            client_tools: request.tools.clone().unwrap_or_default(),
            tool_choice: request.tool_choice.clone(),
            tool_input: request.tool_input.clone(),
            temperature: request.temperature,
        };
        let outcome = self.function_calling.run(state, options).await?;

        let message = ChatMessage {
            role: Role::Assistant,
            name: None,
            ..outcome.response
        };
        Ok(TurnReply {
            mode: TurnMode::FunctionCalling,
            model,
            message,
            capability: outcome.server_results.last().map(|r| r.capability.clone()),
            success: outcome.server_results.iter().all(|r| r.success),
            error: None,
            suspended: false,
        })
    }

    async fn run_dispatch(&self, state: ConversationState, model: String) -> Result<TurnReply> {
        let outcome = self.dispatcher.dispatch(state).await?;
        let text = outcome.reply().map(|m| m.text().to_string()).unwrap_or_default();
        Ok(TurnReply {
            mode: TurnMode::Dispatch,
            model,
            message: ChatMessage::assistant(text),
            capability: outcome.capability,
            success: outcome.success,
            error: None,
            suspended: false,
        })
    }

    async fn persist_turn(&self, session_id: &str, turn: u32, utterance: &str, reply: &TurnReply) {
        let content = if reply.message.has_tool_calls() {
            let names: Vec<&str> = reply
                .message
                .tool_calls
                .iter()
                .map(|c| c.function.name.as_str())
                .collect();
            format!("[tool_calls] {}", names.join(", "))
        } else {
            reply.message.text().to_string()
        };

        let user = ExecutionRecord::new(session_id, Role::User, utterance).with_turn(turn);
        let mut assistant = ExecutionRecord::new(session_id, Role::Assistant, content)
            .with_turn(turn)
            .with_success(reply.success)
            .with_metadata("mode", json!(reply.mode.as_str()));
        if let Some(capability) = &reply.capability {
            assistant = assistant.with_capability(capability.clone());
        }

        for record in [user, assistant] {
            if let Err(e) = self.ctx.store.append_message(record).await {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to persist chat message");
            }
        }
        if let Err(e) = self.ctx.store.complete_turn(session_id).await {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to complete turn");
        }
    }
}

//! Mock implementations of core traits for testing.
//!
//! These fakes are shared by unit and integration tests across the workspace.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{
    traits::{
        Capability, CapabilityModule, CapabilityRouter, CompletionProvider, CompletionRequest,
        ConversationStore, DecisionSource, ExternalCapabilityProvider, RouteLabel, RouteOptions,
        RouterDecision,
    },
    types::{
        last_user_content, CapabilityDescriptor, CapabilityOutput, ChatMessage, ExecutionRecord,
        InvocationContext, RemoteWorkflow, SessionInfo, SpecialEdge,
    },
    Error, Result,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Scripted Completion Provider
// =============================================================================

/// Provider that replays a queue of assistant messages and records requests.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<ChatMessage>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ChatMessage>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Ok).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Plain assistant text replies, in order.
    pub fn texts(replies: &[&str]) -> Self {
        Self::new(replies.iter().map(|r| ChatMessage::assistant(*r)).collect())
    }

    /// A provider whose every call fails.
    pub fn failing(message: &str) -> Self {
        let provider = Self::new(Vec::new());
        lock(&provider.responses).push_back(Err(Error::provider(message)));
        provider
    }

    /// Queue another reply.
    pub fn push(&self, message: ChatMessage) {
        lock(&self.responses).push_back(Ok(message));
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<ChatMessage> {
        lock(&self.requests).push(request);
        let mut responses = lock(&self.responses);
        match responses.pop_front() {
            Some(Err(e)) => {
                let message = e.to_string();
                responses.push_front(Err(Error::provider(message.clone())));
                Err(Error::provider(message))
            }
            Some(Ok(msg)) => Ok(msg),
            None => Err(Error::provider("script exhausted")),
        }
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// Capability that returns a fixed output and records its arguments.
pub struct StaticCapability {
    descriptor: CapabilityDescriptor,
    output: CapabilityOutput,
    calls: Mutex<Vec<Value>>,
}

impl StaticCapability {
    pub fn new(name: &str, description: &str, response: &str) -> Self {
        Self {
            descriptor: CapabilityDescriptor::new(
                name,
                description,
                json!({"type": "object", "properties": {"input": {"type": "string"}}}),
            ),
            output: CapabilityOutput::text(response),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_descriptor(mut self, descriptor: CapabilityDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    pub fn with_output(mut self, output: CapabilityOutput) -> Self {
        self.output = output;
        self
    }

    pub fn calls(&self) -> Vec<Value> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

#[async_trait]
impl Capability for StaticCapability {
    fn descriptor(&self) -> CapabilityDescriptor {
        self.descriptor.clone()
    }

    async fn invoke(&self, args: Value, _ctx: &InvocationContext) -> Result<CapabilityOutput> {
        lock(&self.calls).push(args);
        Ok(self.output.clone())
    }
}

/// Capability that always fails.
pub struct FailingCapability {
    descriptor: CapabilityDescriptor,
    message: String,
}

impl FailingCapability {
    pub fn new(name: &str, message: &str) -> Self {
        Self {
            descriptor: CapabilityDescriptor::new(name, "Always fails", json!({"type": "object"})),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl Capability for FailingCapability {
    fn descriptor(&self) -> CapabilityDescriptor {
        self.descriptor.clone()
    }

    async fn invoke(&self, _args: Value, _ctx: &InvocationContext) -> Result<CapabilityOutput> {
        Err(Error::capability_execution(self.message.clone()))
    }
}

/// Module over a fixed capability list.
pub struct StaticModule {
    name: String,
    capabilities: Vec<Arc<dyn Capability>>,
    edges: Vec<SpecialEdge>,
    fail: bool,
}

impl StaticModule {
    pub fn new(name: &str, capabilities: Vec<Arc<dyn Capability>>) -> Self {
        Self {
            name: name.to_string(),
            capabilities,
            edges: Vec::new(),
            fail: false,
        }
    }

    pub fn with_edges(mut self, edges: Vec<SpecialEdge>) -> Self {
        self.edges = edges;
        self
    }

    /// A module whose construction fails.
    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name, Vec::new())
        }
    }
}

impl CapabilityModule for StaticModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Result<Vec<Arc<dyn Capability>>> {
        if self.fail {
            return Err(Error::configuration(format!("module {} failed to load", self.name)));
        }
        Ok(self.capabilities.clone())
    }

    fn edges(&self) -> Vec<SpecialEdge> {
        self.edges.clone()
    }
}

// =============================================================================
// Remote Workflows
// =============================================================================

/// In-memory workflow catalog with canned responses.
#[derive(Default)]
pub struct StaticWorkflowProvider {
    workflows: Vec<(RemoteWorkflow, Vec<String>)>,
    responses: HashMap<String, Value>,
    invocations: Mutex<Vec<(String, Value)>>,
}

impl StaticWorkflowProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow offered in the given contexts (empty means all).
    pub fn with_workflow(mut self, name: &str, description: &str, contexts: &[&str], response: Value) -> Self {
        self.workflows.push((
            RemoteWorkflow {
                name: name.to_string(),
                description: description.to_string(),
            },
            contexts.iter().map(|c| c.to_string()).collect(),
        ));
        self.responses.insert(name.to_string(), response);
        self
    }

    pub fn invocations(&self) -> Vec<(String, Value)> {
        lock(&self.invocations).clone()
    }
}

#[async_trait]
impl ExternalCapabilityProvider for StaticWorkflowProvider {
    async fn list_active(&self, context: Option<&str>, _group: Option<&str>) -> Result<Vec<RemoteWorkflow>> {
        Ok(self
            .workflows
            .iter()
            .filter(|(_, contexts)| {
                contexts.is_empty() || context.is_some_and(|c| contexts.iter().any(|x| x == c))
            })
            .map(|(w, _)| w.clone())
            .collect())
    }

    async fn invoke(&self, name: &str, args: Value) -> Result<Value> {
        lock(&self.invocations).push((name.to_string(), args));
        self.responses
            .get(name)
            .cloned()
            .ok_or_else(|| Error::remote_workflow(format!("unknown workflow {}", name)))
    }
}

// =============================================================================
// Conversation Store
// =============================================================================

/// Conversation store that records appends, optionally failing every call.
#[derive(Default)]
pub struct RecordingStore {
    records: Mutex<Vec<ExecutionRecord>>,
    sessions: Mutex<HashMap<String, SessionInfo>>,
    fail: bool,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        lock(&self.records).clone()
    }

    fn check(&self) -> Result<()> {
        if self.fail {
            return Err(Error::store("store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for RecordingStore {
    async fn append_message(&self, record: ExecutionRecord) -> Result<()> {
        self.check()?;
        lock(&self.records).push(record);
        Ok(())
    }

    async fn get_or_create_session(&self, session_id: &str) -> Result<SessionInfo> {
        self.check()?;
        Ok(lock(&self.sessions)
            .entry(session_id.to_string())
            .or_insert_with(|| SessionInfo::new(session_id))
            .clone())
    }

    async fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        self.check()?;
        let records: Vec<_> = lock(&self.records)
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect();
        let skip = records.len().saturating_sub(limit);
        Ok(records.into_iter().skip(skip).collect())
    }

    async fn complete_turn(&self, session_id: &str) -> Result<()> {
        self.check()?;
        if let Some(info) = lock(&self.sessions).get_mut(session_id) {
            info.turn_count += 1;
        }
        Ok(())
    }
}

// =============================================================================
// Router
// =============================================================================

/// Router that always returns the same label.
pub struct FixedRouter {
    label: RouteLabel,
    appended: Vec<ChatMessage>,
    calls: Mutex<usize>,
}

impl FixedRouter {
    pub fn new(label: RouteLabel) -> Self {
        Self {
            label,
            appended: Vec::new(),
            calls: Mutex::new(0),
        }
    }

    /// Messages returned as the router's own additions to the history.
    pub fn with_appended(mut self, messages: Vec<ChatMessage>) -> Self {
        self.appended = messages;
        self
    }

    pub fn capability(name: &str) -> Self {
        Self::new(RouteLabel::Capability(name.to_string()))
    }

    pub fn call_count(&self) -> usize {
        *lock(&self.calls)
    }
}

#[async_trait]
impl CapabilityRouter for FixedRouter {
    async fn decide(
        &self,
        messages: &[ChatMessage],
        _descriptors: &[CapabilityDescriptor],
        _options: &RouteOptions,
    ) -> RouterDecision {
        *lock(&self.calls) += 1;
        RouterDecision {
            label: self.label.clone(),
            last_user_utterance: last_user_content(messages).map(str::to_string),
            appended: self.appended.clone(),
            source: DecisionSource::Model,
        }
    }
}

//! Conversation state machine.
//!
//! A turn walks `Entry -> Router -> Capability* -> Terminal`. Capabilities
//! move to the terminal unless a special edge redirects them; designated
//! capabilities suspend the run at `HumanApproval` until the user replies.

use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use capgraph_core::{
    config::TrackerConfig,
    traits::{Capability, CapabilityRouter, Checkpoint, CheckpointStore, RouteLabel, RouteOptions},
    types::{
        CapabilityDescriptor, CapabilityOutput, ChatMessage, ConversationState, EdgeRoute,
        InvocationRequest, SpecialEdge, LABEL_END, LABEL_ERROR,
    },
    Error, Result,
};
use capgraph_skills::RegistrySnapshot;

use crate::persistence::InMemoryCheckpointStore;
use crate::tracker::ExecutionTracker;

const ROUTER_NODE: &str = "router";
const ENTRY_NODE: &str = "entry";
const RESERVED: [&str; 4] = [ROUTER_NODE, ENTRY_NODE, LABEL_END, LABEL_ERROR];

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    Done,
    Error,
}

/// A state in the conversation graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphNode {
    Entry,
    Router,
    Capability(String),
    /// Waiting for a human; `resume` is where the run continues.
    HumanApproval { resume: Box<GraphNode> },
    Terminal(TerminalKind),
}

impl GraphNode {
    fn checkpoint_key(&self) -> String {
        match self {
            Self::Entry => ENTRY_NODE.into(),
            Self::Router => ROUTER_NODE.into(),
            Self::Capability(name) => name.clone(),
            Self::HumanApproval { resume } => resume.checkpoint_key(),
            Self::Terminal(TerminalKind::Done) => LABEL_END.into(),
            Self::Terminal(TerminalKind::Error) => LABEL_ERROR.into(),
        }
    }
}

/// Outgoing transition of a capability node.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Transition {
    Standard(String),
    Conditional(Vec<String>),
}

/// Final status of a graph run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed,
    /// Suspended after `capability`, awaiting a human reply.
    Suspended { capability: String },
}

/// Result of running or resuming the graph.
#[derive(Debug, Clone)]
pub struct GraphRun {
    pub state: ConversationState,
    pub status: RunStatus,
    /// Capabilities executed during this run, in order.
    pub executed: Vec<String>,
    /// Index of the first message appended during this run.
    pub first_new_message: usize,
}

impl GraphRun {
    /// Latest assistant reply produced during this run, excluding router output.
    pub fn reply(&self) -> Option<&ChatMessage> {
        self.state.messages()[self.first_new_message..]
            .iter()
            .rev()
            .find(|m| {
                m.role == capgraph_core::Role::Assistant && m.name.as_deref() != Some(ROUTER_NODE)
            })
    }

    /// Latest diagnostic produced during this run.
    pub fn diagnostic(&self) -> Option<&str> {
        self.state.messages()[self.first_new_message..]
            .iter()
            .rev()
            .find(|m| m.role == capgraph_core::Role::System && m.name.as_deref() == Some(LABEL_ERROR))
            .map(|m| m.text())
    }
}

/// Validated conversation graph.
pub struct ConversationGraph {
    capabilities: HashMap<String, Arc<dyn Capability>>,
    descriptors: Vec<CapabilityDescriptor>,
    transitions: HashMap<String, Transition>,
    approval: HashSet<String>,
    router: Arc<dyn CapabilityRouter>,
    tracker: Arc<ExecutionTracker>,
    checkpoints: Arc<dyn CheckpointStore>,
    max_steps: usize,
}

impl ConversationGraph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    pub fn descriptors(&self) -> &[CapabilityDescriptor] {
        &self.descriptors
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    /// Whether a checkpoint is waiting for this session.
    pub async fn has_pending(&self, session_id: &str) -> Result<bool> {
        Ok(self.checkpoints.load(session_id).await?.is_some())
    }

    /// Run a fresh turn starting at the router.
    pub async fn run(&self, state: ConversationState) -> Result<GraphRun> {
        self.execute(state, GraphNode::Entry).await
    }

    /// Continue a suspended run with the user's reply.
    pub async fn resume(&self, session_id: &str, reply: &str) -> Result<GraphRun> {
        let checkpoint = self
            .checkpoints
            .take(session_id)
            .await?
            .ok_or_else(|| Error::checkpoint(format!("no pending approval for session {}", session_id)))?;

        let node = self.node_from_key(&checkpoint.resume_node)?;
        let mut state = checkpoint.state;
        state.append(ChatMessage::user(reply));
        state.original_input = Some(reply.to_string());

        tracing::info!(session_id = %session_id, resume = %checkpoint.resume_node, "Resuming suspended run");
        self.execute(state, node).await
    }

    fn node_from_key(&self, key: &str) -> Result<GraphNode> {
        match key {
            ENTRY_NODE => Ok(GraphNode::Entry),
            ROUTER_NODE => Ok(GraphNode::Router),
            LABEL_END => Ok(GraphNode::Terminal(TerminalKind::Done)),
            LABEL_ERROR => Ok(GraphNode::Terminal(TerminalKind::Error)),
            name if self.capabilities.contains_key(name) => Ok(GraphNode::Capability(name.to_string())),
            other => Err(Error::checkpoint(format!("unknown resume node '{}'", other))),
        }
    }

    async fn execute(&self, mut state: ConversationState, start: GraphNode) -> Result<GraphRun> {
        let first_new_message = state.len();
        let mut executed = Vec::new();
        let mut node = start;
        let mut steps = 0usize;

        loop {
            steps += 1;
            if steps > self.max_steps {
                tracing::error!(max_steps = self.max_steps, "Step bound exceeded");
                state.append(diagnostic(format!(
                    "Turn aborted after {} steps; the capability graph may contain a cycle.",
                    self.max_steps
                )));
                node = GraphNode::Terminal(TerminalKind::Error);
            }

            node = match node {
                GraphNode::Entry => GraphNode::Router,
                GraphNode::Router => self.route(&mut state).await,
                GraphNode::Capability(name) => {
                    let next = self.run_capability(&name, &mut state).await;
                    executed.push(name);
                    next
                }
                GraphNode::HumanApproval { resume } => {
                    let capability = executed.last().cloned().unwrap_or_default();
                    match state.session_id.clone() {
                        Some(session_id) => {
                            let checkpoint = Checkpoint {
                                resume_node: resume.checkpoint_key(),
                                state: state.clone(),
                            };
                            self.checkpoints.save(&session_id, checkpoint).await?;
                            tracing::info!(session_id = %session_id, capability = %capability, "Run suspended for human approval");
                            return Ok(GraphRun {
                                state,
                                status: RunStatus::Suspended { capability },
                                executed,
                                first_new_message,
                            });
                        }
                        None => {
                            tracing::warn!(capability = %capability, "No session id; cannot suspend for approval");
                            GraphNode::Terminal(TerminalKind::Done)
                        }
                    }
                }
                GraphNode::Terminal(kind) => {
                    let status = match kind {
                        TerminalKind::Done => RunStatus::Completed,
                        TerminalKind::Error => RunStatus::Failed,
                    };
                    return Ok(GraphRun {
                        state,
                        status,
                        executed,
                        first_new_message,
                    });
                }
            };
        }
    }

    async fn route(&self, state: &mut ConversationState) -> GraphNode {
        let options = RouteOptions {
            model: state.model.clone(),
            temperature: None,
            session_id: state.session_id.clone(),
            turn_number: state.turn_number,
            allow_override: true,
        };
        let visible: Vec<CapabilityDescriptor> = self
            .descriptors
            .iter()
            .filter(|d| d.matches(state.context.as_deref(), state.group.as_deref()))
            .cloned()
            .collect();
        let decision = self.router.decide(state.messages(), &visible, &options).await;
        state.extend(decision.appended);
        state.routing_decision = Some(decision.label.as_str().to_string());
        if let Some(utterance) = decision.last_user_utterance {
            state.original_input = Some(utterance);
        }

        match decision.label {
            RouteLabel::End => GraphNode::Terminal(TerminalKind::Done),
            RouteLabel::Error => GraphNode::Terminal(TerminalKind::Error),
            RouteLabel::Capability(name) if self.capabilities.contains_key(&name) => GraphNode::Capability(name),
            RouteLabel::Capability(name) => {
                state.append(diagnostic(format!("Router selected unknown capability '{}'.", name)));
                GraphNode::Terminal(TerminalKind::Error)
            }
        }
    }

    async fn run_capability(&self, name: &str, state: &mut ConversationState) -> GraphNode {
        let Some(capability) = self.capabilities.get(name) else {
            state.append(diagnostic(format!("Capability '{}' is not available.", name)));
            return GraphNode::Terminal(TerminalKind::Error);
        };

        let input = state
            .original_input
            .clone()
            .or_else(|| state.last_user_message().map(str::to_string))
            .unwrap_or_default();
        let request = InvocationRequest::new(name, json!({ "input": input }));
        let tracked = self.tracker.run(capability, request, &state.invocation_context()).await;

        if !tracked.output.success || tracked.output.is_error_route() {
            state.append(diagnostic(format!(
                "Capability '{}' failed: {}",
                name, tracked.output.content
            )));
            return GraphNode::Terminal(TerminalKind::Error);
        }

        state.append(ChatMessage::assistant(tracked.output.content.clone()).with_name(name));
        let next = self.transition(name, &tracked.output);

        if self.approval.contains(name) {
            return GraphNode::HumanApproval { resume: Box::new(next) };
        }
        next
    }

    fn transition(&self, name: &str, output: &CapabilityOutput) -> GraphNode {
        match self.transitions.get(name) {
            None => GraphNode::Terminal(TerminalKind::Done),
            Some(Transition::Standard(target)) => GraphNode::Capability(target.clone()),
            Some(Transition::Conditional(targets)) => match &output.next {
                Some(next) if targets.contains(next) => GraphNode::Capability(next.clone()),
                _ => GraphNode::Terminal(TerminalKind::Done),
            },
        }
    }
}

fn diagnostic(message: String) -> ChatMessage {
    ChatMessage::system(message).with_name(LABEL_ERROR)
}

/// Builder for constructing a ConversationGraph.
pub struct GraphBuilder {
    capabilities: Vec<Arc<dyn Capability>>,
    edges: Vec<SpecialEdge>,
    approval: Vec<String>,
    router: Option<Arc<dyn CapabilityRouter>>,
    tracker: Option<Arc<ExecutionTracker>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    max_steps: usize,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            capabilities: Vec::new(),
            edges: Vec::new(),
            approval: Vec::new(),
            router: None,
            tracker: None,
            checkpoints: None,
            max_steps: 16,
        }
    }

    /// Add every capability and edge of a registry snapshot.
    pub fn with_snapshot(mut self, snapshot: &RegistrySnapshot) -> Self {
        for descriptor in snapshot.descriptors() {
            if let Some(cap) = snapshot.get(&descriptor.name) {
                self.capabilities.push(cap);
            }
        }
        self.edges.extend(snapshot.edges().iter().cloned());
        self
    }

    pub fn with_capability(mut self, capability: Arc<dyn Capability>) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_edge(mut self, edge: SpecialEdge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Designate capabilities that suspend the run for human approval.
    pub fn with_approval(mut self, names: Vec<String>) -> Self {
        self.approval.extend(names);
        self
    }

    pub fn with_router(mut self, router: Arc<dyn CapabilityRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<ExecutionTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// Validate names and edges and build the graph.
    pub fn build(self) -> Result<ConversationGraph> {
        let router = self
            .router
            .ok_or_else(|| Error::configuration("conversation graph requires a router"))?;

        let mut capabilities = HashMap::new();
        let mut descriptors = Vec::new();
        for capability in self.capabilities {
            let descriptor = capability.descriptor();
            if RESERVED.contains(&descriptor.name.as_str()) {
                return Err(Error::configuration(format!(
                    "'{}' is a reserved node name",
                    descriptor.name
                )));
            }
            if capabilities.contains_key(&descriptor.name) {
                return Err(Error::configuration(format!(
                    "duplicate capability '{}' in graph",
                    descriptor.name
                )));
            }
            capabilities.insert(descriptor.name.clone(), capability);
            descriptors.push(descriptor);
        }

        let mut transitions = HashMap::new();
        for edge in self.edges {
            for name in std::iter::once(edge.source.as_str()).chain(edge.targets()) {
                if !capabilities.contains_key(name) {
                    return Err(Error::configuration(format!(
                        "special edge from '{}' references unknown capability '{}'",
                        edge.source, name
                    )));
                }
            }
            let transition = match edge.route {
                EdgeRoute::Standard { target } => Transition::Standard(target),
                EdgeRoute::Conditional { targets } => Transition::Conditional(targets),
            };
            if transitions.insert(edge.source.clone(), transition).is_some() {
                return Err(Error::configuration(format!(
                    "capability '{}' declares more than one special edge",
                    edge.source
                )));
            }
        }

        let mut approval = HashSet::new();
        for name in self.approval {
            if !capabilities.contains_key(&name) {
                return Err(Error::configuration(format!(
                    "approval designation references unknown capability '{}'",
                    name
                )));
            }
            approval.insert(name);
        }

        let tracker = self
            .tracker
            .unwrap_or_else(|| Arc::new(ExecutionTracker::new(&TrackerConfig {
                preview_limit: 100,
                content_limit: 200,
                timeout_ms: 60_000,
            })));
        let checkpoints = self
            .checkpoints
            .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new()));

        tracing::info!(
            capabilities = capabilities.len(),
            edges = transitions.len(),
            approvals = approval.len(),
            "Conversation graph built"
        );

        Ok(ConversationGraph {
            capabilities,
            descriptors,
            transitions,
            approval,
            router,
            tracker,
            checkpoints,
            max_steps: self.max_steps,
        })
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

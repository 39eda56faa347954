//! Capability registry implementation.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use capgraph_core::{
    traits::{Capability, CapabilityModule, ExternalCapabilityProvider},
    types::{
        CapabilityDescriptor, CapabilityKind, CapabilityOutput, InvocationContext, RemoteWorkflow,
        SpecialEdge, RUN_BEST_WORKFLOW,
    },
    Error, Result,
};

/// Immutable view of every loaded capability.
#[derive(Default)]
pub struct RegistrySnapshot {
    entries: HashMap<String, Arc<dyn Capability>>,
    /// Descriptors in load order.
    descriptors: Vec<CapabilityDescriptor>,
    edges: Vec<SpecialEdge>,
}

impl RegistrySnapshot {
    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.entries.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn descriptors(&self) -> &[CapabilityDescriptor] {
        &self.descriptors
    }

    pub fn edges(&self) -> &[SpecialEdge] {
        &self.edges
    }

    pub fn capabilities(&self) -> impl Iterator<Item = (&String, &Arc<dyn Capability>)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Capabilities visible to one context and group.
pub struct ContextView {
    /// Local descriptors, plus the synthetic workflow delegate when any
    /// remote workflow is active.
    pub descriptors: Vec<CapabilityDescriptor>,
    pub capabilities: HashMap<String, Arc<dyn Capability>>,
    pub workflows: Vec<RemoteWorkflow>,
    remote: Option<Arc<dyn ExternalCapabilityProvider>>,
}

impl ContextView {
    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.descriptors.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn has_workflows(&self) -> bool {
        !self.workflows.is_empty()
    }

    /// Invocable adapter for one of this view's remote workflows.
    pub fn workflow(&self, name: &str) -> Option<Arc<dyn Capability>> {
        let remote = self.remote.as_ref()?;
        let workflow = self.workflows.iter().find(|w| w.name == name)?;
        Some(Arc::new(RemoteWorkflowCapability::new(remote.clone(), workflow.clone())))
    }
}

/// Registry built from a static list of capability modules.
pub struct CapabilityRegistry {
    modules: Vec<Arc<dyn CapabilityModule>>,
    remote: Option<Arc<dyn ExternalCapabilityProvider>>,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

impl CapabilityRegistry {
    /// Create a registry. Modules are enumerated in name order.
    pub fn new(mut modules: Vec<Arc<dyn CapabilityModule>>) -> Self {
        modules.sort_by(|a, b| a.name().cmp(b.name()));
        Self {
            modules,
            remote: None,
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::default())),
        }
    }

    /// Attach a remote workflow catalog.
    pub fn with_remote(mut self, remote: Arc<dyn ExternalCapabilityProvider>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Build a fresh snapshot without publishing it.
    pub fn build_snapshot(&self) -> Result<RegistrySnapshot> {
        let mut snapshot = RegistrySnapshot::default();

        for module in &self.modules {
            let capabilities = match module.capabilities() {
                Ok(caps) => caps,
                Err(e) => {
                    tracing::error!(module = %module.name(), error = %e, "Skipping capability module");
                    continue;
                }
            };

            for capability in capabilities {
                let descriptor = capability.descriptor();
                if let Err(reason) = descriptor.validate() {
                    tracing::warn!(module = %module.name(), reason = %reason, "Dropping malformed capability");
                    continue;
                }
                if snapshot.entries.contains_key(&descriptor.name) {
                    return Err(Error::configuration(format!(
                        "Capability '{}' is registered more than once",
                        descriptor.name
                    )));
                }
                tracing::debug!(module = %module.name(), capability = %descriptor.name, "Registering capability");
                snapshot.entries.insert(descriptor.name.clone(), capability);
                snapshot.descriptors.push(descriptor);
            }

            snapshot.edges.extend(module.edges());
        }

        let known: HashSet<&str> = snapshot.entries.keys().map(String::as_str).collect();
        let (edges, dropped): (Vec<_>, Vec<_>) = snapshot.edges.into_iter().partition(|edge| {
            known.contains(edge.source.as_str()) && edge.targets().iter().all(|t| known.contains(t))
        });
        for edge in dropped {
            tracing::warn!(source = %edge.source, "Dropping special edge with unknown endpoint");
        }
        snapshot.edges = edges;

        Ok(snapshot)
    }

    /// Build and publish the initial snapshot.
    pub async fn load(&self) -> Result<Arc<RegistrySnapshot>> {
        let snapshot = Arc::new(self.build_snapshot()?);
        *self.snapshot.write().await = snapshot.clone();
        tracing::info!(capabilities = snapshot.len(), "Capability registry loaded");
        Ok(snapshot)
    }

    /// Rebuild and swap the published snapshot. On failure the previous
    /// snapshot stays in place.
    pub async fn reload(&self) -> Result<Arc<RegistrySnapshot>> {
        match self.load().await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                tracing::error!(error = %e, "Registry reload failed; keeping previous snapshot");
                Err(e)
            }
        }
    }

    /// Currently published snapshot.
    pub async fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Capabilities visible to a context and group.
    pub async fn for_context(&self, context: Option<&str>, group: Option<&str>) -> ContextView {
        let snapshot = self.snapshot().await;

        let mut descriptors = Vec::new();
        let mut capabilities = HashMap::new();
        for descriptor in snapshot.descriptors() {
            if !descriptor.matches(context, group) {
                continue;
            }
            if let Some(cap) = snapshot.get(&descriptor.name) {
                capabilities.insert(descriptor.name.clone(), cap);
                descriptors.push(descriptor.clone());
            }
        }

        let workflows = match &self.remote {
            Some(remote) => match remote.list_active(context, group).await {
                Ok(list) => list,
                Err(e) => {
                    tracing::warn!(error = %e, "Remote workflow listing failed");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        if !workflows.is_empty() {
            descriptors.push(workflow_delegate_descriptor(&workflows));
        }

        ContextView {
            descriptors,
            capabilities,
            workflows,
            remote: self.remote.clone(),
        }
    }
}

/// Synthetic descriptor that stands in for every active remote workflow.
pub fn workflow_delegate_descriptor(workflows: &[RemoteWorkflow]) -> CapabilityDescriptor {
    let names: Vec<&str> = workflows.iter().map(|w| w.name.as_str()).collect();
    CapabilityDescriptor::new(
        RUN_BEST_WORKFLOW,
        format!(
            "Delegate the request to the most suitable remote workflow ({})",
            names.join(", ")
        ),
        json!({
            "type": "object",
            "properties": {"input": {"type": "string", "description": "The user's request"}},
            "required": ["input"]
        }),
    )
    .with_kind(CapabilityKind::RemoteDelegate)
}

/// Adapter exposing one remote workflow as a capability.
pub struct RemoteWorkflowCapability {
    remote: Arc<dyn ExternalCapabilityProvider>,
    workflow: RemoteWorkflow,
}

impl RemoteWorkflowCapability {
    pub fn new(remote: Arc<dyn ExternalCapabilityProvider>, workflow: RemoteWorkflow) -> Self {
        Self { remote, workflow }
    }
}

#[async_trait]
impl Capability for RemoteWorkflowCapability {
    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            self.workflow.name.clone(),
            self.workflow.description.clone(),
            json!({"type": "object", "properties": {"input": {"type": "string"}}}),
        )
        .with_kind(CapabilityKind::RemoteDelegate)
    }

    async fn invoke(&self, args: Value, _ctx: &InvocationContext) -> Result<CapabilityOutput> {
        let input = match args.get("input") {
            Some(Value::String(s)) => Value::String(s.clone()),
            _ => args,
        };
        let result = self.remote.invoke(&self.workflow.name, input).await?;
        let content = match &result {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Ok(CapabilityOutput::text(content).with_data(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capgraph_core::mocks::{StaticCapability, StaticModule, StaticWorkflowProvider};

    fn cap(name: &str) -> Arc<dyn Capability> {
        Arc::new(StaticCapability::new(name, "test capability", "ok"))
    }

    fn names(snapshot: &RegistrySnapshot) -> Vec<String> {
        let mut names: Vec<_> = snapshot.descriptors().iter().map(|d| d.name.clone()).collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_load_twice_is_stable() {
        let registry = CapabilityRegistry::new(vec![
            Arc::new(StaticModule::new("zeta", vec![cap("z1")])),
            Arc::new(StaticModule::new("alpha", vec![cap("a1"), cap("a2")])),
        ]);
        let first = registry.load().await.unwrap();
        let second = registry.load().await.unwrap();
        assert_eq!(names(&first), names(&second));
        assert_eq!(first.descriptors(), second.descriptors());
        // Modules load in name order.
        assert_eq!(first.descriptors()[0].name, "a1");
    }

    #[tokio::test]
    async fn test_duplicate_name_is_fatal() {
        let registry = CapabilityRegistry::new(vec![
            Arc::new(StaticModule::new("one", vec![cap("same")])),
            Arc::new(StaticModule::new("two", vec![cap("same")])),
        ]);
        let err = registry.load().await.err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_failing_module_is_skipped() {
        let registry = CapabilityRegistry::new(vec![
            Arc::new(StaticModule::failing("broken")),
            Arc::new(StaticModule::new("good", vec![cap("greet")])),
        ]);
        let snapshot = registry.load().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains("greet"));
    }

    #[tokio::test]
    async fn test_malformed_entries_are_dropped() {
        let bad: Arc<dyn Capability> = Arc::new(
            StaticCapability::new("x", "", "").with_descriptor(CapabilityDescriptor::new(
                "has space",
                "bad",
                json!({"type": "object"}),
            )),
        );
        let registry = CapabilityRegistry::new(vec![Arc::new(StaticModule::new(
            "mixed",
            vec![bad, cap("fine")],
        ))]);
        let snapshot = registry.load().await.unwrap();
        assert_eq!(names(&snapshot), vec!["fine".to_string()]);
    }

    #[tokio::test]
    async fn test_edges_with_unknown_endpoints_are_dropped() {
        let module = StaticModule::new("edges", vec![cap("a"), cap("b")]).with_edges(vec![
            SpecialEdge::standard("a", "b"),
            SpecialEdge::standard("a", "missing"),
        ]);
        let registry = CapabilityRegistry::new(vec![Arc::new(module)]);
        let snapshot = registry.load().await.unwrap();
        assert_eq!(snapshot.edges().len(), 1);
    }

    #[tokio::test]
    async fn test_reload_swaps_snapshot() {
        let registry = CapabilityRegistry::new(vec![Arc::new(StaticModule::new("m", vec![cap("a")]))]);
        assert!(registry.snapshot().await.is_empty());
        let before = registry.load().await.unwrap();
        let after = registry.reload().await.unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(Arc::ptr_eq(&after, &registry.snapshot().await));
    }

    #[tokio::test]
    async fn test_for_context_filters_and_adds_delegate() {
        let restricted: Arc<dyn Capability> = Arc::new(
            StaticCapability::new("refund", "", "").with_descriptor(
                CapabilityDescriptor::new("refund", "Issue a refund", json!({"type": "object"}))
                    .with_contexts(vec!["support".into()]),
            ),
        );
        let remote = Arc::new(StaticWorkflowProvider::new().with_workflow(
            "billing",
            "Billing questions",
            &["support"],
            json!("ok"),
        ));
        let registry = CapabilityRegistry::new(vec![Arc::new(StaticModule::new(
            "m",
            vec![restricted, cap("greet")],
        ))])
        .with_remote(remote);
        registry.load().await.unwrap();

        let support = registry.for_context(Some("support"), None).await;
        assert_eq!(support.names(), vec!["refund", "greet", RUN_BEST_WORKFLOW]);
        assert!(support.workflow("billing").is_some());
        assert!(support.get(RUN_BEST_WORKFLOW).is_none());

        let sales = registry.for_context(Some("sales"), None).await;
        assert_eq!(sales.names(), vec!["greet"]);
        assert!(!sales.has_workflows());
    }

    #[tokio::test]
    async fn test_remote_workflow_capability_passes_input() {
        let remote = Arc::new(StaticWorkflowProvider::new().with_workflow(
            "shipping",
            "Shipping",
            &[],
            json!({"status": "in transit"}),
        ));
        let capability = RemoteWorkflowCapability::new(
            remote.clone(),
            RemoteWorkflow {
                name: "shipping".into(),
                description: "Shipping".into(),
            },
        );
        let out = capability
            .invoke(json!({"input": "where is my parcel"}), &InvocationContext::default())
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.data, Some(json!({"status": "in transit"})));
        assert_eq!(remote.invocations()[0].1, json!("where is my parcel"));
    }
}

//! Tracked capability execution.
//!
//! Every capability call in the engine goes through [`ExecutionTracker::run`],
//! which times it, bounds it with a timeout, records the outcome in the
//! conversation store and converts failures into a well-formed error output.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use capgraph_core::{
    config::TrackerConfig,
    traits::{Capability, ConversationStore},
    types::{
        CapabilityOutput, ExecutionRecord, InvocationContext, InvocationRequest, InvocationResult,
        Role,
    },
};

/// Outcome of one tracked invocation.
#[derive(Debug, Clone)]
pub struct TrackedInvocation {
    pub output: CapabilityOutput,
    pub result: InvocationResult,
    /// Output preview cut at the configured character bound.
    pub preview: String,
}

impl TrackedInvocation {
    pub fn success(&self) -> bool {
        self.output.success
    }
}

/// Wraps capability calls with timing, logging, metrics and failure containment.
pub struct ExecutionTracker {
    store: Option<Arc<dyn ConversationStore>>,
    preview_limit: usize,
    content_limit: usize,
    timeout: Duration,
}

/// First `limit` characters of `text`.
pub fn preview(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

impl ExecutionTracker {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            store: None,
            preview_limit: config.preview_limit,
            content_limit: config.content_limit,
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    /// Persist execution records to this store.
    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Invoke a capability. Never fails: errors and timeouts become an
    /// error output routed to `error`.
    pub async fn run(
        &self,
        capability: &Arc<dyn Capability>,
        request: InvocationRequest,
        ctx: &InvocationContext,
    ) -> TrackedInvocation {
        let name = request.capability.clone();
        tracing::info!(capability = %name, invocation_id = %request.id, "Executing capability");

        let start = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, capability.invoke(request.arguments.clone(), ctx)).await;
        let elapsed = start.elapsed();
        let duration_ms = elapsed.as_millis() as u64;

        let output = match outcome {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::error!(capability = %name, error = %e, duration_ms, "Capability failed");
                CapabilityOutput::error(e.to_string())
            }
            Err(_) => {
                tracing::error!(capability = %name, timeout_ms = self.timeout.as_millis() as u64, "Capability timed out");
                CapabilityOutput::error(format!(
                    "Capability '{}' timed out after {} ms",
                    name,
                    self.timeout.as_millis()
                ))
            }
        };

        let preview = preview(&output.content, self.preview_limit);
        if output.success {
            tracing::info!(capability = %name, duration_ms, preview = %preview, "Capability succeeded");
        }

        capgraph_governance::track_capability(&name, output.success, elapsed);
        self.record(&name, &request.arguments, &output, &preview, duration_ms, ctx).await;

        let result = InvocationResult {
            id: request.id,
            capability: name,
            payload: output.payload(),
            success: output.success,
            duration_ms,
        };

        TrackedInvocation {
            output,
            result,
            preview,
        }
    }

    async fn record(
        &self,
        name: &str,
        arguments: &Value,
        output: &CapabilityOutput,
        result_preview: &str,
        duration_ms: u64,
        ctx: &InvocationContext,
    ) {
        let (Some(store), Some(session_id)) = (&self.store, &ctx.session_id) else {
            return;
        };

        let content = if output.success {
            let mut body = preview(&output.content, self.content_limit);
            if output.content.chars().count() > self.content_limit {
                body.push_str("...");
            }
            format!("[capability] {}: {}", name, body)
        } else {
            format!("[capability] {} failed: {}", name, output.content)
        };

        let mut record = ExecutionRecord::new(session_id.clone(), Role::Tool, content)
            .with_turn(ctx.turn_number)
            .with_capability(name)
            .with_duration(duration_ms)
            .with_success(output.success)
            .with_metadata("execution_time_ms", json!(duration_ms))
            .with_metadata("arguments", arguments.clone());
        record = if output.success {
            record.with_metadata("result_preview", json!(result_preview))
        } else {
            record.with_metadata("error", json!(output.content))
        };

        if let Err(e) = store.append_message(record).await {
            tracing::warn!(capability = %name, error = %e, "Failed to persist execution record");
        }
    }
}

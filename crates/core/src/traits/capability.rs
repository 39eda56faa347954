//! Capability plugin traits.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{CapabilityDescriptor, CapabilityOutput, InvocationContext, SpecialEdge};

/// A named, independently invocable unit of work.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Descriptor shown to routers and clients.
    fn descriptor(&self) -> CapabilityDescriptor;

    /// Execute with parsed arguments.
    async fn invoke(&self, args: Value, ctx: &InvocationContext) -> Result<CapabilityOutput>;
}

/// A group of capabilities contributed together, plus their special edges.
pub trait CapabilityModule: Send + Sync {
    /// Stable module name, used for ordering.
    fn name(&self) -> &str;

    /// Construct the module's capabilities. An error skips the module.
    fn capabilities(&self) -> Result<Vec<Arc<dyn Capability>>>;

    /// Non-default transitions between this module's capabilities.
    fn edges(&self) -> Vec<SpecialEdge> {
        Vec::new()
    }
}

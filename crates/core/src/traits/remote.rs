//! Remote workflow traits.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::types::RemoteWorkflow;

/// Catalog and executor for remotely hosted workflows.
#[async_trait]
pub trait ExternalCapabilityProvider: Send + Sync {
    /// Workflows active for the given context and group.
    async fn list_active(
        &self,
        context: Option<&str>,
        group: Option<&str>,
    ) -> Result<Vec<RemoteWorkflow>>;

    /// Run a workflow by exact name.
    async fn invoke(&self, name: &str, args: Value) -> Result<Value>;
}
